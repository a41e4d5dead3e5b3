//! Bounded ring of recent log lines with lossy subscriber fan-out.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use stasium_core::LogLine;

/// Lines retained per stream.
pub const RING_CAPACITY: usize = 1000;

/// Buffered lines per subscriber; a full subscriber drops the line.
pub const SUBSCRIBER_BUFFER: usize = 100;

/// A ring buffer of recent [`LogLine`]s for one stream, fanning out to live
/// subscribers without ever blocking the writer.
#[derive(Default)]
pub struct LogRing {
    inner: Mutex<RingInner>,
}

#[derive(Default)]
struct RingInner {
    lines: VecDeque<LogLine>,
    subs: Vec<mpsc::Sender<LogLine>>,
}

impl LogRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line, trimming to capacity, and fan out to subscribers.
    /// Subscribers with a full buffer miss this line; closed subscribers are
    /// dropped.
    pub fn write(&self, item_id: &str, stream: &str, line: String) {
        let entry = LogLine {
            item_id: item_id.to_owned(),
            ts_unix_ms: chrono::Utc::now().timestamp_millis(),
            stream: stream.to_owned(),
            line,
        };

        let mut inner = self.inner.lock();
        inner.lines.push_back(entry.clone());
        while inner.lines.len() > RING_CAPACITY {
            inner.lines.pop_front();
        }
        inner.subs.retain(|sub| match sub.try_send(entry.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Attach a subscriber channel for future lines.
    pub fn attach(&self, sub: mpsc::Sender<LogLine>) {
        self.inner.lock().subs.push(sub);
    }

    /// The most recent `n` retained lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let inner = self.inner.lock();
        let skip = inner.lines.len().saturating_sub(n);
        inner.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
