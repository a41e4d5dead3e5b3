//! A single log entry from any log source.

use serde::{Deserialize, Serialize};

/// One decoded log line, stamped at capture time.
///
/// `stream` labels the origin: `stdout`, `stderr`, `journal`, `file`, or
/// `container`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub item_id: String,
    pub ts_unix_ms: i64,
    pub stream: String,
    pub line: String,
}
