//! Concrete item providers behind the [`stasium_core::Provider`] contract.

pub mod container;
pub mod filetail;
pub mod os_unit;
pub mod procfs;
pub mod supervised;

pub use container::ContainerProvider;
pub use filetail::FiletailProvider;
pub use os_unit::OsUnitProvider;
pub use procfs::ProcfsProvider;
pub use supervised::SupervisedProvider;
