//! Filesystem jail for workload data directories.
//!
//! Every path a workload touches is resolved through a [`Jail`] rooted at that
//! workload's data directory. Resolution follows symlinks to their final target and
//! rejects anything that lands outside the root, so a crafted link inside the data
//! directory can never be used to read, size or chown host files.

pub mod error;
pub mod jail;
pub mod usage;
pub mod walk;

pub use error::{JailError, JailResult};
pub use jail::Jail;
pub use usage::DiskUsage;
pub use walk::{Visit, Visitor};
