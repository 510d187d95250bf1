//! Access to the shared metrics region.
//!
//! The `RegionSource` trait hands out a read-only view of the region for the
//! duration of one closure call. The view is released on every exit path,
//! so nothing derived from it may outlive the call.
//!
//! ```text
//!        ┌──────────────┐
//!        │    Poller    │
//!        └──────┬───────┘
//!               │ with_region(|bytes| decode(bytes))
//!        ┌──────▼───────┐
//!        │ RegionSource │ (trait)
//!        └──────┬───────┘
//!       ┌───────┴────────┐
//! ┌─────▼──────┐  ┌──────▼─────┐
//! │ FileRegion │  │ MockRegion │
//! │   (file)   │  │ (testing)  │
//! └────────────┘  └────────────┘
//! ```

mod file;
pub mod mock;

pub use file::FileRegion;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Scoped, read-only access to the producer's region.
pub trait RegionSource: Send + Sync {
    /// Acquires the region, runs `f` on its bytes, and releases it before
    /// returning, whether or not `f` succeeded.
    fn with_region<R, F>(&self, f: F) -> Result<R, AcquisitionError>
    where
        F: FnOnce(&[u8]) -> R;
}

/// The region could not be acquired this cycle. Always recoverable: the
/// poller retries on its next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    /// The region file does not exist (producer not running yet).
    NotFound(PathBuf),
    PermissionDenied(PathBuf),
    /// The file exists but holds no bytes yet.
    Empty(PathBuf),
    Io { path: PathBuf, message: String },
}

impl AcquisitionError {
    pub(crate) fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => AcquisitionError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => {
                AcquisitionError::PermissionDenied(path.to_path_buf())
            }
            _ => AcquisitionError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            },
        }
    }
}

impl fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionError::NotFound(path) => {
                write!(f, "region {} not found", path.display())
            }
            AcquisitionError::PermissionDenied(path) => {
                write!(f, "permission denied for region {}", path.display())
            }
            AcquisitionError::Empty(path) => write!(f, "region {} is empty", path.display()),
            AcquisitionError::Io { path, message } => {
                write!(f, "I/O error on region {}: {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for AcquisitionError {}
