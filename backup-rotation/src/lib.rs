//! Backup Rotation Library
//!
//! Rotating full and hard-linked incremental backups driven by rsync. The
//! destination directory listing is the catalog; there is no index file.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod notify;
pub mod rotation;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{Result, RotationError};
