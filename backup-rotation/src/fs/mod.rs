//! File system queries used around a backup run.

pub mod disk;
pub mod walker;

pub use disk::DiskUsage;
pub use walker::{measure_footprint, Footprint};
