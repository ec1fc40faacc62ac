//! Disk capacity query for the backup destination.

use crate::Result;
use nix::sys::statvfs::statvfs;
use serde::Serialize;
use std::path::Path;

const BYTES_PER_GB: f64 = (1u64 << 30) as f64;

/// Capacity of the filesystem holding a path, at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// Space available to unprivileged users
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn query(path: &Path) -> Result<Self> {
        let stat = statvfs(path)?;
        let frsize = stat.fragment_size() as u64;
        let blocks = stat.blocks() as u64;

        Ok(Self {
            total_bytes: blocks * frsize,
            used_bytes: blocks.saturating_sub(stat.blocks_free() as u64) * frsize,
            free_bytes: stat.blocks_available() as u64 * frsize,
        })
    }

    pub fn used_gb(&self) -> f64 {
        self.used_bytes as f64 / BYTES_PER_GB
    }

    pub fn free_gb(&self) -> f64 {
        self.free_bytes as f64 / BYTES_PER_GB
    }

    /// Whether free space has dropped below `threshold_mb` megabytes.
    pub fn is_low(&self, threshold_mb: u64) -> bool {
        self.free_bytes < threshold_mb.saturating_mul(1024 * 1024)
    }
}

/// Free-space drop between two queries, in GB. Other writers on the same
/// filesystem are counted too.
pub fn consumed_gb(before: &DiskUsage, after: &DiskUsage) -> f64 {
    before.free_gb() - after.free_gb()
}
