//! Removal of whole backup generations.

use super::address::BackupAddress;
use super::catalog::{BackupCatalog, CatalogSnapshot};
use crate::{Result, RotationError};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{info, warn};

/// What a purge removed.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PurgeReport {
    /// Generations removed, oldest first
    pub generations: Vec<u32>,
    pub removed: Vec<PathBuf>,
}

/// Deletes and renumbers generations in a destination.
#[derive(Debug, Clone)]
pub struct PurgeEngine {
    catalog: BackupCatalog,
}

impl PurgeEngine {
    pub fn new(catalog: BackupCatalog) -> Self {
        Self { catalog }
    }

    /// Remove oldest generations until at most `max_full` complete full
    /// backups remain. The catalog is rescanned after every generation.
    pub fn purge(&self, max_full: u32) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();

        loop {
            let snapshot = self.catalog.snapshot()?;
            let Some(oldest) = next_purge_victim(&snapshot, max_full, &report.generations)? else {
                break;
            };

            info!(
                generation = oldest,
                full_backups = snapshot.full_backup_count(),
                max_full,
                "Purging oldest backup generation"
            );
            report.removed.extend(delete_generation(&snapshot, oldest)?);
            report.generations.push(oldest);
        }

        Ok(report)
    }

    /// Delete every entry of one generation, whatever its age.
    pub fn remove_generation(&self, full_id: u32) -> Result<Vec<PathBuf>> {
        let snapshot = self.catalog.snapshot()?;
        if snapshot.generation_members(full_id).is_empty() {
            return Err(RotationError::NotFound(format!(
                "generation {} in {}",
                full_id,
                snapshot.dest().display()
            )));
        }
        info!(generation = full_id, "Removing backup generation");
        delete_generation(&snapshot, full_id)
    }

    /// Shift every generation above `removed_full_id` down by one so the
    /// numbering has no gap. Incremental numbers and completion suffixes are
    /// kept as they are.
    ///
    /// Generations are renamed in ascending order so each target slot has
    /// already been vacated; a failure part way never leaves two generations
    /// sharing a number.
    pub fn renumber_after_generation_removal(
        &self,
        removed_full_id: u32,
    ) -> Result<Vec<(PathBuf, PathBuf)>> {
        if removed_full_id == 0 {
            return Err(RotationError::PolicyViolation(
                "generation numbers start at 1".into(),
            ));
        }

        let snapshot = self.catalog.snapshot()?;
        if !snapshot.generation_members(removed_full_id).is_empty() {
            return Err(RotationError::CorruptCatalog(format!(
                "generation {} still has entries, remove it before renumbering",
                removed_full_id
            )));
        }

        let mut shifted: Vec<_> = snapshot
            .entries()
            .iter()
            .filter(|e| e.address.full_id > removed_full_id)
            .collect();
        shifted.sort_by_key(|e| (e.address.full_id, e.address.incremental_id));

        let mut renamed = Vec::with_capacity(shifted.len());
        for entry in shifted {
            let address = BackupAddress {
                full_id: entry.address.full_id - 1,
                ..entry.address.clone()
            };
            let target = snapshot.dest().join(address.encode_with(entry.state));
            if target.exists() {
                return Err(RotationError::CorruptCatalog(format!(
                    "cannot rename {} to {}: target exists",
                    entry.name,
                    target.display()
                )));
            }

            fs::rename(&entry.path, &target)?;
            info!(from = %entry.path.display(), to = %target.display(), "Renumbered backup");
            renamed.push((entry.path.clone(), target));
        }

        Ok(renamed)
    }
}

/// Generation to delete next, or `None` once the limit is met. The oldest
/// entry of any kind decides, so orphaned incrementals go before newer
/// complete generations.
fn next_purge_victim(
    snapshot: &CatalogSnapshot,
    max_full: u32,
    purged: &[u32],
) -> Result<Option<u32>> {
    if snapshot.full_backup_count() <= max_full as usize {
        return Ok(None);
    }
    let Some(oldest) = snapshot.oldest_generation() else {
        return Ok(None);
    };
    if purged.contains(&oldest) {
        return Err(RotationError::CorruptCatalog(format!(
            "generation {} is still present after it was removed",
            oldest
        )));
    }
    Ok(Some(oldest))
}

/// Remove every member of a generation. All members are attempted; the first
/// failure is returned once the rest have been tried, and whatever is left
/// is picked up by the next purge.
fn delete_generation(snapshot: &CatalogSnapshot, full_id: u32) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let mut first_error = None;

    for entry in snapshot.generation_members(full_id) {
        match remove_path(&entry.path) {
            Ok(()) => {
                info!(path = %entry.path.display(), "Removed backup");
                removed.push(entry.path.clone());
            }
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "Failed to remove backup");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(removed),
    }
}

fn remove_path(path: &std::path::Path) -> std::io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
