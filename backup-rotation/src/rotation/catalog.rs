//! Directory-listing backed catalog of the backups in a destination.
//!
//! There is no index file: the destination's entry names are the database.
//! [`BackupCatalog`] re-reads the directory on every query so that changes
//! made by other tools (or by a purge in progress) are always visible.
//! Callers that need several answers from one consistent view take a
//! [`CatalogSnapshot`] instead.

use super::address::{is_backup_name, BackupAddress, CompletionState};
use crate::{Result, RotationError};
use chrono::NaiveDate;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One backup directory found in the destination.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub path: PathBuf,
    pub address: BackupAddress,
    pub state: CompletionState,
}

impl CatalogEntry {
    pub fn is_complete(&self) -> bool {
        self.state == CompletionState::Complete
    }

    pub fn is_full(&self) -> bool {
        self.address.is_full()
    }
}

/// A single read of the destination directory.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    dest: PathBuf,
    /// Chronological order.
    entries: Vec<CatalogEntry>,
}

impl CatalogSnapshot {
    /// Read the destination directory. A destination that does not exist
    /// yet is an empty catalog.
    pub fn scan(dest: &Path) -> Result<Self> {
        let read_dir = match fs::read_dir(dest) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Self {
                    dest: dest.to_path_buf(),
                    entries: Vec::new(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!(name = ?raw, "Skipping non UTF-8 entry"),
            }
        }

        Self::from_names(dest, names)
    }

    /// Build a snapshot from raw entry names. Names that do not look like
    /// backups are ignored; names that look like backups but fail to decode
    /// abort the whole snapshot.
    pub fn from_names<I, S>(dest: &Path, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries = Vec::new();
        for name in names {
            let name = name.into();
            if !is_backup_name(&name) {
                continue;
            }
            let (base, state) = CompletionState::split(&name);
            let address = BackupAddress::decode(base)?;
            entries.push(CatalogEntry {
                path: dest.join(&name),
                name,
                address,
                state,
            });
        }

        entries.sort_by(|a, b| {
            (a.address.timestamp, a.address.full_id, a.address.incremental_id)
                .cmp(&(b.address.timestamp, b.address.full_id, b.address.incremental_id))
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(Self {
            dest: dest.to_path_buf(),
            entries,
        })
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Every backup entry, any state, oldest first.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    fn complete(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter().filter(|e| e.is_complete())
    }

    /// The completed full backup of a generation. Two completed full backups
    /// sharing a generation number means the catalog cannot be trusted.
    fn complete_full(&self, full_id: u32) -> Result<Option<&CatalogEntry>> {
        let mut found = self
            .complete()
            .filter(|e| e.is_full() && e.address.full_id == full_id);
        let first = found.next();
        if let Some(dup) = found.next() {
            return Err(RotationError::CorruptCatalog(format!(
                "generation {} has more than one complete full backup ({}, {})",
                full_id,
                first.map(|e| e.name.as_str()).unwrap_or_default(),
                dup.name
            )));
        }
        Ok(first)
    }

    /// Complete full backup with the highest generation number.
    pub fn last_full_backup(&self) -> Result<Option<&CatalogEntry>> {
        let max_id = self
            .complete()
            .filter(|e| e.is_full())
            .map(|e| e.address.full_id)
            .max();
        match max_id {
            Some(id) => self.complete_full(id),
            None => Ok(None),
        }
    }

    /// Complete incremental backups chained to a generation.
    pub fn incrementals_for(&self, full_id: u32) -> Vec<&CatalogEntry> {
        self.complete()
            .filter(|e| !e.is_full() && e.address.full_id == full_id)
            .collect()
    }

    pub fn last_incremental_for(&self, full_id: u32) -> Option<&CatalogEntry> {
        self.incrementals_for(full_id)
            .into_iter()
            .max_by_key(|e| e.address.incremental_id)
    }

    /// Number of complete full backups. Incrementals never count here even
    /// though their names carry the same `FULL_<n>` segment.
    pub fn full_backup_count(&self) -> usize {
        self.complete().filter(|e| e.is_full()).count()
    }

    /// Generation numbers of complete full backups, oldest first.
    pub fn all_full_generations(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = Vec::new();
        for entry in self.complete().filter(|e| e.is_full()) {
            if !ids.contains(&entry.address.full_id) {
                ids.push(entry.address.full_id);
            }
        }
        ids
    }

    /// Generation of the oldest entry in the destination, whatever its
    /// kind or state. Leftovers of a generation whose full backup is gone
    /// still count.
    pub fn oldest_generation(&self) -> Option<u32> {
        self.entries.first().map(|e| e.address.full_id)
    }

    /// Every entry (any state, any kind) of one generation.
    pub fn generation_members(&self, full_id: u32) -> Vec<&CatalogEntry> {
        self.entries
            .iter()
            .filter(|e| e.address.full_id == full_id)
            .collect()
    }

    /// Backup attempts made on `day`, successful or not.
    pub fn backups_created_on(&self, day: NaiveDate) -> usize {
        self.entries
            .iter()
            .filter(|e| e.address.timestamp.date() == day)
            .count()
    }

    /// Directory of the completed full backup that `address` belongs to.
    pub fn resolve_full_path_for(&self, address: &BackupAddress) -> Result<PathBuf> {
        match self.complete_full(address.full_id)? {
            Some(entry) => Ok(entry.path.clone()),
            None => Err(RotationError::NotFound(format!(
                "no complete full backup for generation {} in {}",
                address.full_id,
                self.dest.display()
            ))),
        }
    }

    /// Hard-link source for a new backup at `target`.
    ///
    /// Full backups have none. Incremental `k` links against incremental
    /// `k-1` of the same generation when it exists, otherwise against the
    /// generation's full backup.
    pub fn resolve_link_base(&self, target: &BackupAddress) -> Result<Option<PathBuf>> {
        let Some(incr) = target.incremental_id else {
            return Ok(None);
        };

        let previous = incr.saturating_sub(1);
        if previous > 0 {
            let found = self.complete().find(|e| {
                e.address.full_id == target.full_id && e.address.incremental_id == Some(previous)
            });
            if let Some(entry) = found {
                return Ok(Some(entry.path.clone()));
            }
            debug!(
                full_id = target.full_id,
                incremental_id = previous,
                "Previous incremental not found, linking against full backup"
            );
        }

        self.resolve_full_path_for(target).map(Some)
    }
}

/// Query front-end over a destination directory. Every call rescans.
#[derive(Debug, Clone)]
pub struct BackupCatalog {
    dest: PathBuf,
}

impl BackupCatalog {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self { dest: dest.into() }
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn snapshot(&self) -> Result<CatalogSnapshot> {
        CatalogSnapshot::scan(&self.dest)
    }

    pub fn last_full_backup(&self) -> Result<Option<BackupAddress>> {
        Ok(self.snapshot()?.last_full_backup()?.map(|e| e.address.clone()))
    }

    pub fn incrementals_for(&self, full_id: u32) -> Result<Vec<BackupAddress>> {
        Ok(self
            .snapshot()?
            .incrementals_for(full_id)
            .into_iter()
            .map(|e| e.address.clone())
            .collect())
    }

    pub fn last_incremental_for(&self, full_id: u32) -> Result<Option<BackupAddress>> {
        Ok(self
            .snapshot()?
            .last_incremental_for(full_id)
            .map(|e| e.address.clone()))
    }

    pub fn full_backup_count(&self) -> Result<usize> {
        Ok(self.snapshot()?.full_backup_count())
    }

    pub fn all_full_generations(&self) -> Result<Vec<u32>> {
        Ok(self.snapshot()?.all_full_generations())
    }

    pub fn backups_created_on(&self, day: NaiveDate) -> Result<usize> {
        Ok(self.snapshot()?.backups_created_on(day))
    }

    pub fn resolve_full_path_for(&self, address: &BackupAddress) -> Result<PathBuf> {
        self.snapshot()?.resolve_full_path_for(address)
    }

    pub fn resolve_link_base(&self, target: &BackupAddress) -> Result<Option<PathBuf>> {
        self.snapshot()?.resolve_link_base(target)
    }
}
