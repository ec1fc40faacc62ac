//! Decides the identity and link base of the next backup.

use super::address::{BackupAddress, CompletionState};
use super::catalog::{BackupCatalog, CatalogSnapshot};
use crate::{Result, RotationError};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Retention limits. Lives in the `[retention]` section of the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Full backup generations to keep (at least 2)
    #[serde(default = "default_max_full")]
    pub max_full: u32,

    /// Incremental backups per generation before rolling to a new full backup
    #[serde(default = "default_max_incremental")]
    pub max_incremental: u32,

    /// Force a new full backup on the first day of each month
    #[serde(default)]
    pub monthly_full: bool,

    /// Backup attempts allowed per (UTC) day
    #[serde(default = "default_max_daily_backups")]
    pub max_daily_backups: u32,
}

fn default_max_full() -> u32 {
    4
}

fn default_max_incremental() -> u32 {
    92
}

fn default_max_daily_backups() -> u32 {
    5
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_full: default_max_full(),
            max_incremental: default_max_incremental(),
            monthly_full: false,
            max_daily_backups: default_max_daily_backups(),
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_full < 2 {
            return Err(RotationError::PolicyViolation(format!(
                "max_full is {}, the minimum number of full backups is 2",
                self.max_full
            )));
        }
        if self.max_daily_backups < 1 {
            return Err(RotationError::PolicyViolation(
                "max_daily_backups must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// The next backup to create.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub address: BackupAddress,
    /// `None` for a fresh full backup.
    pub link_base: Option<PathBuf>,
}

impl Plan {
    pub fn name(&self) -> String {
        self.address.encode()
    }

    /// Location of this backup in `dest` while in `state`.
    pub fn path_in(&self, dest: &Path, state: CompletionState) -> PathBuf {
        dest.join(self.address.encode_with(state))
    }
}

/// Pure decision procedure over a catalog; never touches disk.
#[derive(Debug, Clone)]
pub struct RetentionPlanner {
    policy: RetentionPolicy,
}

impl RetentionPlanner {
    pub fn new(policy: RetentionPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy })
    }

    /// Plan against a fresh scan of the catalog.
    pub fn plan(&self, catalog: &BackupCatalog, now: DateTime<Utc>) -> Result<Plan> {
        self.plan_with(&catalog.snapshot()?, now)
    }

    /// Plan against an existing snapshot.
    pub fn plan_with(&self, snapshot: &CatalogSnapshot, now: DateTime<Utc>) -> Result<Plan> {
        let address = self.next_address(snapshot, now)?;
        let link_base = snapshot.resolve_link_base(&address)?;
        debug!(
            next = %address,
            link_base = ?link_base,
            "Planned next backup"
        );
        Ok(Plan { address, link_base })
    }

    fn next_address(&self, snapshot: &CatalogSnapshot, now: DateTime<Utc>) -> Result<BackupAddress> {
        let stamp = now.naive_utc();

        let today = snapshot.backups_created_on(stamp.date());
        if today >= self.policy.max_daily_backups as usize {
            return Err(RotationError::QuotaExceeded {
                count: today,
                limit: self.policy.max_daily_backups,
            });
        }

        let Some(last_full) = snapshot.last_full_backup()? else {
            return Ok(BackupAddress::full(1, stamp));
        };
        let full_id = last_full.address.full_id;

        if self.policy.monthly_full && stamp.day() == 1 {
            return Ok(BackupAddress::full(full_id + 1, stamp));
        }

        if self.policy.max_incremental == 0 {
            return Ok(BackupAddress::full(full_id + 1, stamp));
        }

        let address = match snapshot
            .last_incremental_for(full_id)
            .and_then(|e| e.address.incremental_id)
        {
            None => BackupAddress::incremental(full_id, 1, stamp),
            Some(last) if last >= self.policy.max_incremental => {
                BackupAddress::full(full_id + 1, stamp)
            }
            Some(last) => BackupAddress::incremental(full_id, last + 1, stamp),
        };
        Ok(address)
    }
}
