//! Backup-set naming and rotation.
//!
//! A destination holds generations: one full backup followed by incremental
//! backups that hard-link unchanged files against the previous backup.
//!
//! - [`address`]: identity of a backup and its directory-name codec
//! - [`catalog`]: queries over the destination directory listing
//! - [`planner`]: what to create next and what to link it against
//! - [`purge`]: retirement and renumbering of whole generations

pub mod address;
pub mod catalog;
pub mod planner;
pub mod purge;

pub use address::{BackupAddress, CompletionState};
pub use catalog::{BackupCatalog, CatalogEntry, CatalogSnapshot};
pub use planner::{Plan, RetentionPlanner, RetentionPolicy};
pub use purge::{PurgeEngine, PurgeReport};
