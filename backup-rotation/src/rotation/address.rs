//! Backup identity and its directory-name codec.
//!
//! - Full:        `<YYYY-Mon-DD_HH_MM_SS>.FULL_<full_id>`
//! - Incremental: `<YYYY-Mon-DD_HH_MM_SS>.FULL_<full_id>_INCR_<incremental_id>`
//!
//! While a run is in flight the directory carries a `.not_started` or
//! `.incomplete` suffix, which is stripped once the sync succeeds.

use crate::{Result, RotationError};
use chrono::{NaiveDate, NaiveDateTime, SubsecRound};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Timestamp layout embedded in every backup name (UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%b-%d_%H_%M_%S";

/// Date-only prefix of [`TIMESTAMP_FORMAT`], used for the daily quota.
pub const DAY_STAMP_FORMAT: &str = "%Y-%b-%d";

pub(crate) const FULL_MARKER: &str = ".FULL_";
const INCR_MARKER: &str = "_INCR_";

const INCOMPLETE_SUFFIX: &str = ".incomplete";
const NOT_STARTED_SUFFIX: &str = ".not_started";

/// How far a backup directory got through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionState {
    Complete,
    /// Sync launched but never finished.
    Incomplete,
    /// Directory reserved, sync never launched.
    NotStarted,
}

impl CompletionState {
    /// Directory-name suffix for this state (empty for complete backups).
    pub fn suffix(self) -> &'static str {
        match self {
            CompletionState::Complete => "",
            CompletionState::Incomplete => INCOMPLETE_SUFFIX,
            CompletionState::NotStarted => NOT_STARTED_SUFFIX,
        }
    }

    /// Split a directory name into its identity portion and completion state.
    pub fn split(name: &str) -> (&str, CompletionState) {
        if let Some(base) = name.strip_suffix(INCOMPLETE_SUFFIX) {
            (base, CompletionState::Incomplete)
        } else if let Some(base) = name.strip_suffix(NOT_STARTED_SUFFIX) {
            (base, CompletionState::NotStarted)
        } else {
            (name, CompletionState::Complete)
        }
    }
}

/// Identity of one backup: its generation, its position in that generation
/// and its creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupAddress {
    pub full_id: u32,
    /// `None` for the full backup itself.
    pub incremental_id: Option<u32>,
    pub timestamp: NaiveDateTime,
}

impl BackupAddress {
    pub fn full(full_id: u32, timestamp: NaiveDateTime) -> Self {
        Self {
            full_id,
            incremental_id: None,
            timestamp: timestamp.trunc_subsecs(0),
        }
    }

    pub fn incremental(full_id: u32, incremental_id: u32, timestamp: NaiveDateTime) -> Self {
        Self {
            full_id,
            incremental_id: Some(incremental_id),
            timestamp: timestamp.trunc_subsecs(0),
        }
    }

    pub fn is_full(&self) -> bool {
        self.incremental_id.is_none()
    }

    /// Directory name for this identity, without any completion suffix.
    pub fn encode(&self) -> String {
        let stamp = self.timestamp.format(TIMESTAMP_FORMAT);
        match self.incremental_id {
            None => format!("{}{}{}", stamp, FULL_MARKER, self.full_id),
            Some(incr) => format!(
                "{}{}{}{}{}",
                stamp, FULL_MARKER, self.full_id, INCR_MARKER, incr
            ),
        }
    }

    /// Directory name for this identity in the given lifecycle state.
    pub fn encode_with(&self, state: CompletionState) -> String {
        format!("{}{}", self.encode(), state.suffix())
    }

    /// Parse the identity portion of a directory name.
    ///
    /// Any malformed segment is a hard error: a catalog containing names we
    /// cannot order is not safe to plan or purge against.
    pub fn decode(name: &str) -> Result<Self> {
        let pos = name
            .find(FULL_MARKER)
            .ok_or_else(|| RotationError::parse(name, "missing FULL marker"))?;
        let stamp = &name[..pos];
        let ids = &name[pos + FULL_MARKER.len()..];

        let (full_part, incr_part) = match ids.split_once(INCR_MARKER) {
            Some((full, incr)) => (full, Some(incr)),
            None => (ids, None),
        };

        let full_id = parse_id(name, full_part, "full backup")?;
        let incremental_id = incr_part
            .map(|incr| parse_id(name, incr, "incremental backup"))
            .transpose()?;

        let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
            .map_err(|e| RotationError::parse(name, format!("bad timestamp '{}': {}", stamp, e)))?;

        let address = Self {
            full_id,
            incremental_id,
            timestamp,
        };
        // Other spellings of the same instant would sort and match as equal
        // while naming a different directory.
        if address.encode() != name {
            return Err(RotationError::parse(name, "not in canonical form"));
        }
        Ok(address)
    }

    /// Order two addresses of the same kind; `None` across kinds.
    pub fn cmp_within_kind(&self, other: &Self) -> Option<Ordering> {
        match (self.incremental_id, other.incremental_id) {
            (None, None) => Some(self.full_id.cmp(&other.full_id)),
            (Some(a), Some(b)) => Some((self.full_id, a).cmp(&(other.full_id, b))),
            _ => None,
        }
    }
}

impl fmt::Display for BackupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Whether a directory entry name claims to be a backup at all.
pub fn is_backup_name(name: &str) -> bool {
    name.contains(FULL_MARKER)
}

/// Date stamp shared by every backup name created on `day`.
pub fn day_stamp(day: NaiveDate) -> String {
    day.format(DAY_STAMP_FORMAT).to_string()
}

fn parse_id(name: &str, text: &str, what: &str) -> Result<u32> {
    let id: u32 = text
        .parse()
        .map_err(|_| RotationError::parse(name, format!("'{}' is not a valid {} ID", text, what)))?;
    if id == 0 {
        return Err(RotationError::parse(name, format!("{} ID must be at least 1", what)));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_encode_full_and_incremental() {
        let full = BackupAddress::full(1, at(2024, 1, 1, 0, 0, 0));
        assert_eq!(full.encode(), "2024-Jan-01_00_00_00.FULL_1");

        let incr = BackupAddress::incremental(3, 12, at(2023, 11, 9, 17, 5, 42));
        assert_eq!(incr.encode(), "2023-Nov-09_17_05_42.FULL_3_INCR_12");
        assert_eq!(
            incr.encode_with(CompletionState::Incomplete),
            "2023-Nov-09_17_05_42.FULL_3_INCR_12.incomplete"
        );
    }

    #[test]
    fn test_decode_inverts_encode() {
        let addresses = [
            BackupAddress::full(1, at(2024, 1, 1, 0, 0, 0)),
            BackupAddress::full(27, at(2019, 12, 31, 23, 59, 59)),
            BackupAddress::incremental(4, 1, at(2024, 2, 29, 3, 4, 5)),
            BackupAddress::incremental(10, 92, at(2025, 7, 15, 12, 0, 1)),
        ];
        for address in addresses {
            assert_eq!(BackupAddress::decode(&address.encode()).unwrap(), address);
        }
    }

    #[test]
    fn test_constructor_drops_subseconds() {
        let stamp = at(2024, 5, 6, 7, 8, 9) + chrono::Duration::milliseconds(750);
        let address = BackupAddress::full(2, stamp);
        assert_eq!(BackupAddress::decode(&address.encode()).unwrap(), address);
    }

    #[test]
    fn test_decode_rejects_bad_ids() {
        for name in [
            "2024-Jan-01_00_00_00.FULL_x",
            "2024-Jan-01_00_00_00.FULL_",
            "2024-Jan-01_00_00_00.FULL_0",
            "2024-Jan-01_00_00_00.FULL_2_INCR_abc",
            "2024-Jan-01_00_00_00.FULL_2_INCR_0",
            "2024-Jan-01_00_00_00.FULL_1.incomplete",
        ] {
            let err = BackupAddress::decode(name).unwrap_err();
            assert!(matches!(err, RotationError::Parse { .. }), "{name}: {err}");
        }
    }

    #[test]
    fn test_decode_rejects_missing_marker_and_bad_timestamp() {
        assert!(matches!(
            BackupAddress::decode("backup.log"),
            Err(RotationError::Parse { .. })
        ));
        assert!(matches!(
            BackupAddress::decode("yesterday.FULL_1"),
            Err(RotationError::Parse { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_non_canonical_names() {
        for name in [
            "2024-jan-01_00_00_00.FULL_1",
            "2024-January-01_00_00_00.FULL_1",
            "2024-Jan-1_00_00_00.FULL_1",
            "2024-Jan-01_0_00_00.FULL_1",
            "2024-Jan-01_00_00_00.FULL_01",
            "2024-Jan-01_00_00_00.FULL_1_INCR_+2",
        ] {
            let err = BackupAddress::decode(name).unwrap_err();
            assert!(matches!(err, RotationError::Parse { .. }), "{name}: {err}");
        }
        assert!(BackupAddress::decode("2024-Jan-01_00_00_00.FULL_1").is_ok());
    }

    #[test]
    fn test_split_completion_state() {
        assert_eq!(
            CompletionState::split("2024-Jan-01_00_00_00.FULL_1"),
            ("2024-Jan-01_00_00_00.FULL_1", CompletionState::Complete)
        );
        assert_eq!(
            CompletionState::split("2024-Jan-01_00_00_00.FULL_1_INCR_2.incomplete"),
            ("2024-Jan-01_00_00_00.FULL_1_INCR_2", CompletionState::Incomplete)
        );
        assert_eq!(
            CompletionState::split("2024-Jan-01_00_00_00.FULL_3.not_started"),
            ("2024-Jan-01_00_00_00.FULL_3", CompletionState::NotStarted)
        );
    }

    #[test]
    fn test_cmp_within_kind() {
        let t = at(2024, 1, 1, 0, 0, 0);
        let f1 = BackupAddress::full(1, t);
        let f2 = BackupAddress::full(2, t);
        let i1 = BackupAddress::incremental(1, 5, t);
        let i2 = BackupAddress::incremental(1, 6, t);

        assert_eq!(f1.cmp_within_kind(&f2), Some(Ordering::Less));
        assert_eq!(i2.cmp_within_kind(&i1), Some(Ordering::Greater));
        assert_eq!(f1.cmp_within_kind(&i1), None);
    }

    #[test]
    fn test_day_stamp_matches_name_prefix() {
        let address = BackupAddress::full(1, at(2024, 3, 7, 22, 10, 0));
        let stamp = day_stamp(address.timestamp.date());
        assert_eq!(stamp, "2024-Mar-07");
        assert!(address.encode().starts_with(&stamp));
    }
}
