//! Decides whether the remote document moved since the last applied sync.

use armory_core::SyncState;
use armory_storage::FetchError;
use chrono::{DateTime, NaiveDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed { remote_modified: i64 },
    Skip { remote_modified: i64 },
}

impl GateDecision {
    pub fn remote_modified(&self) -> i64 {
        match self {
            GateDecision::Proceed { remote_modified } | GateDecision::Skip { remote_modified } => {
                *remote_modified
            }
        }
    }

    pub fn should_proceed(&self) -> bool {
        matches!(self, GateDecision::Proceed { .. })
    }
}

pub struct FreshnessGate;

impl FreshnessGate {
    pub fn check(modified_time: &str, state: SyncState) -> Result<GateDecision, FetchError> {
        let remote_modified = parse_modified_time(modified_time)?;
        Ok(if should_proceed(remote_modified, state) {
            GateDecision::Proceed { remote_modified }
        } else {
            GateDecision::Skip { remote_modified }
        })
    }
}

/// Proceed only when the remote copy is strictly newer than what was last applied.
pub fn should_proceed(remote_modified: i64, state: SyncState) -> bool {
    remote_modified > state.last_synced_timestamp
}

/// Remote modification time in whole epoch seconds.
///
/// Fractional seconds are dropped. Values without an offset are read as UTC.
pub fn parse_modified_time(raw: &str) -> Result<i64, FetchError> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.timestamp());
    }

    let whole_seconds = trimmed
        .split('.')
        .next()
        .unwrap_or(trimmed)
        .trim_end_matches('Z');
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(whole_seconds, fmt).ok())
        .map(|naive| naive.and_utc().timestamp())
        .ok_or_else(|| FetchError::Timestamp {
            value: raw.to_string(),
            reason: "expected ISO-8601 date and time".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractional_seconds_are_truncated() {
        assert_eq!(parse_modified_time("2024-03-01T09:15:27.999Z").unwrap(), 1_709_284_527);
        assert_eq!(parse_modified_time("2024-03-01T09:15:27Z").unwrap(), 1_709_284_527);
    }

    #[test]
    fn naive_and_offset_forms_parse() {
        assert_eq!(parse_modified_time("2024-03-01T09:15:27.5").unwrap(), 1_709_284_527);
        assert_eq!(parse_modified_time("2024-03-01 09:15:27").unwrap(), 1_709_284_527);
        assert_eq!(
            parse_modified_time("2024-03-01T10:15:27+01:00").unwrap(),
            1_709_284_527
        );
    }

    #[test]
    fn garbage_timestamp_is_a_fetch_error() {
        let err = parse_modified_time("yesterday-ish").unwrap_err();
        assert!(matches!(err, FetchError::Timestamp { .. }));
    }

    #[test]
    fn gate_requires_strictly_newer_remote() {
        let state = SyncState::new(1_709_284_527);
        assert_eq!(
            FreshnessGate::check("2024-03-01T09:15:27.514Z", state).unwrap(),
            GateDecision::Skip {
                remote_modified: 1_709_284_527
            }
        );
        assert!(FreshnessGate::check("2024-03-01T09:15:28Z", state)
            .unwrap()
            .should_proceed());
        assert!(!should_proceed(1_000, SyncState::new(2_000)));
        assert!(should_proceed(1, SyncState::UNSYNCED));
    }
}
