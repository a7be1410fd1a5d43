use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::models::{SessionRow, SessionUpsert};

#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatDecision {
    /// The stored session was revoked for this very token.
    Revoked,
    Record {
        row: SessionUpsert,
        refreshed_stale: bool,
        cleared_revocation: bool,
    },
}

pub struct Heartbeat<'a> {
    pub user_id: &'a str,
    pub fingerprint: &'a str,
    pub token_hash: &'a str,
    pub device_label: Option<&'a str>,
    pub now: DateTime<Utc>,
    pub ttl: Duration,
}

/// Decides what a heartbeat does to the stored session row.
///
/// A revocation only sticks while the same token keeps presenting itself. A
/// different token (or a row without a stored hash) is a fresh login and
/// clears it. Expired rows are refreshed in place since the token itself was
/// already validated.
pub fn decide_heartbeat(existing: Option<&SessionRow>, beat: &Heartbeat<'_>) -> HeartbeatDecision {
    let mut cleared_revocation = false;
    let mut refreshed_stale = false;

    if let Some(row) = existing {
        if row.revoked_at.is_some() {
            if row.token_hash.as_deref() == Some(beat.token_hash) {
                return HeartbeatDecision::Revoked;
            }
            cleared_revocation = true;
        }

        refreshed_stale = row
            .expires_at
            .as_deref()
            .and_then(parse_timestamp)
            .map(|expires_at| expires_at <= beat.now)
            .unwrap_or(false);
    }

    HeartbeatDecision::Record {
        row: SessionUpsert {
            user_id: beat.user_id.to_string(),
            fingerprint: beat.fingerprint.to_string(),
            last_seen_at: format_timestamp(beat.now),
            expires_at: format_timestamp(beat.now + beat.ttl),
            token_hash: beat.token_hash.to_string(),
            revoked_at: None,
            device_label: beat.device_label.map(ToString::to_string),
        },
        refreshed_stale,
        cleared_revocation,
    }
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn beat(token_hash: &str) -> Heartbeat<'_> {
        Heartbeat {
            user_id: "user-1",
            fingerprint: "fp-1",
            token_hash,
            device_label: Some("Chrome on macOS"),
            now: now(),
            ttl: Duration::hours(720),
        }
    }

    fn stored(token_hash: Option<&str>, revoked: bool, expires_at: DateTime<Utc>) -> SessionRow {
        SessionRow {
            expires_at: Some(format_timestamp(expires_at)),
            token_hash: token_hash.map(ToString::to_string),
            revoked_at: revoked.then(|| format_timestamp(now() - Duration::hours(1))),
        }
    }

    #[test]
    fn first_heartbeat_creates_a_row() {
        match decide_heartbeat(None, &beat("hash-a")) {
            HeartbeatDecision::Record {
                row,
                refreshed_stale,
                cleared_revocation,
            } => {
                assert_eq!(row.token_hash, "hash-a");
                assert_eq!(row.revoked_at, None);
                assert_eq!(row.expires_at, format_timestamp(now() + Duration::hours(720)));
                assert!(!refreshed_stale);
                assert!(!cleared_revocation);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn revoked_session_with_same_token_stays_revoked() {
        let row = stored(Some("hash-a"), true, now() + Duration::hours(1));
        assert_eq!(
            decide_heartbeat(Some(&row), &beat("hash-a")),
            HeartbeatDecision::Revoked
        );
    }

    #[test]
    fn new_token_supersedes_revocation() {
        let row = stored(Some("hash-a"), true, now() + Duration::hours(1));
        match decide_heartbeat(Some(&row), &beat("hash-b")) {
            HeartbeatDecision::Record {
                row,
                cleared_revocation,
                ..
            } => {
                assert!(cleared_revocation);
                assert_eq!(row.revoked_at, None);
                assert_eq!(row.token_hash, "hash-b");
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn revocation_without_stored_hash_is_cleared() {
        let row = stored(None, true, now() + Duration::hours(1));
        assert!(matches!(
            decide_heartbeat(Some(&row), &beat("hash-a")),
            HeartbeatDecision::Record {
                cleared_revocation: true,
                ..
            }
        ));
    }

    #[test]
    fn expired_session_is_refreshed_not_rejected() {
        let row = stored(Some("hash-a"), false, now() - Duration::minutes(5));
        match decide_heartbeat(Some(&row), &beat("hash-a")) {
            HeartbeatDecision::Record {
                row,
                refreshed_stale,
                ..
            } => {
                assert!(refreshed_stale);
                assert!(parse_timestamp(&row.expires_at).unwrap() > now());
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn timestamps_round_trip() {
        let formatted = format_timestamp(now());
        assert_eq!(formatted, "2026-03-01T12:00:00.000Z");
        assert_eq!(parse_timestamp(&formatted), Some(now()));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
