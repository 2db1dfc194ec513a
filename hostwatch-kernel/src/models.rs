use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Escalation state of a monitored host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostState {
    Healthy,
    /// One failed probe seen, nobody notified yet.
    FirstDetection,
    Escalating,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostState::Healthy => "healthy",
            HostState::FirstDetection => "first_detection",
            HostState::Escalating => "escalating",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub id: String,
    pub state: HostState,
    /// Calls sent during the current down episode.
    pub call_attempts: u32,
    pub last_notification_time: Option<PrimitiveDateTime>,
    /// None only for a record that was never evaluated.
    pub last_check_time: Option<PrimitiveDateTime>,
}

impl HostRecord {
    /// Fresh record for a host that just appeared in the configuration.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: HostState::Healthy,
            call_attempts: 0,
            last_notification_time: None,
            last_check_time: None,
        }
    }
}

/// Result of one reachability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Observation {
    Up,
    Down,
}

impl Observation {
    /// `ping` convention: 0 means reachable, anything else unreachable.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Observation::Up
        } else {
            Observation::Down
        }
    }
}

/// What the caller must send after an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    None,
    SendCall,
    SendSms,
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Directive::None => "none",
            Directive::SendCall => "call",
            Directive::SendSms => "sms",
        };
        f.write_str(name)
    }
}

pub type HostsMap = BTreeMap<String, HostRecord>;

/// Parses a `{"host": 0|1}` document into observations.
pub fn parse_observations(txt: &str) -> Result<BTreeMap<String, Observation>, serde_json::Error> {
    let raw: BTreeMap<String, i32> = serde_json::from_str(txt)?;
    Ok(raw
        .into_iter()
        .map(|(host, code)| (host, Observation::from_exit_code(code)))
        .collect())
}

/// Offset of the machine's local time zone, `None` when it cannot be determined.
///
/// Must be called while the process is still single-threaded: on unix the
/// lookup is refused once other threads exist.
pub fn local_offset() -> Option<UtcOffset> {
    UtcOffset::current_local_offset().ok()
}

/// Naive wall-clock time at `offset`, as stored in the document.
pub fn wall_clock(now: OffsetDateTime, offset: UtcOffset) -> PrimitiveDateTime {
    let local = now.to_offset(offset);
    PrimitiveDateTime::new(local.date(), local.time())
}

/// Current local wall-clock time for a zone captured by `local_offset`.
pub fn now_timestamp(offset: UtcOffset) -> PrimitiveDateTime {
    wall_clock(OffsetDateTime::now_utc(), offset)
}

/// Formats `%Y-%m-%d %H:%M:%S.%f`.
pub fn format_timestamp(ts: PrimitiveDateTime) -> Result<String, time::error::Format> {
    ts.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
    ))
}

/// Parses `%Y-%m-%d %H:%M:%S.%f`; the fractional part may be missing.
pub fn parse_timestamp(txt: &str) -> Result<PrimitiveDateTime, time::error::Parse> {
    PrimitiveDateTime::parse(
        txt,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
    )
    .or_else(|_| {
        PrimitiveDateTime::parse(
            txt,
            format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    #[test]
    fn timestamp_keeps_microseconds() {
        let ts = datetime!(2024-01-01 08:30:15.123456);
        let txt = format_timestamp(ts).unwrap();
        assert_eq!(txt, "2024-01-01 08:30:15.123456");
        assert_eq!(parse_timestamp(&txt).unwrap(), ts);
    }

    #[test]
    fn timestamp_without_fraction_is_accepted() {
        let ts = parse_timestamp("2024-01-01 00:00:00").unwrap();
        assert_eq!(ts, datetime!(2024-01-01 00:00:00));
        assert_eq!(format_timestamp(ts).unwrap(), "2024-01-01 00:00:00.000000");
    }

    #[test]
    fn wall_clock_is_local_time() {
        let now = datetime!(2024-03-01 07:06:00 UTC);
        assert_eq!(wall_clock(now, offset!(+3)), datetime!(2024-03-01 10:06:00));
        assert_eq!(wall_clock(now, UtcOffset::UTC), datetime!(2024-03-01 07:06:00));
        assert_eq!(wall_clock(now, offset!(-8)), datetime!(2024-02-29 23:06:00));
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn observations_follow_exit_codes() {
        let obs = parse_observations(r#"{"10.0.0.1": 0, "10.0.0.2": 1, "10.0.0.3": 2}"#).unwrap();
        assert_eq!(obs["10.0.0.1"], Observation::Up);
        assert_eq!(obs["10.0.0.2"], Observation::Down);
        assert_eq!(obs["10.0.0.3"], Observation::Down);
    }

    #[test]
    fn new_record_is_healthy() {
        let record = HostRecord::new("gw");
        assert_eq!(record.state, HostState::Healthy);
        assert_eq!(record.call_attempts, 0);
        assert!(record.last_notification_time.is_none());
        assert!(record.last_check_time.is_none());
    }
}
