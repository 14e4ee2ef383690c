//! Measurement records exchanged between sources and storage backends.

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone};

/// Name of the table (SQLite) or measurement (InfluxDB) holding readings.
pub const TABLE_NAME: &str = "heart_reading";

/// Length of one exported "day". Day boundaries advance by exactly this much,
/// not by calendar days.
pub const DAY: Duration = Duration::hours(24);

/// A single heart-rate reading, stamped with the owner it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementPoint {
    pub timestamp: DateTime<Local>,
    pub value: i64,
    pub confidence: i32,
    pub owner: String,
}

impl MeasurementPoint {
    pub fn new(
        timestamp: DateTime<Local>,
        value: i64,
        confidence: i32,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            value,
            confidence,
            owner: owner.into(),
        }
    }
}

/// Midnight of the local day containing `t`.
///
/// Falls back to `t` itself if local midnight does not exist (a DST gap at
/// 00:00), and to the earlier instant if it is ambiguous.
pub fn start_of_day(t: DateTime<Local>) -> DateTime<Local> {
    let midnight = t.date_naive().and_time(NaiveTime::MIN);
    Local.from_local_datetime(&midnight).earliest().unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_start_of_day_truncates_time() {
        let t = Local.with_ymd_and_hms(2020, 2, 1, 9, 30, 15).unwrap();
        let d = start_of_day(t);
        assert_eq!(d.date_naive(), t.date_naive());
        assert_eq!((d.hour(), d.minute(), d.second()), (0, 0, 0));
    }

    #[test]
    fn test_start_of_day_is_idempotent() {
        let t = Local.with_ymd_and_hms(2021, 6, 15, 0, 0, 0).unwrap();
        assert_eq!(start_of_day(t), t);
    }
}
