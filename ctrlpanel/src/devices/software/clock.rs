use chrono::{DateTime, NaiveDateTime, Utc};
use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Power-on time of the panel, 04/03/07 00:00:00 UTC, in seconds since the
/// unix epoch. Used until the time is set from a shell command.
pub const DEFAULT_EPOCH: i64 = 1_175_558_400;

/// Date layout used by log lines and by `set_sys_config sys=time`.
pub const LOG_DATE_FORMAT: &str = "%m/%d/%y %H:%M:%S";

/// Log files are named after the minute they were opened, `mmddyy_hhmm`.
const LOG_FILE_STEM: &str = "%m%d%y_%H%M";

/// Process wide logical clock, in seconds since the unix epoch. It is only
/// advanced by the periodic tick and stepped by time configuration commands,
/// never read from the host.
#[derive(Debug)]
pub struct LogicalClock {
    now: AtomicI64,
}

impl LogicalClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn now(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }

    /// Advance by one second and return the new time.
    pub fn advance(&self) -> i64 {
        self.now.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Step the clock, forward or backward.
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::Release);
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new(DEFAULT_EPOCH)
    }
}

/// Broken-down UTC date of a logical timestamp.
pub fn to_datetime(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_default()
}

/// `MM/DD/YY HH:MM:SS`
pub fn format_log_date(timestamp: i64) -> String {
    to_datetime(timestamp).format(LOG_DATE_FORMAT).to_string()
}

/// `MMDDYY_HHMM.log`
pub fn log_file_name(timestamp: i64) -> String {
    log_file_name_in_minute(timestamp, 0)
}

/// Name of the `sequence`th log file started in the minute of `timestamp`:
/// `MMDDYY_HHMM.log`, then `MMDDYY_HHMM_1.log` and so on.
pub fn log_file_name_in_minute(timestamp: i64, sequence: usize) -> String {
    let stem = to_datetime(timestamp).format(LOG_FILE_STEM);
    match sequence {
        0 => format!("{stem}.log"),
        n => format!("{stem}_{n}.log"),
    }
}

/// Parse a `MM/DD/YY HH:MM:SS` date into a logical timestamp.
pub fn parse_log_date(date: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(date.trim(), LOG_DATE_FORMAT)
        .ok()
        .map(|date| date.and_utc().timestamp())
}

/// Host time matching a logical timestamp, used to stamp file dates.
pub fn to_system_time(timestamp: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::try_from(timestamp).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_epoch_is_april_third_2007() {
        assert_eq!(format_log_date(DEFAULT_EPOCH), "04/03/07 00:00:00");
        assert_eq!(log_file_name(DEFAULT_EPOCH), "040307_0000.log");
    }

    #[test]
    fn test_advance_and_step() {
        let clock = LogicalClock::default();
        assert_eq!(clock.advance(), DEFAULT_EPOCH + 1);
        clock.set(DEFAULT_EPOCH - 100);
        assert_eq!(clock.now(), DEFAULT_EPOCH - 100);
    }

    #[rstest]
    #[case("04/03/07 00:00:00", Some(DEFAULT_EPOCH))]
    #[case("04/03/07 00:01:05", Some(DEFAULT_EPOCH + 65))]
    #[case(" 04/04/07 00:00:00 ", Some(DEFAULT_EPOCH + 86_400))]
    #[case("13/45/07 00:00:00", None)]
    #[case("yesterday", None)]
    fn test_parse_log_date(#[case] date: &str, #[case] expected: Option<i64>) {
        assert_eq!(parse_log_date(date), expected);
    }

    #[test]
    fn test_file_name_follows_minutes() {
        assert_eq!(log_file_name(DEFAULT_EPOCH + 3_725), "040307_0102.log");
        assert_eq!(log_file_name_in_minute(DEFAULT_EPOCH + 59, 2), "040307_0000_2.log");
    }
}
