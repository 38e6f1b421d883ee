use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use std::time::SystemTime;

// 1601-01-01 00:00:00 is a valid date, the panics below are unreachable.
const WINDOWS_EPOCH_NAIVE: NaiveDateTime = match NaiveDate::from_ymd_opt(1601, 1, 1) {
    Some(date) => match date.and_hms_opt(0, 0, 0) {
        Some(datetime) => datetime,
        None => panic!("Invalid time component for Windows epoch constant"),
    },
    None => panic!("Invalid date component for Windows epoch constant"),
};
const WINDOWS_EPOCH_UTC: DateTime<Utc> =
    DateTime::<Utc>::from_naive_utc_and_offset(WINDOWS_EPOCH_NAIVE, Utc);

/// Converts a USN record timestamp (FILETIME, 100-nanosecond intervals since
/// 1601-01-01 UTC) to a `SystemTime`.
///
/// Negative timestamps are clamped to the Windows epoch.
pub(crate) fn filetime_to_systemtime(filetime: i64) -> SystemTime {
    let ticks = filetime.max(0);

    let duration_since_windows_epoch = ChronoDuration::seconds(ticks / 10_000_000)
        + ChronoDuration::nanoseconds((ticks % 10_000_000) * 100);

    (WINDOWS_EPOCH_UTC + duration_since_windows_epoch).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    const UNIX_EPOCH_FILETIME: i64 = 116_444_736_000_000_000;

    #[test]
    fn filetime_to_systemtime_test() {
        assert_eq!(filetime_to_systemtime(UNIX_EPOCH_FILETIME), UNIX_EPOCH);

        let secs_between_epochs = (UNIX_EPOCH_FILETIME / 10_000_000) as u64;
        let windows_epoch = UNIX_EPOCH - Duration::from_secs(secs_between_epochs);
        assert_eq!(filetime_to_systemtime(0), windows_epoch);
        assert_eq!(filetime_to_systemtime(-5), windows_epoch);

        // 2023-07-15 12:30:45.5 UTC
        let unix_secs: i64 = 1_689_424_245;
        let filetime = UNIX_EPOCH_FILETIME + unix_secs * 10_000_000 + 5_000_000;
        let expected = UNIX_EPOCH + Duration::new(unix_secs as u64, 500_000_000);
        assert_eq!(filetime_to_systemtime(filetime), expected);
    }
}
