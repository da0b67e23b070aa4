//! Human-readable duration formatting for reports
//!
//! Timing metrics are stored in seconds with full precision. Reports render
//! them at a resolution that suits their magnitude.

/// Format selection thresholds (seconds)
const SHORT_FORMAT_MAX: f64 = 100.0; // < 100s → X.XXs
const MEDIUM_FORMAT_MAX: f64 = 6000.0; // < 100m → M:SS.Xs
const LONG_FORMAT_MAX: f64 = 90000.0; // < 25h → H:MM:SS
                                      // >= 25h → X.XXd

/// Format seconds using a format chosen by the column's typical maximum
///
/// All rows of a report column should share one `typical_max` so they line
/// up; use [`format_seconds`] for a single value.
///
/// # Examples
///
/// ```
/// use apv_common::human_time::format_human_time;
///
/// assert_eq!(format_human_time(1.234, 10.0), "1.23s");
/// assert_eq!(format_human_time(330.0, 600.0), "5:30.0s");
/// assert_eq!(format_human_time(3661.0, 14400.0), "1:01:01");
/// assert_eq!(format_human_time(172800.0, 200000.0), "2.00d");
/// ```
pub fn format_human_time(seconds: f64, typical_max: f64) -> String {
    if !seconds.is_finite() {
        return format!("{}", seconds);
    }

    let is_negative = seconds < 0.0;
    let abs_seconds = seconds.abs();

    let formatted = if typical_max < SHORT_FORMAT_MAX {
        format!("{:.2}s", abs_seconds)
    } else if typical_max < MEDIUM_FORMAT_MAX {
        let minutes = (abs_seconds / 60.0).floor();
        let secs = abs_seconds - minutes * 60.0;
        format!("{}:{:04.1}s", minutes as u64, secs)
    } else if typical_max < LONG_FORMAT_MAX || abs_seconds < LONG_FORMAT_MAX {
        let whole = abs_seconds.round() as u64;
        format!("{}:{:02}:{:02}", whole / 3600, (whole % 3600) / 60, whole % 60)
    } else {
        format!("{:.2}d", abs_seconds / 86400.0)
    };

    if is_negative {
        format!("-{}", formatted)
    } else {
        formatted
    }
}

/// Format seconds with the format inferred from the value itself
pub fn format_seconds(seconds: f64) -> String {
    format_human_time(seconds, seconds.abs())
}
