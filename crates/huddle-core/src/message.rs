//! Notice text and timestamps for relayed messages.

use chrono::Local;
use std::fmt::Write;

/// Default time-of-day format, e.g. `3:04:05 PM`.
pub const DEFAULT_TIME_FORMAT: &str = "%-I:%M:%S %p";

/// Format the current local time of day.
///
/// Falls back to [`DEFAULT_TIME_FORMAT`] if `format` is not a valid
/// strftime string.
#[must_use]
pub fn time_of_day(format: &str) -> String {
    let now = Local::now();
    let mut out = String::new();
    if write!(out, "{}", now.format(format)).is_err() {
        out.clear();
        let _ = write!(out, "{}", now.format(DEFAULT_TIME_FORMAT));
    }
    out
}

/// Notice broadcast when a connection joins a room.
#[must_use]
pub fn joined_notice(display_name: &str) -> String {
    format!("{display_name} joined the room.")
}

/// Notice broadcast when a connection leaves a room.
#[must_use]
pub fn left_notice(display_name: &str) -> String {
    format!("{display_name} left the room.")
}
