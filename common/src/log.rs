//! Log line classification shared by the log collaborator and the SSE
//! fan-out. Runner output carries no structured level, so the level is
//! recovered from the message text.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum Level {
    Debug,
    #[default]
    Info,
    Success,
    Warning,
    Error,
    Critical,
}

// Accepts the level bare, bracketed, or prefixed with `level=`/`level:`, as
// long as a non-letter separator (or end of line) follows.
static LEVEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:^|[^\w])(?:level[=:\s]*)?\[?(?P<level>debug|info|success|warn|warning|error|fatal|critical)\]?(?:[^a-zA-Z]|$)",
    )
    .expect("level pattern is valid")
});

/// Extract the log level from a raw message, defaulting to `INFO`.
pub fn extract_level(message: &str) -> Level {
    let Some(captures) = LEVEL_RE.captures(message) else {
        return Level::Info;
    };
    match captures
        .name("level")
        .map(|m| m.as_str().to_ascii_lowercase())
        .as_deref()
    {
        Some("debug") => Level::Debug,
        Some("success") => Level::Success,
        Some("warn") | Some("warning") => Level::Warning,
        Some("error") => Level::Error,
        Some("fatal") | Some("critical") => Level::Critical,
        _ => Level::Info,
    }
}

/// One aggregated log line. `timestamp` is a nanosecond epoch string, kept
/// opaque so cursors survive round-trips to clients unchanged.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Item {
    pub timestamp: String,
    pub message: String,
    pub level: Level,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Item {
    pub fn timestamp_nanos(&self) -> Option<i64> {
        self.timestamp.parse().ok()
    }
}

/// Render a nanosecond epoch as RFC3339 UTC with millisecond precision,
/// the form shown next to log lines in clients.
pub fn nanos_to_rfc3339(nanos: i64) -> String {
    let datetime: DateTime<Utc> = Utc
        .timestamp_opt(nanos / 1_000_000_000, (nanos % 1_000_000_000) as u32)
        .single()
        .unwrap_or_default();
    datetime.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_bracketed_and_prefixed_levels_are_found() {
        assert_eq!(extract_level("[ERROR] connection refused"), Level::Error);
        assert_eq!(extract_level("level=warn slow request"), Level::Warning);
        assert_eq!(extract_level("2024 INFO: listening on :8000"), Level::Info);
        assert_eq!(extract_level("fatal: repository not found"), Level::Critical);
        assert_eq!(extract_level("Success: deployment live"), Level::Success);
    }

    #[test]
    fn embedded_words_do_not_count() {
        assert_eq!(extract_level("processing errors.csv rows"), Level::Info);
        assert_eq!(extract_level("infocenter opened"), Level::Info);
    }

    #[test]
    fn default_level_is_info() {
        assert_eq!(extract_level("GET / 200 4ms"), Level::Info);
        assert_eq!(Level::default(), Level::Info);
    }

    #[test]
    fn nanos_render_as_utc_millis() {
        assert_eq!(nanos_to_rfc3339(1_700_000_000_123_456_789), "2023-11-14T22:13:20.123Z");
    }
}
