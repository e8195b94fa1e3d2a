//! Total order over the ISO-8601 timestamps found in replica metadata.
//!
//! Replicas written by different tools encode the same instant in different
//! ways (`Z` vs `+00:00`, with or without fractional seconds, sometimes with no
//! zone at all). [`parse`] maps all of them onto one UTC instant so the merge
//! engine can compare them.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// Zone-aware formats tried after RFC 3339, in order.
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%:z",
];

/// Zone-less formats, interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Parse a timestamp into a UTC instant.
///
/// A trailing `Z` means `+00:00`, strings without zone information are taken
/// as UTC and explicit offsets are converted. Anything unparseable maps to
/// [`DateTime::<Utc>::MIN_UTC`] so it loses every comparison instead of
/// aborting a merge.
pub fn parse(ts: &str) -> DateTime<Utc> {
    try_parse(ts).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Like [`parse`], but reports failure instead of substituting the minimum.
pub fn try_parse(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if ts.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }

    let normalized = match ts.strip_suffix(['Z', 'z']) {
        Some(rest) => format!("{rest}+00:00"),
        None => ts.to_string(),
    };

    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&normalized, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Render an instant the way injected metadata stores it.
pub fn format(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// The timestamp carried by recovery metadata.
pub fn epoch() -> String {
    format(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_z_and_explicit_zero_offset_are_equal() {
        assert_eq!(
            parse("2024-03-01T12:00:00Z"),
            parse("2024-03-01T12:00:00+00:00")
        );
    }

    #[test]
    fn test_offsets_are_converted_to_utc() {
        assert_eq!(
            parse("2024-03-01T14:00:00+02:00"),
            parse("2024-03-01T12:00:00Z")
        );
        assert_eq!(
            parse("2024-03-01T07:00:00-0500"),
            parse("2024-03-01T12:00:00Z")
        );
    }

    #[test]
    fn test_naive_timestamps_assume_utc() {
        assert_eq!(
            parse("2024-03-01T12:00:00.250000"),
            parse("2024-03-01T12:00:00.25Z")
        );
        assert_eq!(parse("2024-03-01 12:00:00"), parse("2024-03-01T12:00:00Z"));
    }

    #[test]
    fn test_bare_date_is_midnight() {
        assert_eq!(parse("2024-03-01"), parse("2024-03-01T00:00:00Z"));
    }

    #[test]
    fn test_fractional_seconds_order() {
        assert!(parse("2024-03-01T12:00:00.000001Z") > parse("2024-03-01T12:00:00Z"));
    }

    #[test]
    fn test_garbage_maps_to_minimum() {
        assert_eq!(parse("yesterday-ish"), DateTime::<Utc>::MIN_UTC);
        assert_eq!(parse(""), DateTime::<Utc>::MIN_UTC);
        assert!(parse("not a time") < parse(&epoch()));
    }

    #[test]
    fn test_format_roundtrips_through_parse() {
        let now = Utc::now();
        let rendered = format(now);
        assert!(rendered.ends_with("+00:00"));
        assert_eq!(parse(&rendered).timestamp_micros(), now.timestamp_micros());
    }
}
