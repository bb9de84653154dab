use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Parses an ISO 8601 instant. Strings without an offset are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Formats an instant the way flow tables store it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_utc_suffix() {
        let ts = parse_timestamp("2024-03-01T12:00:00.250Z").unwrap();
        assert_eq!(ts.timestamp_millis(), 1_709_294_400_250);
    }

    #[test]
    fn test_parse_offset_and_naive_agree() {
        let a = parse_timestamp("2024-03-01T13:00:00+01:00").unwrap();
        let b = parse_timestamp("2024-03-01T12:00:00").unwrap();
        let c = parse_timestamp("2024-03-01 12:00:00.000").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_format_roundtrip() {
        let ts = Utc.timestamp_opt(100, 123_456_000).unwrap();
        let s = format_timestamp(&ts);
        assert_eq!(s, "1970-01-01T00:01:40.123456Z");
        assert_eq!(parse_timestamp(&s), Some(ts));
    }
}
