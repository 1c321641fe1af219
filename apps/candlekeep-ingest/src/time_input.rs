use chrono::{DateTime, TimeZone, Utc};

/// Epoch seconds, epoch milliseconds (anything above 1e12) or RFC 3339.
pub fn parse_time_input(value: &str) -> Result<DateTime<Utc>, String> {
    let value = value.trim();
    if let Ok(ts) = value.parse::<i64>() {
        let parsed = if ts > 1_000_000_000_000 {
            Utc.timestamp_millis_opt(ts).single()
        } else {
            Utc.timestamp_opt(ts, 0).single()
        };
        return parsed.ok_or_else(|| format!("invalid epoch: {value}"));
    }

    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("unsupported timestamp format: {value}"))
}

#[cfg(test)]
mod tests {
    use super::parse_time_input;
    use chrono::{TimeZone, Utc};

    #[test]
    fn accepts_seconds_millis_and_rfc3339() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_time_input("1704067200").unwrap(), expected);
        assert_eq!(parse_time_input("1704067200000").unwrap(), expected);
        assert_eq!(parse_time_input("2024-01-01T00:00:00Z").unwrap(), expected);
        assert_eq!(parse_time_input("2024-01-01T02:00:00+02:00").unwrap(), expected);
    }

    #[test]
    fn millis_keep_sub_second_precision() {
        let ts = parse_time_input("1704067200500").unwrap();
        assert_eq!(ts.timestamp_millis(), 1_704_067_200_500);
    }

    #[test]
    fn rejects_other_formats() {
        let err = parse_time_input("2024-01-01 00:00").unwrap_err();
        assert!(err.contains("unsupported timestamp format"));
    }
}
