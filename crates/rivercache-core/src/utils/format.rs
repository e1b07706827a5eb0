use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Compact duration: `45s`, `5m`, `2h`, `3d`.
///
/// Hours round up from 30 minutes, days from 12 hours.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < MINUTE {
        format!("{}s", secs)
    } else if secs < HOUR {
        format!("{}m", secs / MINUTE)
    } else if secs < DAY {
        let minutes = secs / MINUTE;
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            // 1h 30m+ becomes 2h
            format!("{}h", hours + 1)
        } else {
            format!("{}h", hours)
        }
    } else {
        let hours = secs / HOUR;
        let days = hours / 24;
        if hours % 24 >= 12 {
            format!("{}d", days + 1)
        } else {
            format!("{}d", days)
        }
    }
}

/// How long ago something was cached or observed, e.g. `5m ago`.
pub fn format_age(age: Duration) -> String {
    if age.as_secs() < MINUTE {
        "just now".to_string()
    } else {
        format!("{} ago", format_duration(age))
    }
}

/// Discharge in m³/s, two decimals.
pub fn format_flow(discharge: Option<f64>) -> String {
    match discharge {
        Some(q) => format!("{:.2} m³/s", q),
        None => "n/a".to_string(),
    }
}

/// Water level in metres, three decimals.
pub fn format_level(level: Option<f64>) -> String {
    match level {
        Some(h) => format!("{:.3} m", h),
        None => "n/a".to_string(),
    }
}

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(Duration::from_secs(20)), "just now");
        assert_eq!(format_age(minutes(5)), "5m ago");
        assert_eq!(format_age(minutes(89)), "1h ago");
        assert_eq!(format_age(minutes(90)), "2h ago");
        assert_eq!(format_age(minutes(60 * 36)), "2d ago");
        assert_eq!(format_age(minutes(60 * 35)), "1d ago");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(minutes(360)), "6h");
        assert_eq!(format_duration(minutes(60 * 24 * 3)), "3d");
    }

    #[test]
    fn test_format_measurements() {
        assert_eq!(format_flow(Some(8.4321)), "8.43 m³/s");
        assert_eq!(format_flow(None), "n/a");
        assert_eq!(format_level(Some(1.2)), "1.200 m");
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("Hello", 10), "Hello");
        assert_eq!(truncate_string("Hello World", 8), "Hello...");
        assert_eq!(truncate_string("Hi", 2), "Hi");
        assert_eq!(truncate_string("Rivière-du-Loup", 7), "Rivi...");
    }
}
