// =============================================================================
// Human-friendly duration parsing for session parameters
// =============================================================================
//
// Accepted forms: "10h", "30min", "45sek", "45s", "1d", "1w", and combined
// strings like "2h 15min 30sek". Units are case-insensitive and include the
// Polish aliases the original operators used (sek, godzina, dzien, tydzien).
// Zero and negative durations are invalid.
// =============================================================================

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeParseError(pub String);

impl fmt::Display for TimeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid duration: {}", self.0)
    }
}

impl std::error::Error for TimeParseError {}

fn unit_seconds(unit: &str) -> Option<u64> {
    match unit {
        "s" | "sec" | "sek" | "second" | "seconds" => Some(1),
        "m" | "min" | "minute" | "minutes" => Some(60),
        "h" | "hour" | "hours" | "godzina" | "godzin" | "godziny" => Some(3_600),
        "d" | "day" | "days" | "dzien" | "dni" => Some(86_400),
        "w" | "week" | "weeks" | "tydzien" | "tygodnie" => Some(604_800),
        _ => None,
    }
}

/// Parse a human duration string into seconds.
///
/// Every `<number><unit>` group contributes; groups may be separated by
/// whitespace. Fractional numbers are allowed ("1.5h" = 5400s).
pub fn parse_duration(input: &str) -> Result<u64, TimeParseError> {
    let trimmed = input.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return Err(TimeParseError(format!("empty duration string: {input:?}")));
    }

    let mut total: f64 = 0.0;
    let mut chars = trimmed.chars().peekable();
    let mut matched_any = false;

    while chars.peek().is_some() {
        // Skip separators between groups.
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        // Number part.
        let mut number = String::new();
        while matches!(chars.peek(), Some(c) if c.is_ascii_digit() || *c == '.') {
            number.push(chars.next().unwrap());
        }
        if number.is_empty() {
            return Err(TimeParseError(format!(
                "expected a number in {input:?}, use forms like 10h, 30min, 2h 15min 30sek"
            )));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| TimeParseError(format!("bad number {number:?} in {input:?}")))?;

        // Unit part (optional whitespace between number and unit tolerated).
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let mut unit = String::new();
        while matches!(chars.peek(), Some(c) if c.is_ascii_alphabetic()) {
            unit.push(chars.next().unwrap());
        }
        let mult = unit_seconds(&unit)
            .ok_or_else(|| TimeParseError(format!("unknown time unit {unit:?} in {input:?}")))?;

        total += value * mult as f64;
        matched_any = true;
    }

    if !matched_any {
        return Err(TimeParseError(format!(
            "could not parse duration {input:?}"
        )));
    }

    let seconds = total as u64;
    if seconds == 0 {
        return Err(TimeParseError(format!(
            "duration must be greater than zero: {input:?}"
        )));
    }

    Ok(seconds)
}

/// Format seconds back into the compact operator form, e.g. `2h 15min 30sek`.
pub fn format_duration(seconds: u64) -> String {
    const UNITS: &[(&str, u64)] = &[
        ("w", 604_800),
        ("d", 86_400),
        ("h", 3_600),
        ("min", 60),
        ("sek", 1),
    ];

    let mut parts = Vec::new();
    let mut remaining = seconds;
    for &(name, secs) in UNITS {
        if remaining >= secs {
            parts.push(format!("{}{}", remaining / secs, name));
            remaining %= secs;
        }
    }

    if parts.is_empty() {
        "0sek".to_string()
    } else {
        parts.join(" ")
    }
}

/// Format a trade duration for the register export: always `{h}h {m}m {s}s`
/// with empty leading components dropped.
pub fn format_trade_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{secs}s"));
    }
    parts.join(" ")
}

/// Parse with bounds. Used by config validation so operators get a readable
/// message instead of a surprise mid-session.
pub fn parse_bounded(
    input: &str,
    min_seconds: Option<u64>,
    max_seconds: Option<u64>,
) -> Result<u64, TimeParseError> {
    let seconds = parse_duration(input)?;

    if let Some(min) = min_seconds {
        if seconds < min {
            return Err(TimeParseError(format!(
                "duration too short: {} < {}",
                format_duration(seconds),
                format_duration(min)
            )));
        }
    }
    if let Some(max) = max_seconds {
        if seconds > max {
            return Err(TimeParseError(format!(
                "duration too long: {} > {}",
                format_duration(seconds),
                format_duration(max)
            )));
        }
    }

    Ok(seconds)
}
