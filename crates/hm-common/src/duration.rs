//! ---
//! hm_section: "01-core-functionality"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Shared primitives and utilities for the orchestration runtime."
//! hm_version: "v0.0.0-prealpha"
//! hm_owner: "tbd"
//! ---
//! Human duration strings (`"500ms"`, `"2s"`, `"1m30s"`) as written in
//! compose files.

use std::time::Duration;

const MS_PER_SECOND: u64 = 1_000;
const MS_PER_MINUTE: u64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;

/// Parse a duration string made of one or more `<number><unit>` segments.
///
/// Supported units are `ms`, `s`, `m` and `h`. A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration string".to_owned());
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        let secs: u64 = trimmed
            .parse()
            .map_err(|_| format!("invalid number in duration: {trimmed}"))?;
        return Ok(Duration::from_secs(secs));
    }

    let mut total_ms: u64 = 0;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration: {trimmed}"))?;
        if digits_end == 0 {
            return Err(format!("expected a number in duration: {trimmed}"));
        }
        let (number, tail) = rest.split_at(digits_end);
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);

        let value: u64 = number
            .parse()
            .map_err(|_| format!("invalid number in duration: {number}"))?;
        let multiplier = match unit {
            "ms" => 1,
            "s" => MS_PER_SECOND,
            "m" => MS_PER_MINUTE,
            "h" => MS_PER_HOUR,
            other => return Err(format!("unknown duration unit: {other}")),
        };
        let segment = value
            .checked_mul(multiplier)
            .ok_or_else(|| format!("duration value too large: {trimmed}"))?;
        total_ms = total_ms
            .checked_add(segment)
            .ok_or_else(|| format!("duration value too large: {trimmed}"))?;
        rest = next;
    }
    Ok(Duration::from_millis(total_ms))
}

/// Format a duration using the largest unit that divides it evenly.
pub fn format_duration(duration: &Duration) -> String {
    let millis = duration.as_millis() as u64;
    if millis == 0 {
        return "0s".to_owned();
    }
    if millis % MS_PER_HOUR == 0 {
        format!("{}h", millis / MS_PER_HOUR)
    } else if millis % MS_PER_MINUTE == 0 {
        format!("{}m", millis / MS_PER_MINUTE)
    } else if millis % MS_PER_SECOND == 0 {
        format!("{}s", millis / MS_PER_SECOND)
    } else {
        format!("{millis}ms")
    }
}
