// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Formatting and parsing helpers shared by the library and the CLI.

use std::time::Duration;

/// Mask a sensitive string (like a bearer token) for logging.
///
/// Shows only the first `visible_prefix` characters and replaces the rest with "...".
///
/// # Examples
///
/// ```
/// use modelyard::utils::mask_sensitive;
///
/// let token = "hf_abcdefghijklmnopqrstuvwxyz";
/// assert_eq!(mask_sensitive(token, 5), "hf_ab...");
/// ```
pub fn mask_sensitive(input: &str, visible_prefix: usize) -> String {
    if input.len() <= visible_prefix {
        // Still mask short values so their length is not leaked
        return format!("{}...", input);
    }

    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

/// Human-readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Human-readable transfer speed.
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0) as u64))
}

/// Human-readable remaining time.
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Parse a bandwidth limit such as `512K`, `2M`, `1.5M`, `1G` or `65536`.
///
/// Suffixes are binary multiples and may be followed by `B` or `B/s`.
/// `0` means unlimited.
pub fn parse_rate(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let lowered = trimmed.to_ascii_lowercase();
    let body = lowered.trim_end_matches("/s").trim_end_matches('b');

    let (number, multiplier) = match body.chars().last() {
        Some('k') => (&body[..body.len() - 1], 1024.0),
        Some('m') => (&body[..body.len() - 1], 1_048_576.0),
        Some('g') => (&body[..body.len() - 1], 1_073_741_824.0),
        _ => (body, 1.0),
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid rate '{}': expected e.g. 512K, 2M or 1048576", trimmed))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid rate '{}': must be a non-negative number", trimmed));
    }

    Ok((value * multiplier).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_sensitive() {
        assert_eq!(mask_sensitive("hf_secret123", 3), "hf_...");
        assert_eq!(mask_sensitive("short", 8), "short...");
        assert_eq!(mask_sensitive("", 8), "...");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1_048_576), "5.0 MB");
        assert_eq!(format_bytes(4_108_916_384), "3.8 GB");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(Duration::from_secs(42)), "42s");
        assert_eq!(format_eta(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_eta(Duration::from_secs(7260)), "2h 1m");
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("0"), Ok(0));
        assert_eq!(parse_rate("65536"), Ok(65536));
        assert_eq!(parse_rate("512K"), Ok(512 * 1024));
        assert_eq!(parse_rate("2M"), Ok(2 * 1_048_576));
        assert_eq!(parse_rate("1.5MB/s"), Ok(1_572_864));
        assert_eq!(parse_rate("1g"), Ok(1_073_741_824));
        assert!(parse_rate("fast").is_err());
        assert!(parse_rate("-1M").is_err());
    }
}
