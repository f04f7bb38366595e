//! Human-readable byte sizes ("128MB", "1GB").

use thiserror::Error;

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

/// Suffixes in match order; longer spellings first so "MB" is not read as "B".
const SUFFIXES: &[(&str, usize)] = &[
    ("GB", GB),
    ("G", GB),
    ("MB", MB),
    ("M", MB),
    ("KB", KB),
    ("K", KB),
    ("B", 1),
];

/// Error parsing a size string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid size '{input}' - expected format like '128MB', '1GB', or '512KB'")]
pub struct SizeParseError {
    input: String,
}

/// Parse a size with an optional binary suffix (case-insensitive).
///
/// ```
/// use imagefetcher::config::parse_size;
///
/// assert_eq!(parse_size("4096").unwrap(), 4096);
/// assert_eq!(parse_size("128MB").unwrap(), 128 * 1024 * 1024);
/// assert_eq!(parse_size(" 2 g ").unwrap(), 2 * 1024 * 1024 * 1024);
/// ```
pub fn parse_size(input: &str) -> Result<usize, SizeParseError> {
    let error = || SizeParseError {
        input: input.to_string(),
    };

    let trimmed = input.trim();
    let upper = trimmed.to_ascii_uppercase();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, multiplier)| {
            upper
                .strip_suffix(suffix)
                .map(|number| (number.trim_end(), *multiplier))
        })
        .unwrap_or((upper.as_str(), 1));

    if number.is_empty() {
        return Err(error());
    }

    number
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(error)
}

/// Format a byte count using the largest suffix that divides it exactly.
///
/// ```
/// use imagefetcher::config::format_size;
///
/// assert_eq!(format_size(128 * 1024 * 1024), "128MB");
/// assert_eq!(format_size(1500), "1500");
/// ```
pub fn format_size(bytes: usize) -> String {
    for (suffix, unit) in [("GB", GB), ("MB", MB), ("KB", KB)] {
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}
