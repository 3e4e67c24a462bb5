//! Human-readable byte sizes for cache budgets

use crate::error::{ConfigError, ConfigResult};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Parse a human-readable size string (e.g. "128MiB", "20MB", "4k") into bytes.
///
/// IEC suffixes (`KiB`, `MiB`, ...) are powers of 1024, SI suffixes
/// (`kB`, `MB`, ...) are powers of 1000, and a bare letter (`K`, `M`, `G`,
/// `T`) is treated as IEC. Suffixes are case-insensitive.
pub fn parse_size(s: &str) -> ConfigResult<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kib" => KIB,
        "m" | "mib" => MIB,
        "g" | "gib" => GIB,
        "t" | "tib" => TIB,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "tb" => 1_000_000_000_000,
        _ => return Err(ConfigError::InvalidSize(s.to_string())),
    };

    if num.is_empty() {
        return Err(ConfigError::InvalidSize(s.to_string()));
    }

    if num.contains('.') {
        let value: f64 = num
            .parse()
            .map_err(|_| ConfigError::InvalidSize(s.to_string()))?;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        return Ok((value * multiplier as f64) as u64);
    }

    let value: u64 = num
        .parse()
        .map_err(|_| ConfigError::InvalidSize(s.to_string()))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidSize(s.to_string()))
}

/// Format bytes as a human-readable size string.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    if bytes >= TIB && bytes.is_multiple_of(TIB) {
        format!("{} TiB", bytes / TIB)
    } else if bytes >= GIB && bytes.is_multiple_of(GIB) {
        format!("{} GiB", bytes / GIB)
    } else if bytes >= MIB && bytes.is_multiple_of(MIB) {
        format!("{} MiB", bytes / MIB)
    } else if bytes >= KIB && bytes.is_multiple_of(KIB) {
        format!("{} KiB", bytes / KIB)
    } else {
        format!("{bytes} B")
    }
}
