//! Byte size parsing and formatting.
//!
//! Sizes on the command line and in `crucible.yml` are binary units. A bare
//! number is read as MiB, which is the unit the overlay size has always been
//! given in.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serializer};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Parse a size such as `50000`, `512M`, `8G`, `8GiB` or `1T` into bytes.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    if digits.is_empty() {
        bail!("invalid size '{input}': expected a number with an optional K/M/G/T suffix");
    }
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size '{input}'"))?;

    let multiplier = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "M" | "MB" | "MIB" => MIB,
        "B" => 1,
        "K" | "KB" | "KIB" => KIB,
        "G" | "GB" | "GIB" => GIB,
        "T" | "TB" | "TIB" => TIB,
        other => bail!("invalid size '{input}': unknown unit '{other}'"),
    };

    value
        .checked_mul(multiplier)
        .with_context(|| format!("size '{input}' overflows"))
}

/// Format a byte count for humans, e.g. `52.0 GiB`.
pub fn human(bytes: u64) -> String {
    let units = [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")];
    for (unit, name) in units {
        if bytes >= unit {
            return format!("{:.1} {}", bytes as f64 / unit as f64, name);
        }
    }
    format!("{bytes} B")
}

/// Round `value` up to the nearest multiple of `multiple`.
pub fn round_up(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple) * multiple
}

/// serde adapter so config files can say `overlay-size: 8G`.
pub(crate) fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(mib) => mib
            .checked_mul(MIB)
            .ok_or_else(|| serde::de::Error::custom("size overflows")),
        Raw::Text(text) => parse_size(&text).map_err(serde::de::Error::custom),
    }
}

pub(crate) fn serialize_size<S>(bytes: &u64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if bytes % MIB == 0 {
        serializer.serialize_str(&format!("{}M", bytes / MIB))
    } else {
        serializer.serialize_str(&format!("{bytes}B"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_number_is_mib() {
        assert_eq!(parse_size("50000").unwrap(), 50_000 * MIB);
    }

    #[test]
    fn test_suffixes() {
        assert_eq!(parse_size("4096K").unwrap(), 4 * MIB);
        assert_eq!(parse_size("512M").unwrap(), 512 * MIB);
        assert_eq!(parse_size("8G").unwrap(), 8 * GIB);
        assert_eq!(parse_size("8GiB").unwrap(), 8 * GIB);
        assert_eq!(parse_size("1t").unwrap(), TIB);
        assert_eq!(parse_size("4096B").unwrap(), 4096);
        assert_eq!(parse_size(" 2 G ").unwrap(), 2 * GIB);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("-5").is_err());
        assert!(parse_size("99999999999999999999T").is_err());
    }

    #[test]
    fn test_human() {
        assert_eq!(human(52 * GIB), "52.0 GiB");
        assert_eq!(human(1536 * KIB), "1.5 MiB");
        assert_eq!(human(17), "17 B");
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 2048), 0);
        assert_eq!(round_up(1, 2048), 2048);
        assert_eq!(round_up(2048, 2048), 2048);
        assert_eq!(round_up(2049, 2048), 4096);
    }
}
