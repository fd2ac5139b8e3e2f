//! Size and offset grammar: `<digits>` bytes, or with an `M` (MiB) or `G`
//! (GiB) suffix.

use crate::error::InvalidSize;

pub const fn mib(count: u64) -> u64 {
    count << 20
}

pub const fn gib(count: u64) -> u64 {
    count << 30
}

/// Parse a size string such as `446`, `1M` or `4G` into bytes.
pub fn parse_size(value: &str) -> Result<u64, InvalidSize> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(InvalidSize(value.to_string()));
    }
    let count: u64 = digits
        .parse()
        .map_err(|_| InvalidSize(value.to_string()))?;
    let multiplier: u64 = match suffix {
        "" => 1,
        "M" => mib(1),
        "G" => gib(1),
        _ => return Err(InvalidSize(value.to_string())),
    };
    count
        .checked_mul(multiplier)
        .ok_or_else(|| InvalidSize(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bytes() {
        assert_eq!(parse_size("446").unwrap(), 446);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn test_suffixes() {
        assert_eq!(parse_size("1M").unwrap(), 1_048_576);
        assert_eq!(parse_size("400M").unwrap(), 400 * 1_048_576);
        assert_eq!(parse_size("4G").unwrap(), 4 * 1_073_741_824);
    }

    #[test]
    fn test_rejects_unknown_suffix() {
        assert_eq!(parse_size("10K"), Err(InvalidSize("10K".to_string())));
        assert!(parse_size("1MB").is_err());
        assert!(parse_size("1m").is_err());
    }

    #[test]
    fn test_rejects_non_numeric() {
        assert!(parse_size("").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("-1").is_err());
        assert!(parse_size("ten").is_err());
    }

    #[test]
    fn test_rejects_overflow() {
        assert!(parse_size("99999999999999999999G").is_err());
        assert!(parse_size("17179869184G").is_err());
    }
}
