use bytesize::ByteSize;

/// Shorthand suffixes read as binary units, the way GPU memory is usually
/// quoted on the command line ("24gb" meaning 24 GiB).
const BINARY_SUFFIXES: [(&str, u32); 5] = [("kb", 10), ("mb", 20), ("gb", 30), ("tb", 40), ("b", 0)];

/// Parse a memory size for the CLI.
///
/// `kb`/`mb`/`gb`/`tb` (any case, fractions allowed) are binary: "1.5kb" is
/// 1536 bytes. Anything else goes through `ByteSize`'s own parser, so
/// explicit units such as "512KiB" or "2 MB" work too.
pub fn parse_memory_size(s: &str) -> Result<ByteSize, String> {
    let trimmed = s.trim();
    let lower = trimmed.to_ascii_lowercase();

    for (suffix, shift) in BINARY_SUFFIXES {
        let Some(number) = lower.strip_suffix(suffix) else {
            continue;
        };
        let Ok(value) = number.trim().parse::<f64>() else {
            break;
        };
        if !value.is_finite() || value < 0.0 {
            return Err(format!("memory size must be a non-negative number: '{trimmed}'"));
        }
        let bytes = value * (1u64 << shift) as f64;
        if bytes >= u64::MAX as f64 {
            return Err(format!("memory size '{trimmed}' is too large"));
        }
        return Ok(ByteSize::b(bytes as u64));
    }

    trimmed
        .parse::<ByteSize>()
        .map_err(|e| format!("invalid memory size '{trimmed}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_memory_size("4096").unwrap(), ByteSize::b(4096));
        assert_eq!(parse_memory_size("64mb").unwrap(), ByteSize::mib(64));
        assert_eq!(parse_memory_size(" 2 GB ").unwrap(), ByteSize::gib(2));
        assert_eq!(parse_memory_size("1.5kb").unwrap().as_u64(), 1536);
        assert_eq!(parse_memory_size("512KiB").unwrap(), ByteSize::kib(512));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_memory_size("").is_err());
        assert!(parse_memory_size("mb").is_err());
        assert!(parse_memory_size("-1gb").is_err());
        assert!(parse_memory_size("10xb").is_err());
        assert!(parse_memory_size("nan gb").is_err());
    }
}
