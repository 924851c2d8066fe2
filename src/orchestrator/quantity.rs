// ABOUTME: Parses cpu and memory quantity strings into swarm units.
// ABOUTME: Unknown forms are errors; no default is substituted.

use super::{AdapterError, QuantitySnafu};

/// `"500m"`, `"0.5"` or `"2"` cores into nano-CPUs.
pub fn parse_cpu(value: &str) -> Result<i64, AdapterError> {
    let invalid = || QuantitySnafu { field: "cpu", value }.build();
    let trimmed = value.trim();
    let (number, scale) = match trimmed.strip_suffix('m') {
        Some(millis) => (millis, 1e6),
        None => (trimmed, 1e9),
    };
    let amount: f64 = number.parse().map_err(|_| invalid())?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(invalid());
    }
    Ok((amount * scale).round() as i64)
}

const UNITS: [(&str, f64); 10] = [
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("k", 1e3),
    ("K", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("", 1.0),
];

/// `"512Mi"`, `"1G"` or a plain byte count into bytes.
pub fn parse_memory(value: &str) -> Result<i64, AdapterError> {
    let invalid = || QuantitySnafu { field: "memory", value }.build();
    let trimmed = value.trim();
    let (number, factor) = UNITS
        .iter()
        .find_map(|(suffix, factor)| trimmed.strip_suffix(suffix).map(|n| (n, *factor)))
        .ok_or_else(invalid)?;
    let amount: f64 = number.parse().map_err(|_| invalid())?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(invalid());
    }
    Ok((amount * factor).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::AdapterErrorKind;

    #[test]
    fn cpu_forms() {
        assert_eq!(parse_cpu("500m").unwrap(), 500_000_000);
        assert_eq!(parse_cpu("0.25").unwrap(), 250_000_000);
        assert_eq!(parse_cpu("2").unwrap(), 2_000_000_000);
    }

    #[test]
    fn memory_forms() {
        assert_eq!(parse_memory("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_memory("4096").unwrap(), 4096);
    }

    #[test]
    fn garbage_is_rejected() {
        for bad in ["lots", "", "-1", "12Xi", "m"] {
            let err = parse_memory(bad).unwrap_err();
            assert_eq!(err.kind(), AdapterErrorKind::Quantity, "{bad}");
        }
        assert!(parse_cpu("fast").is_err());
        assert!(parse_cpu("0").is_err());
    }
}
