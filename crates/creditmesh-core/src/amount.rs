//! Exact conversion between wire decimal strings and atoms.
//!
//! An amount for an equivalent with precision `p` is carried internally as
//! a base-10 integer with `p` implied fractional digits. The conversion is
//! exact in both directions; no floating point is ever involved.

use crate::error::MeshError;
use crate::types::Atoms;

/// Parse a decimal string into atoms under the given precision.
///
/// Accepts `"250"`, `"250.00"`, `"0.5"`. Rejects negative amounts, more
/// fractional digits than the precision allows, and anything non-numeric.
pub fn parse_amount(s: &str, precision: u32) -> Result<Atoms, MeshError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(MeshError::InvalidRequest("empty amount".into()));
    }
    if s.starts_with('-') || s.starts_with('+') {
        return Err(MeshError::InvalidRequest(format!(
            "amount must be an unsigned decimal, got {s:?}"
        )));
    }

    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(MeshError::InvalidRequest(format!("malformed amount {s:?}")));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(MeshError::InvalidRequest(format!("malformed amount {s:?}")));
    }
    if frac_part.len() > precision as usize {
        return Err(MeshError::InvalidRequest(format!(
            "amount {s:?} has more than {precision} fractional digits"
        )));
    }

    let scale = pow10(precision)?;
    let int_atoms: Atoms = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse::<Atoms>()
            .map_err(|_| MeshError::InvalidRequest(format!("amount {s:?} out of range")))?
    };
    let mut frac_atoms: Atoms = if frac_part.is_empty() {
        0
    } else {
        frac_part
            .parse::<Atoms>()
            .map_err(|_| MeshError::InvalidRequest(format!("amount {s:?} out of range")))?
    };
    // Right-pad the fraction to the full precision: "0.5" at p=2 is 50 atoms.
    frac_atoms = frac_atoms
        .checked_mul(pow10(precision - frac_part.len() as u32)?)
        .ok_or_else(|| MeshError::InvalidRequest(format!("amount {s:?} out of range")))?;

    int_atoms
        .checked_mul(scale)
        .and_then(|v| v.checked_add(frac_atoms))
        .ok_or_else(|| MeshError::InvalidRequest(format!("amount {s:?} out of range")))
}

/// Render atoms as a decimal string, always with `precision` fractional
/// digits (`25000` atoms at precision 2 → `"250.00"`).
pub fn format_amount(atoms: Atoms, precision: u32) -> String {
    if precision == 0 {
        return atoms.to_string();
    }
    // Precision is validated at equivalent creation; fall back to the raw
    // integer if an unrepresentable precision ever reaches us.
    let Ok(scale) = pow10(precision) else {
        return atoms.to_string();
    };
    let int_part = atoms / scale;
    let frac_part = atoms % scale;
    format!(
        "{int_part}.{frac_part:0width$}",
        width = precision as usize
    )
}

fn pow10(exp: u32) -> Result<Atoms, MeshError> {
    (10 as Atoms)
        .checked_pow(exp)
        .ok_or_else(|| MeshError::InvalidRequest(format!("precision {exp} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_whole_and_fractional() {
        assert_eq!(parse_amount("250.00", 2).unwrap(), 25_000);
        assert_eq!(parse_amount("250", 2).unwrap(), 25_000);
        assert_eq!(parse_amount("0.5", 2).unwrap(), 50);
        assert_eq!(parse_amount(".5", 2).unwrap(), 50);
        assert_eq!(parse_amount("0", 2).unwrap(), 0);
        assert_eq!(parse_amount("3", 0).unwrap(), 3);
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(parse_amount("-1", 2).is_err());
        assert!(parse_amount("1.234", 2).is_err());
        assert!(parse_amount("1.2.3", 2).is_err());
        assert!(parse_amount("abc", 2).is_err());
        assert!(parse_amount("", 2).is_err());
        assert!(parse_amount(".", 2).is_err());
        assert!(parse_amount("1.5", 0).is_err());
    }

    #[test]
    fn formats_with_full_precision() {
        assert_eq!(format_amount(25_000, 2), "250.00");
        assert_eq!(format_amount(50, 2), "0.50");
        assert_eq!(format_amount(5, 2), "0.05");
        assert_eq!(format_amount(0, 2), "0.00");
        assert_eq!(format_amount(7, 0), "7");
    }

    #[test]
    fn round_trips_exactly() {
        for s in ["0.01", "123456789.99", "0.00", "42.10"] {
            let atoms = parse_amount(s, 2).unwrap();
            assert_eq!(format_amount(atoms, 2), s);
        }
    }
}
