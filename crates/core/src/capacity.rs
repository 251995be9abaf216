//! Kubernetes quantity parsing, just enough to size a cloud volume in whole GiB.

pub const GIB: u128 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapacityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity {0:?}")]
    Invalid(String),
    #[error("quantity {0:?} is out of range")]
    Overflow(String),
}

/// Parse a quantity (`50Gi`, `500Mi`, `10G`, `1.5Ti`, `1e9`, `1073741824`) into bytes,
/// rounding any fractional byte up.
pub fn quantity_bytes(raw: &str) -> Result<u128, CapacityError> {
    let q = raw.trim();
    if q.is_empty() {
        return Err(CapacityError::Empty);
    }
    let invalid = || CapacityError::Invalid(raw.to_string());
    let overflow = || CapacityError::Overflow(raw.to_string());

    let split = q.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(q.len());
    let (number, suffix) = q.split_at(split);
    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    if frac_part.contains('.') || frac_part.len() > 18 {
        return Err(invalid());
    }
    let mantissa: u128 = format!("{}{}", int_part, frac_part).parse().map_err(|_| invalid())?;
    let scale = 10u128.pow(frac_part.len() as u32);

    let (num, den): (u128, u128) = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (10u128.pow(12), 1),
        "P" => (10u128.pow(15), 1),
        "E" => (10u128.pow(18), 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        s if s.starts_with(['e', 'E']) => {
            let exp: i32 = s[1..].parse().map_err(|_| invalid())?;
            if exp.unsigned_abs() > 30 {
                return Err(overflow());
            }
            let pow = 10u128.pow(exp.unsigned_abs());
            if exp >= 0 { (pow, 1) } else { (1, pow) }
        }
        _ => return Err(invalid()),
    };

    let top = mantissa.checked_mul(num).ok_or_else(overflow)?;
    let bottom = scale.checked_mul(den).ok_or_else(overflow)?;
    Ok(top.div_ceil(bottom))
}

/// Size in whole GiB for a new volume: rounded up, never below 1.
pub fn capacity_to_gib(raw: &str) -> Result<i32, CapacityError> {
    let bytes = quantity_bytes(raw)?;
    let gib = bytes.div_ceil(GIB).max(1);
    i32::try_from(gib).map_err(|_| CapacityError::Overflow(raw.to_string()))
}
