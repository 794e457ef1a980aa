//! Float and integer conversions used by the production and combat formulas.
//!
//! All float-to-integer conversions floor and saturate; `NaN` and negative
//! inputs become zero so a malformed catalog value can never produce a
//! negative ledger delta.

/// Widen an integer amount into formula space.
#[allow(clippy::cast_precision_loss)]
pub(crate) const fn to_f64(value: u64) -> f64 {
    value as f64
}

/// Floor a formula result into a non-negative integer amount.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn floor_to_u64(value: f64) -> u64 {
    // `as` saturates at the top end; max() maps NaN to zero.
    value.max(0.0).floor() as u64
}

/// Floor and clamp a formula result into `[lo, hi]`.
pub(crate) fn clamp_to_u32(value: f64, lo: u32, hi: u32) -> u32 {
    let clamped = value.max(f64::from(lo)).min(f64::from(hi));
    u32::try_from(floor_to_u64(clamped)).unwrap_or(hi)
}

/// `factor^(level - 1)`, the per-level growth curve of costs and build times.
pub(crate) fn growth(factor: f64, level: u32) -> f64 {
    let exponent = i32::try_from(level.saturating_sub(1)).unwrap_or(i32::MAX);
    factor.powi(exponent)
}
