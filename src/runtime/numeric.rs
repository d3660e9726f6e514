// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Numeric helpers the interpreter can't express as a plain Rust operator:
//! trapping integer division/remainder and trapping float-to-int truncation.
//!
//! Everything else (wrapping add/sub/mul, masked shifts, rotates, bitwise
//! ops, float arithmetic, reinterpretation) maps directly onto a method or
//! operator Rust's integer/float types already provide with the right
//! semantics, so the interpreter calls those inline instead of wrapping them
//! here.

use super::Trap;

pub(crate) fn div_s_32(a: i32, b: i32) -> Result<i32, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    if a == i32::MIN && b == -1 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(a.wrapping_div(b))
}

pub(crate) fn div_u_32(a: u32, b: u32) -> Result<u32, Trap> {
    a.checked_div(b).ok_or(Trap::IntegerDivideByZero)
}

pub(crate) fn rem_s_32(a: i32, b: i32) -> Result<i32, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(a.wrapping_rem(b))
}

pub(crate) fn rem_u_32(a: u32, b: u32) -> Result<u32, Trap> {
    a.checked_rem(b).ok_or(Trap::IntegerDivideByZero)
}

pub(crate) fn div_s_64(a: i64, b: i64) -> Result<i64, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    if a == i64::MIN && b == -1 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(a.wrapping_div(b))
}

pub(crate) fn div_u_64(a: u64, b: u64) -> Result<u64, Trap> {
    a.checked_div(b).ok_or(Trap::IntegerDivideByZero)
}

pub(crate) fn rem_s_64(a: i64, b: i64) -> Result<i64, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(a.wrapping_rem(b))
}

pub(crate) fn rem_u_64(a: u64, b: u64) -> Result<u64, Trap> {
    a.checked_rem(b).ok_or(Trap::IntegerDivideByZero)
}

pub(crate) fn f32_min(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_negative() || b.is_sign_negative() { -0.0 } else { 0.0 };
    }
    a.min(b)
}

pub(crate) fn f32_max(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_positive() && b.is_sign_positive() { 0.0 } else { -0.0 };
    }
    a.max(b)
}

pub(crate) fn f64_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_negative() || b.is_sign_negative() { -0.0 } else { 0.0 };
    }
    a.min(b)
}

pub(crate) fn f64_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_positive() && b.is_sign_positive() { 0.0 } else { -0.0 };
    }
    a.max(b)
}

// `v` has already been widened to `f64` by the caller (exact for values that
// started as `f32`), so a single set of bounds checks covers both trunc_f32
// and trunc_f64 opcodes.

pub(crate) fn trunc_to_i32_s(v: f64) -> Result<i32, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    let t = v.trunc();
    if t < -2147483648.0 || t >= 2147483648.0 {
        return Err(Trap::InvalidConversionToInteger);
    }
    Ok(t as i32)
}

pub(crate) fn trunc_to_i32_u(v: f64) -> Result<u32, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    let t = v.trunc();
    if t < 0.0 || t >= 4294967296.0 {
        return Err(Trap::InvalidConversionToInteger);
    }
    Ok(t as u32)
}

pub(crate) fn trunc_to_i64_s(v: f64) -> Result<i64, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    let t = v.trunc();
    if t < -9223372036854775808.0 || t >= 9223372036854775808.0 {
        return Err(Trap::InvalidConversionToInteger);
    }
    Ok(t as i64)
}

pub(crate) fn trunc_to_i64_u(v: f64) -> Result<u64, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    let t = v.trunc();
    if t < 0.0 || t >= 18446744073709551616.0 {
        return Err(Trap::InvalidConversionToInteger);
    }
    Ok(t as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_division_traps_on_zero_and_overflow() {
        assert_eq!(div_s_32(10, 3), Ok(3));
        assert_eq!(div_s_32(1, 0), Err(Trap::IntegerDivideByZero));
        assert_eq!(div_s_32(i32::MIN, -1), Err(Trap::IntegerOverflow));
        // Unlike div_s, rem_s of MIN % -1 doesn't overflow: it's exactly 0.
        assert_eq!(rem_s_32(i32::MIN, -1), Ok(0));
    }

    #[test]
    fn unsigned_division_traps_only_on_zero() {
        assert_eq!(div_u_32(10, 3), Ok(3));
        assert_eq!(div_u_32(1, 0), Err(Trap::IntegerDivideByZero));
        assert_eq!(rem_u_64(10, 0), Err(Trap::IntegerDivideByZero));
    }

    #[test]
    fn float_min_max_break_zero_sign_ties_and_propagate_nan() {
        assert_eq!(f32_min(0.0, -0.0).is_sign_negative(), true);
        assert_eq!(f32_max(0.0, -0.0).is_sign_negative(), false);
        assert!(f64_min(f64::NAN, 1.0).is_nan());
        assert!(f64_max(1.0, f64::NAN).is_nan());
    }

    #[test]
    fn trunc_rejects_nan_and_out_of_range() {
        assert_eq!(trunc_to_i32_s(3.9), Ok(3));
        assert_eq!(trunc_to_i32_s(-3.9), Ok(-3));
        assert_eq!(trunc_to_i32_s(f64::NAN), Err(Trap::InvalidConversionToInteger));
        assert_eq!(trunc_to_i32_s(2147483648.0), Err(Trap::InvalidConversionToInteger));
        assert_eq!(trunc_to_i32_s(-2147483648.0), Ok(i32::MIN));
        assert_eq!(trunc_to_i32_u(-1.0), Err(Trap::InvalidConversionToInteger));
        assert_eq!(trunc_to_i64_u(18446744073709551616.0), Err(Trap::InvalidConversionToInteger));
    }
}
