//! Pure numeric evaluators: the arithmetic, integer, and floating-point
//! operator families the engine's instruction dispatch calls into.
//!
//! Lifted from a classic `RuntimeValue`-style evaluator: one small trait
//! per operator family, implemented once per concrete Rust numeric type,
//! so `engine` dispatch reads as `a.add(b)` rather than a giant match.

use crate::error::NumericError;
use crate::nan_preserving_float::{F32, F64};

/// Arithmetic operations shared by integers and floats.
pub trait ArithmeticOps<T> {
    fn add(self, other: T) -> T;
    fn sub(self, other: T) -> T;
    fn mul(self, other: T) -> T;
    fn div(self, other: T) -> Result<T, NumericError>;
}

/// Integer-only operations.
pub trait Integer<T>: ArithmeticOps<T> {
    fn leading_zeros(self) -> T;
    fn trailing_zeros(self) -> T;
    fn count_ones(self) -> T;
    fn rotl(self, other: T) -> T;
    fn rotr(self, other: T) -> T;
    fn rem(self, other: T) -> Result<T, NumericError>;
}

/// Float-only operations.
pub trait Float<T>: ArithmeticOps<T> {
    fn abs(self) -> T;
    fn floor(self) -> T;
    fn ceil(self) -> T;
    fn trunc(self) -> T;
    fn nearest(self) -> T;
    fn sqrt(self) -> T;
    fn min(self, other: T) -> T;
    fn max(self, other: T) -> T;
    fn copysign(self, other: T) -> T;
}

/// Truncating float-to-int conversion, trapping on NaN/infinity/overflow.
pub trait TryTruncateInto<T, E> {
    fn try_truncate_into(self) -> Result<T, E>;
}

/// Zero/sign-extension into a wider integer type.
pub trait ExtendInto<T> {
    fn extend_into(self) -> T;
}

/// Narrowing by dropping high bits (the opposite of `ExtendInto`).
pub trait WrapInto<T> {
    fn wrap_into(self) -> T;
}

/// Bit-for-bit reinterpretation between same-width types.
pub trait TransmuteInto<T> {
    fn transmute_into(self) -> T;
}

macro_rules! impl_integer_arithmetic {
    ($int:ty) => {
        impl ArithmeticOps<$int> for $int {
            fn add(self, other: $int) -> $int {
                self.wrapping_add(other)
            }
            fn sub(self, other: $int) -> $int {
                self.wrapping_sub(other)
            }
            fn mul(self, other: $int) -> $int {
                self.wrapping_mul(other)
            }
            fn div(self, other: $int) -> Result<$int, NumericError> {
                if other == 0 {
                    Err(NumericError::DivisionByZero)
                } else {
                    self.checked_div(other).ok_or(NumericError::Overflow)
                }
            }
        }

        impl Integer<$int> for $int {
            fn leading_zeros(self) -> $int {
                self.leading_zeros() as $int
            }
            fn trailing_zeros(self) -> $int {
                self.trailing_zeros() as $int
            }
            fn count_ones(self) -> $int {
                self.count_ones() as $int
            }
            fn rotl(self, other: $int) -> $int {
                self.rotate_left(other as u32 % (std::mem::size_of::<$int>() as u32 * 8))
            }
            fn rotr(self, other: $int) -> $int {
                self.rotate_right(other as u32 % (std::mem::size_of::<$int>() as u32 * 8))
            }
            fn rem(self, other: $int) -> Result<$int, NumericError> {
                if other == 0 {
                    Err(NumericError::DivisionByZero)
                } else {
                    Ok(self.wrapping_rem(other))
                }
            }
        }
    };
}

impl_integer_arithmetic!(i32);
impl_integer_arithmetic!(i64);
impl_integer_arithmetic!(u32);
impl_integer_arithmetic!(u64);

macro_rules! impl_float_arithmetic {
    ($float:ty, $raw:ty) => {
        impl ArithmeticOps<$float> for $float {
            fn add(self, other: $float) -> $float {
                self + other
            }
            fn sub(self, other: $float) -> $float {
                self - other
            }
            fn mul(self, other: $float) -> $float {
                self * other
            }
            fn div(self, other: $float) -> Result<$float, NumericError> {
                Ok(self / other)
            }
        }

        impl Float<$float> for $float {
            fn abs(self) -> $float {
                self.abs()
            }
            fn floor(self) -> $float {
                <$float>::from_float(self.to_float().floor())
            }
            fn ceil(self) -> $float {
                <$float>::from_float(self.to_float().ceil())
            }
            fn trunc(self) -> $float {
                <$float>::from_float(self.to_float().trunc())
            }
            fn nearest(self) -> $float {
                let v = self.to_float();
                let rounded = v.round();
                let result = if (v.fract().abs() - 0.5).abs() < <$raw>::EPSILON && (rounded as i64) % 2 != 0 {
                    rounded - v.signum()
                } else {
                    rounded
                };
                <$float>::from_float(result)
            }
            fn sqrt(self) -> $float {
                <$float>::from_float(self.to_float().sqrt())
            }
            fn min(self, other: $float) -> $float {
                self.min(other)
            }
            fn max(self, other: $float) -> $float {
                self.max(other)
            }
            fn copysign(self, other: $float) -> $float {
                <$float>::from_float(self.to_float().copysign(other.to_float()))
            }
        }
    };
}

impl_float_arithmetic!(F32, f32);
impl_float_arithmetic!(F64, f64);

macro_rules! impl_wrap_into {
    ($from:ty, $to:ty) => {
        impl WrapInto<$to> for $from {
            fn wrap_into(self) -> $to {
                self as $to
            }
        }
    };
}

impl_wrap_into!(i64, i32);
impl_wrap_into!(u64, u32);

macro_rules! impl_extend_into {
    ($from:ty, $to:ty) => {
        impl ExtendInto<$to> for $from {
            fn extend_into(self) -> $to {
                self as $to
            }
        }
    };
}

impl_extend_into!(i32, i64);
impl_extend_into!(u32, i64);
impl_extend_into!(u32, u64);
impl_extend_into!(i8, i32);
impl_extend_into!(i16, i32);
impl_extend_into!(i8, i64);
impl_extend_into!(i16, i64);
impl_extend_into!(i32, i64);

macro_rules! impl_transmute_into_self {
    ($t:ty) => {
        impl TransmuteInto<$t> for $t {
            fn transmute_into(self) -> $t {
                self
            }
        }
    };
}

impl_transmute_into_self!(i32);
impl_transmute_into_self!(i64);

impl TransmuteInto<i32> for u32 {
    fn transmute_into(self) -> i32 {
        self as i32
    }
}
impl TransmuteInto<u32> for i32 {
    fn transmute_into(self) -> u32 {
        self as u32
    }
}
impl TransmuteInto<i64> for u64 {
    fn transmute_into(self) -> i64 {
        self as i64
    }
}
impl TransmuteInto<u64> for i64 {
    fn transmute_into(self) -> u64 {
        self as u64
    }
}
impl TransmuteInto<i32> for F32 {
    fn transmute_into(self) -> i32 {
        self.to_bits() as i32
    }
}
impl TransmuteInto<F32> for i32 {
    fn transmute_into(self) -> F32 {
        F32::from_bits(self as u32)
    }
}
impl TransmuteInto<i64> for F64 {
    fn transmute_into(self) -> i64 {
        self.to_bits() as i64
    }
}
impl TransmuteInto<F64> for i64 {
    fn transmute_into(self) -> F64 {
        F64::from_bits(self as u64)
    }
}

macro_rules! impl_try_truncate_into {
    ($float:ty, $int:ty, $raw:ty) => {
        impl TryTruncateInto<$int, NumericError> for $float {
            fn try_truncate_into(self) -> Result<$int, NumericError> {
                let v = self.to_float();
                if v.is_nan() || v.is_infinite() {
                    return Err(NumericError::InvalidConversion);
                }
                let truncated = v.trunc();
                if truncated < <$int>::MIN as $raw || truncated > <$int>::MAX as $raw {
                    return Err(NumericError::InvalidConversion);
                }
                Ok(truncated as $int)
            }
        }
    };
}

impl_try_truncate_into!(F32, i32, f32);
impl_try_truncate_into!(F32, i64, f32);
impl_try_truncate_into!(F64, i32, f64);
impl_try_truncate_into!(F64, i64, f64);

impl TryTruncateInto<u32, NumericError> for F32 {
    fn try_truncate_into(self) -> Result<u32, NumericError> {
        let v = self.to_float();
        if v.is_nan() || v.is_infinite() || v < 0.0 || v > u32::MAX as f32 {
            return Err(NumericError::InvalidConversion);
        }
        Ok(v.trunc() as u32)
    }
}
impl TryTruncateInto<u64, NumericError> for F32 {
    fn try_truncate_into(self) -> Result<u64, NumericError> {
        let v = self.to_float();
        if v.is_nan() || v.is_infinite() || v < 0.0 || v > u64::MAX as f32 {
            return Err(NumericError::InvalidConversion);
        }
        Ok(v.trunc() as u64)
    }
}
impl TryTruncateInto<u32, NumericError> for F64 {
    fn try_truncate_into(self) -> Result<u32, NumericError> {
        let v = self.to_float();
        if v.is_nan() || v.is_infinite() || v < 0.0 || v > u32::MAX as f64 {
            return Err(NumericError::InvalidConversion);
        }
        Ok(v.trunc() as u32)
    }
}
impl TryTruncateInto<u64, NumericError> for F64 {
    fn try_truncate_into(self) -> Result<u64, NumericError> {
        let v = self.to_float();
        if v.is_nan() || v.is_infinite() || v < 0.0 || v > u64::MAX as f64 {
            return Err(NumericError::InvalidConversion);
        }
        Ok(v.trunc() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_division_by_zero_is_an_error() {
        assert_eq!(10i32.div(0), Err(NumericError::DivisionByZero));
    }

    #[test]
    fn integer_overflow_on_min_div_neg_one() {
        assert_eq!(i32::MIN.div(-1), Err(NumericError::Overflow));
    }

    #[test]
    fn rotl_wraps_shift_amount() {
        assert_eq!(1i32.rotl(32), 1);
    }

    #[test]
    fn truncate_nan_is_invalid() {
        let nan = F32::from(f32::NAN);
        let result: Result<i32, NumericError> = nan.try_truncate_into();
        assert_eq!(result, Err(NumericError::InvalidConversion));
    }

    #[test]
    fn truncate_in_range_succeeds() {
        let v = F64::from(3.75f64);
        let result: Result<i32, NumericError> = v.try_truncate_into();
        assert_eq!(result, Ok(3));
    }
}
