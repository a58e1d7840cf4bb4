//! Runtime representation of values and the numeric operations on them.
//!
//! Wasm code manipulates values of the four basic value types: integers and
//! floating-point (IEEE 754-2008) data of 32 or 64 bit width. There is no
//! distinction between signed and unsigned integer types; operations
//! interpret the bits as one or the other in two's complement.

use crate::types::ValueType;
use crate::TrapCode;
use core::fmt;
use num_traits::cast::ToPrimitive;

/// Typed value crossing the embedder boundary: arguments pushed by the host
/// and results read back after a run.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    /// Default (zero) value of the given type.
    pub fn default(value_type: ValueType) -> Value {
        match value_type {
            ValueType::I32 => Value::I32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{:#x}:i32", *v as u32),
            Value::I64(v) => write!(f, "{:#x}:i64", *v as u64),
            Value::F32(v) => write!(f, "{:.7}:f32", v),
            Value::F64(v) => write!(f, "{:.7}:f64", v),
        }
    }
}

/// Raw 64-bit operand-stack cell.
///
/// The cell carries no runtime type tag; the type is always known statically
/// from the bytecode. Values narrower than 64 bits are stored zero-extended,
/// floats as their IEEE bit patterns, so any well-typed sequence of pushes
/// and pops round-trips exactly.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct ValueCell(pub u64);

impl ValueCell {
    /// View the cell through a statically known type.
    pub fn with_type(self, ty: ValueType) -> Value {
        match ty {
            ValueType::I32 => Value::I32(self.0 as u32 as i32),
            ValueType::I64 => Value::I64(self.0 as i64),
            ValueType::F32 => Value::F32(f32::from_bits(self.0 as u32)),
            ValueType::F64 => Value::F64(f64::from_bits(self.0)),
        }
    }
}

macro_rules! impl_cell_int {
    ($($t:ty as $via:ty),*) => {
        $(
            impl From<$t> for ValueCell {
                fn from(v: $t) -> ValueCell {
                    ValueCell(v as $via as u64)
                }
            }

            impl From<ValueCell> for $t {
                fn from(cell: ValueCell) -> $t {
                    cell.0 as $t
                }
            }
        )*
    };
}

impl_cell_int!(i8 as u8, u8 as u8, i16 as u16, u16 as u16, i32 as u32, u32 as u32, i64 as u64, u64 as u64);

impl From<f32> for ValueCell {
    fn from(v: f32) -> ValueCell {
        ValueCell(u64::from(v.to_bits()))
    }
}

impl From<ValueCell> for f32 {
    fn from(cell: ValueCell) -> f32 {
        f32::from_bits(cell.0 as u32)
    }
}

impl From<f64> for ValueCell {
    fn from(v: f64) -> ValueCell {
        ValueCell(v.to_bits())
    }
}

impl From<ValueCell> for f64 {
    fn from(cell: ValueCell) -> f64 {
        f64::from_bits(cell.0)
    }
}

impl From<bool> for ValueCell {
    fn from(v: bool) -> ValueCell {
        ValueCell(u64::from(v))
    }
}

impl From<Value> for ValueCell {
    fn from(v: Value) -> ValueCell {
        match v {
            Value::I32(v) => v.into(),
            Value::I64(v) => v.into(),
            Value::F32(v) => v.into(),
            Value::F64(v) => v.into(),
        }
    }
}

/// Arithmetic shared by the integer and float types.
pub trait ArithmeticOps<T>: Sized {
    fn add(self, other: T) -> T;
    fn sub(self, other: T) -> T;
    fn mul(self, other: T) -> T;
    fn div(self, other: T) -> Result<T, TrapCode>;
}

/// Integer-only operations.
pub trait Integer<T>: ArithmeticOps<T> {
    fn leading_zeros(self) -> T;
    fn trailing_zeros(self) -> T;
    fn count_ones(self) -> T;
    fn rotl(self, other: T) -> T;
    fn rotr(self, other: T) -> T;
    fn rem(self, other: T) -> Result<T, TrapCode>;
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

/// Checked float-to-integer truncation, rounding towards zero.
///
/// NaN is an invalid conversion; a finite or infinite value whose truncation
/// does not fit the target range is an integer overflow. The two cases carry
/// distinct trap codes.
pub trait TryTruncateInto<T> {
    fn try_truncate_into(self) -> Result<T, TrapCode>;
}

macro_rules! impl_integer_arithmetic_ops {
    ($type:ty) => {
        impl ArithmeticOps<$type> for $type {
            fn add(self, other: $type) -> $type {
                self.wrapping_add(other)
            }
            fn sub(self, other: $type) -> $type {
                self.wrapping_sub(other)
            }
            fn mul(self, other: $type) -> $type {
                self.wrapping_mul(other)
            }
            fn div(self, other: $type) -> Result<$type, TrapCode> {
                if other == 0 {
                    return Err(TrapCode::DivisionByZero);
                }
                let (result, overflow) = self.overflowing_div(other);
                if overflow {
                    Err(TrapCode::IntegerOverflow)
                } else {
                    Ok(result)
                }
            }
        }
    };
}

impl_integer_arithmetic_ops!(i32);
impl_integer_arithmetic_ops!(u32);
impl_integer_arithmetic_ops!(i64);
impl_integer_arithmetic_ops!(u64);

macro_rules! impl_integer {
    ($type:ty) => {
        impl Integer<$type> for $type {
            fn leading_zeros(self) -> $type {
                self.leading_zeros() as $type
            }
            fn trailing_zeros(self) -> $type {
                self.trailing_zeros() as $type
            }
            fn count_ones(self) -> $type {
                self.count_ones() as $type
            }
            fn rotl(self, other: $type) -> $type {
                self.rotate_left(other as u32)
            }
            fn rotr(self, other: $type) -> $type {
                self.rotate_right(other as u32)
            }
            fn rem(self, other: $type) -> Result<$type, TrapCode> {
                if other == 0 {
                    return Err(TrapCode::DivisionByZero);
                }
                // MIN % -1 wraps to 0 rather than trapping.
                Ok(self.wrapping_rem(other))
            }
        }
    };
}

impl_integer!(i32);
impl_integer!(u32);
impl_integer!(i64);
impl_integer!(u64);

macro_rules! impl_float_arithmetic_ops {
    ($type:ty) => {
        impl ArithmeticOps<$type> for $type {
            fn add(self, other: $type) -> $type {
                self + other
            }
            fn sub(self, other: $type) -> $type {
                self - other
            }
            fn mul(self, other: $type) -> $type {
                self * other
            }
            fn div(self, other: $type) -> Result<$type, TrapCode> {
                Ok(self / other)
            }
        }
    };
}

impl_float_arithmetic_ops!(f32);
impl_float_arithmetic_ops!(f64);

macro_rules! impl_float {
    ($type:ident, $int:ident) => {
        // Direct float comparisons are intended here.
        #[allow(clippy::float_cmp)]
        impl Float<$type> for $type {
            fn abs(self) -> $type {
                $type::abs(self)
            }
            fn floor(self) -> $type {
                $type::floor(self)
            }
            fn ceil(self) -> $type {
                $type::ceil(self)
            }
            fn trunc(self) -> $type {
                $type::trunc(self)
            }
            fn nearest(self) -> $type {
                let round = self.round();
                if self.fract().abs() != 0.5 {
                    return round;
                }
                // Ties round to even.
                if round % 2.0 == 1.0 {
                    self.floor()
                } else if round % 2.0 == -1.0 {
                    self.ceil()
                } else {
                    round
                }
            }
            fn sqrt(self) -> $type {
                $type::sqrt(self)
            }
            // minNaN semantics: any NaN operand wins.
            fn min(self, other: $type) -> $type {
                if self.is_nan() {
                    return self;
                }
                if other.is_nan() {
                    return other;
                }
                $type::min(self, other)
            }
            fn max(self, other: $type) -> $type {
                if self.is_nan() {
                    return self;
                }
                if other.is_nan() {
                    return other;
                }
                $type::max(self, other)
            }
            fn copysign(self, other: $type) -> $type {
                const SIGN_MASK: $int = 1 << (<$int>::BITS - 1);
                let self_bits = self.to_bits() as $int;
                let other_bits = other.to_bits() as $int;
                if (self_bits ^ other_bits) & SIGN_MASK == 0 {
                    self
                } else {
                    <$type>::from_bits((self_bits ^ SIGN_MASK) as _)
                }
            }
        }
    };
}

impl_float!(f32, u32);
impl_float!(f64, u64);

macro_rules! impl_try_truncate_into {
    ($from:ty, $into:ty, $to_primitive:path) => {
        impl TryTruncateInto<$into> for $from {
            fn try_truncate_into(self) -> Result<$into, TrapCode> {
                if self.is_nan() {
                    return Err(TrapCode::InvalidConversionToInt);
                }
                // Rounds towards zero; out of range (infinities included)
                // comes back as None.
                $to_primitive(&self.trunc()).ok_or(TrapCode::IntegerOverflow)
            }
        }
    };
}

impl_try_truncate_into!(f32, i32, ToPrimitive::to_i32);
impl_try_truncate_into!(f32, u32, ToPrimitive::to_u32);
impl_try_truncate_into!(f32, i64, ToPrimitive::to_i64);
impl_try_truncate_into!(f32, u64, ToPrimitive::to_u64);
impl_try_truncate_into!(f64, i32, ToPrimitive::to_i32);
impl_try_truncate_into!(f64, u32, ToPrimitive::to_u32);
impl_try_truncate_into!(f64, i64, ToPrimitive::to_i64);
impl_try_truncate_into!(f64, u64, ToPrimitive::to_u64);

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn cells_round_trip_narrow_integers() {
        let cell = ValueCell::from(-1i32);
        assert_eq!(cell.0, 0xffff_ffff);
        assert_eq!(i32::from(cell), -1);
        assert_eq!(cell.with_type(ValueType::I32), Value::I32(-1));
    }

    #[test]
    fn cells_round_trip_float_bits() {
        let nan = f32::from_bits(0x7fc0_1234);
        let cell = ValueCell::from(nan);
        assert_eq!(f32::from(cell).to_bits(), 0x7fc0_1234);
    }

    #[test]
    fn signed_division_overflow_traps() {
        assert_matches!(i32::MIN.div(-1), Err(TrapCode::IntegerOverflow));
        assert_matches!(i64::MIN.div(-1), Err(TrapCode::IntegerOverflow));
        assert_matches!(5i32.div(0), Err(TrapCode::DivisionByZero));
        assert_matches!(5u64.div(0), Err(TrapCode::DivisionByZero));
    }

    #[test]
    fn remainder_of_min_by_minus_one_is_zero() {
        assert_eq!(i32::MIN.rem(-1), Ok(0));
        assert_eq!(i64::MIN.rem(-1), Ok(0));
        assert_matches!(1i32.rem(0), Err(TrapCode::DivisionByZero));
    }

    #[test]
    fn rotations_invert() {
        for k in [0u32, 1, 7, 31, 33] {
            let x = 0x8000_0001u32;
            assert_eq!(Integer::rotl(Integer::rotr(x, k), k), x);
        }
        for k in [0u64, 1, 17, 63, 65] {
            let x = 0x8000_0000_0000_0001u64;
            assert_eq!(Integer::rotl(Integer::rotr(x, k), k), x);
        }
    }

    #[test]
    fn truncation_distinguishes_nan_and_overflow() {
        assert_matches!(
            TryTruncateInto::<i32>::try_truncate_into(f32::NAN),
            Err(TrapCode::InvalidConversionToInt)
        );
        assert_matches!(
            TryTruncateInto::<i32>::try_truncate_into(f32::INFINITY),
            Err(TrapCode::IntegerOverflow)
        );
        assert_matches!(
            TryTruncateInto::<i32>::try_truncate_into(f64::NEG_INFINITY),
            Err(TrapCode::IntegerOverflow)
        );
        assert_matches!(
            TryTruncateInto::<i32>::try_truncate_into(2147483648.0f64),
            Err(TrapCode::IntegerOverflow)
        );
        assert_eq!(TryTruncateInto::<i32>::try_truncate_into(-2147483648.0f64), Ok(i32::MIN));
        assert_eq!(TryTruncateInto::<u32>::try_truncate_into(-0.75f64), Ok(0));
        assert_matches!(
            TryTruncateInto::<u32>::try_truncate_into(-1.0f64),
            Err(TrapCode::IntegerOverflow)
        );
    }

    #[test]
    fn nearest_rounds_ties_to_even() {
        assert_eq!(Float::nearest(2.5f64), 2.0);
        assert_eq!(Float::nearest(3.5f64), 4.0);
        assert_eq!(Float::nearest(-2.5f64), -2.0);
        assert_eq!(Float::nearest(0.6f64), 1.0);
    }

    #[test]
    fn copysign_flips_only_the_sign_bit() {
        assert_eq!(Float::copysign(1.5f32, -0.0f32), -1.5);
        assert_eq!(Float::copysign(-1.5f64, 2.0f64), 1.5);
        let nan = f64::from_bits(0x7ff8_0000_0000_0001);
        assert!(Float::copysign(nan, -1.0).is_sign_negative());
    }
}
