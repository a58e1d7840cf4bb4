//! Value types, function types and the compressed block-type encoding.

use core::fmt;
use std::borrow::Cow;

/// Single-byte type codes from the binary format, chosen so that, read as
/// signed LEB128, each is a distinct small negative number.
pub mod type_code {
    pub const EMPTY: u8 = 0x40;
    pub const FUNC: u8 = 0x60;
    pub const EXTERNREF: u8 = 0x6f;
    pub const FUNCREF: u8 = 0x70;
    pub const VECTOR: u8 = 0x7b;
    pub const F64: u8 = 0x7c;
    pub const F32: u8 = 0x7d;
    pub const I64: u8 = 0x7e;
    pub const I32: u8 = 0x7f;
}

/// Type of a value a guest can keep on the operand stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl ValueType {
    pub fn from_code(code: u8) -> Option<ValueType> {
        match code {
            type_code::I32 => Some(ValueType::I32),
            type_code::I64 => Some(ValueType::I64),
            type_code::F32 => Some(ValueType::F32),
            type_code::F64 => Some(ValueType::F64),
            _ => None,
        }
    }

    /// Block-type index for a block yielding exactly this type, mirroring
    /// the signed LEB128 reading of the raw type code.
    pub(crate) fn block_type_index(self) -> i64 {
        match self {
            ValueType::I32 => -1,
            ValueType::I64 => -2,
            ValueType::F32 => -3,
            ValueType::F64 => -4,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValueType::I32 => write!(f, "i32"),
            ValueType::I64 => write!(f, "i64"),
            ValueType::F32 => write!(f, "f32"),
            ValueType::F64 => write!(f, "f64"),
        }
    }
}

/// Hard limit on function parameters.
pub const MAX_PARAMS: usize = 32;
/// Hard limit on function results.
pub const MAX_RESULTS: usize = 8;

/// Signature of a function: parameter types and result types.
///
/// Inline block signatures borrow static slices; signatures decoded from the
/// type section own their vectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    params: Cow<'static, [ValueType]>,
    results: Cow<'static, [ValueType]>,
}

impl FuncType {
    pub fn new<P, R>(params: P, results: R) -> FuncType
    where
        P: Into<Cow<'static, [ValueType]>>,
        R: Into<Cow<'static, [ValueType]>>,
    {
        FuncType {
            params: params.into(),
            results: results.into(),
        }
    }

    pub fn params(&self) -> &[ValueType] {
        self.params.as_ref()
    }

    pub fn results(&self) -> &[ValueType] {
        self.results.as_ref()
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(param")?;
        if self.params.is_empty() {
            write!(f, " void")?;
        }
        for p in self.params() {
            write!(f, " {}", p)?;
        }
        write!(f, ") (result")?;
        if self.results.is_empty() {
            write!(f, " void")?;
        }
        for r in self.results() {
            write!(f, " {}", r)?;
        }
        write!(f, ")")
    }
}

static BLOCK_EMPTY: FuncType = FuncType {
    params: Cow::Borrowed(&[]),
    results: Cow::Borrowed(&[]),
};
static BLOCK_I32: FuncType = FuncType {
    params: Cow::Borrowed(&[]),
    results: Cow::Borrowed(&[ValueType::I32]),
};
static BLOCK_I64: FuncType = FuncType {
    params: Cow::Borrowed(&[]),
    results: Cow::Borrowed(&[ValueType::I64]),
};
static BLOCK_F32: FuncType = FuncType {
    params: Cow::Borrowed(&[]),
    results: Cow::Borrowed(&[ValueType::F32]),
};
static BLOCK_F64: FuncType = FuncType {
    params: Cow::Borrowed(&[]),
    results: Cow::Borrowed(&[ValueType::F64]),
};

/// Signature for a negative block-type index: `-64` is the empty type, the
/// value-type codes come out of the signed LEB read as `-1`..`-4`.
/// Non-negative indices refer to the module's type section instead.
pub(crate) fn inline_block_type(index: i64) -> Option<&'static FuncType> {
    match index {
        -64 => Some(&BLOCK_EMPTY),
        -1 => Some(&BLOCK_I32),
        -2 => Some(&BLOCK_I64),
        -3 => Some(&BLOCK_F32),
        -4 => Some(&BLOCK_F64),
        _ => None,
    }
}

/// Kind code used by the import and export sections.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExternalKind {
    Func,
    Table,
    Memory,
    Global,
}

impl ExternalKind {
    pub fn from_code(code: u8) -> Option<ExternalKind> {
        match code {
            0x00 => Some(ExternalKind::Func),
            0x01 => Some(ExternalKind::Table),
            0x02 => Some(ExternalKind::Memory),
            0x03 => Some(ExternalKind::Global),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_block_types_match_leb_reading() {
        assert_eq!(inline_block_type(-64).unwrap().results(), &[]);
        assert_eq!(
            inline_block_type(ValueType::I32.block_type_index())
                .unwrap()
                .results(),
            &[ValueType::I32]
        );
        assert!(inline_block_type(-5).is_none());
        assert!(inline_block_type(0).is_none());
    }

    #[test]
    fn func_type_formatting() {
        let ty = FuncType::new(vec![ValueType::I32, ValueType::I64], vec![ValueType::I32]);
        assert_eq!(ty.to_string(), "(param i32 i64) (result i32)");
        assert_eq!(FuncType::new(vec![], vec![]).to_string(), "(param void) (result void)");
    }
}
