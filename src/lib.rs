//! # wasmtick
//!
//! A standalone WebAssembly 1.0 interpreter built for embedding untrusted
//! guest programs with bounded resource use.
//!
//! A module binary is decoded once into an immutable [`Module`]; each run
//! gets a fresh [`Instance`] holding the operand stack, block/call stack,
//! globals and linear memory. Execution is cooperative and *gas-metered*:
//! [`Module::tick`] runs opcodes until the call completes, a trap occurs,
//! or the per-tick gas budget is exhausted, in which case it returns
//! [`TickOutcome::NeedMoreGas`] and the host decides whether to resume.
//!
//! Host functions are registered by name in an [`Imports`] table before
//! decoding; [`env::register_host_functions`] provides the WASI and
//! emscripten shim a typical C/C++ guest expects.
//!
//! Traps are never thrown. Every failure is a distinct numeric code
//! ([`TrapCode`]) carried by [`Trap`], with a human-readable message left
//! in the instance's exception buffer.
//!
//! ```
//! use wasmtick::{Imports, Instance, Module, TickOutcome, Value, ValueType};
//!
//! let wasm = wat::parse_str(
//!     r#"
//!     (module
//!         (func (export "add") (param i32 i32) (result i32)
//!             local.get 0
//!             local.get 1
//!             i32.add))
//!     "#,
//! )
//! .unwrap();
//!
//! let mut inst = Instance::new();
//! let module = Module::load(&wasm, &Imports::new(), &mut inst).unwrap();
//! module.instantiate(&mut inst).unwrap();
//!
//! let add = module.export("add").unwrap();
//! inst.push_value(Value::I32(2));
//! inst.push_value(Value::I32(40));
//! let mut outcome = module.call_exported(&mut inst, add).unwrap();
//! while outcome == TickOutcome::NeedMoreGas {
//!     outcome = module.tick(&mut inst).unwrap();
//! }
//! assert_eq!(inst.pop_value(ValueType::I32), Value::I32(42));
//! ```

#![allow(clippy::len_without_is_empty)]

use core::fmt;

mod func;
mod host;
mod instance;
mod isa;
mod leb;
mod memory;
mod module;
mod runner;
mod types;
mod value;

pub mod env;

pub use crate::host::{Imports, MAX_NAME_LEN};
pub use crate::instance::{Instance, DEFAULT_GAS_PER_TICK, STACK_SIZE};
pub use crate::memory::{
    ByteBuf, LinearMemory, SplitBuf, ARGUMENTS_BASE, LINEAR_MEMORY_PAGE_SIZE, MAX_PAGES,
};
pub use crate::module::Module;
pub use crate::runner::TickOutcome;
pub use crate::types::{ExternalKind, FuncType, ValueType, MAX_PARAMS, MAX_RESULTS};
pub use crate::value::{ArithmeticOps, Float, Integer, TryTruncateInto, Value, ValueCell};

/// Distinct numeric failure codes.
///
/// Zero and one are reserved for the two non-error control statuses (*ok*
/// and *need-more-gas*, see [`TickOutcome`]); every code here is terminal
/// for the call that returned it. The numeric value is stable API used by
/// the command-line front-end's exit status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum TrapCode {
    // Format errors found while decoding.
    BadMagic = 2,
    UnsupportedVersion = 3,
    MisalignedSection = 4,
    UnknownSection = 5,
    TruncatedModule = 6,
    TooManyEntries = 7,
    NameTooLong = 8,
    DuplicateSection = 9,
    MissingEndOpcode = 10,
    TooManyParameters = 11,
    TooManyResults = 12,
    UnsupportedValueType = 13,
    UnsupportedImportKind = 14,
    UnsupportedExportKind = 15,
    ImportNotFound = 16,
    OnlyOneTableAllowed = 17,
    OnlyOneMemoryAllowed = 18,
    UnsupportedTableType = 19,
    InvalidMemoryLimits = 20,
    TooMuchMemoryRequested = 21,

    // Features outside the supported subset, rejected explicitly.
    VectorsNotSupported = 22,
    SaturatingTruncationNotSupported = 23,
    ParametricNotSupported = 24,
    TableInstructionsNotSupported = 25,

    // Numeric traps.
    DivisionByZero = 26,
    IntegerOverflow = 27,
    InvalidConversionToInt = 28,

    // Memory traps.
    MemoryOutOfRange = 29,
    MemoryQuotaExceeded = 30,

    // Control-flow traps.
    UnreachableExecuted = 31,
    StackOverflow = 32,
    BlockStackUnderflow = 33,
    PcOutOfRange = 34,
    BranchOutOfRange = 35,
    LabelOutOfRange = 36,
    MissingEnd = 37,
    ElseWithoutIf = 38,
    MissingResults = 39,
    NoResultOnStack = 40,
    UnexpectedReturn = 41,
    UnknownBlockType = 42,
    UnknownOpcode = 43,
    GlobalIndexOutOfRange = 44,

    // Call errors.
    FuncIndexOutOfRange = 45,
    TableIndexOutOfRange = 46,
    IndirectCallTypeMismatch = 47,
    IndirectCallInsufficientParams = 48,
    InsufficientParameters = 49,
    CannotCallImportedHere = 50,
    StartFunctionImported = 51,
    HostFunctionError = 52,
    HostStackMismatch = 53,
    PendingException = 54,

    // Host-side errors.
    FileNotFound = 55,
    FunctionNotFound = 56,
    ArgumentsTooLarge = 57,
}

impl TrapCode {
    /// The stable numeric value of this code.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            TrapCode::BadMagic => "not a wasm module",
            TrapCode::UnsupportedVersion => "unsupported wasm version",
            TrapCode::MisalignedSection => "misaligned section",
            TrapCode::UnknownSection => "unknown section",
            TrapCode::TruncatedModule => "truncated module",
            TrapCode::TooManyEntries => "too many entries",
            TrapCode::NameTooLong => "name too long",
            TrapCode::DuplicateSection => "duplicate section",
            TrapCode::MissingEndOpcode => "missing end opcode",
            TrapCode::TooManyParameters => "too many parameters",
            TrapCode::TooManyResults => "too many results",
            TrapCode::UnsupportedValueType => "unsupported value type",
            TrapCode::UnsupportedImportKind => "unsupported import kind",
            TrapCode::UnsupportedExportKind => "unsupported export kind",
            TrapCode::ImportNotFound => "import not found",
            TrapCode::OnlyOneTableAllowed => "only one table is supported",
            TrapCode::OnlyOneMemoryAllowed => "only one memory is supported",
            TrapCode::UnsupportedTableType => "unsupported table type",
            TrapCode::InvalidMemoryLimits => "invalid memory limits",
            TrapCode::TooMuchMemoryRequested => "too much memory requested",
            TrapCode::VectorsNotSupported => "vector instructions not supported",
            TrapCode::SaturatingTruncationNotSupported => {
                "saturating truncation not supported"
            }
            TrapCode::ParametricNotSupported => "parametric instruction not supported",
            TrapCode::TableInstructionsNotSupported => "table instructions not supported",
            TrapCode::DivisionByZero => "divide by zero",
            TrapCode::IntegerOverflow => "integer overflow",
            TrapCode::InvalidConversionToInt => "invalid conversion to integer",
            TrapCode::MemoryOutOfRange => "memory out of range",
            TrapCode::MemoryQuotaExceeded => "memory quota exceeded",
            TrapCode::UnreachableExecuted => "unreachable executed",
            TrapCode::StackOverflow => "stack overflow",
            TrapCode::BlockStackUnderflow => "block stack underflow",
            TrapCode::PcOutOfRange => "program counter out of range",
            TrapCode::BranchOutOfRange => "branch target out of range",
            TrapCode::LabelOutOfRange => "label out of range",
            TrapCode::MissingEnd => "missing end",
            TrapCode::ElseWithoutIf => "else without if",
            TrapCode::MissingResults => "missing return values",
            TrapCode::NoResultOnStack => "no result on stack",
            TrapCode::UnexpectedReturn => "unexpected return",
            TrapCode::UnknownBlockType => "unknown block type",
            TrapCode::UnknownOpcode => "unknown opcode",
            TrapCode::GlobalIndexOutOfRange => "global index out of range",
            TrapCode::FuncIndexOutOfRange => "function index out of range",
            TrapCode::TableIndexOutOfRange => "table index out of range",
            TrapCode::IndirectCallTypeMismatch => "indirect call type mismatch",
            TrapCode::IndirectCallInsufficientParams => {
                "indirect call with insufficient parameters"
            }
            TrapCode::InsufficientParameters => "insufficient parameters",
            TrapCode::CannotCallImportedHere => "cannot call imported function here",
            TrapCode::StartFunctionImported => "imported function as start",
            TrapCode::HostFunctionError => "host function reported exception",
            TrapCode::HostStackMismatch => "host call left the stack inconsistent",
            TrapCode::PendingException => "pending exception",
            TrapCode::FileNotFound => "file not found",
            TrapCode::FunctionNotFound => "function not found",
            TrapCode::ArgumentsTooLarge => "arguments too large",
        };
        f.write_str(msg)
    }
}

/// A runtime or decode failure.
///
/// The instance that produced a trap holds a descriptive message in its
/// exception buffer and is only good for inspection and teardown.
#[derive(Debug)]
pub struct Trap {
    kind: TrapCode,
}

impl Trap {
    pub fn new(kind: TrapCode) -> Trap {
        Trap { kind }
    }

    /// Which distinct failure this is.
    pub fn kind(&self) -> TrapCode {
        self.kind
    }

    /// The stable numeric value, for exit statuses and logs.
    pub fn code(&self) -> i32 {
        self.kind.code()
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "trap {}: {}", self.kind.code(), self.kind)
    }
}

impl std::error::Error for Trap {}

impl From<TrapCode> for Trap {
    fn from(kind: TrapCode) -> Trap {
        Trap::new(kind)
    }
}
