use crate::value::ValType;
use std::error;
use std::fmt;

/// A source position attached to an [`Error`].
///
/// Carried alongside trap and exhaustion errors so an embedder can point a
/// user at the administrative instruction that failed. `None` when the
/// failing step has no single originating instruction (e.g. a link error).
pub type SourcePos = Option<u32>;

/// The four-way failure taxonomy an embedder categorizes [`Error`]s by.
///
/// Four-way failure taxonomy: `Link`, `Trap`, `Exhaustion`, `Crash`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Mismatched or missing import at instantiation.
    Link,
    /// Runtime failure visible to the guest.
    Trap,
    /// Call-stack budget exceeded.
    Exhaustion,
    /// Invariant violation impossible in a validated module.
    Crash,
}

/// Error type produced by this crate.
///
/// Carries the [`ErrorKind`], a human-readable message, and (for `Trap`
/// and `Exhaustion`) the source position of the administrative instruction
/// that raised it.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Box<str>,
    at: SourcePos,
}

impl Error {
    fn new(kind: ErrorKind, message: impl Into<String>, at: SourcePos) -> Self {
        Self {
            kind,
            message: message.into().into_boxed_str(),
            at,
        }
    }

    /// A link error: mismatched or missing import.
    #[cold]
    pub fn link(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Link, message, None)
    }

    /// A guest-visible trap, raised at administrative instruction `at`.
    #[cold]
    pub fn trap(code: TrapCode, at: SourcePos) -> Self {
        Self::new(ErrorKind::Trap, code.trap_message(), at)
    }

    /// A guest-visible trap with a custom message (e.g. from a host function).
    #[cold]
    pub fn trap_msg(message: impl Into<String>, at: SourcePos) -> Self {
        Self::new(ErrorKind::Trap, message, at)
    }

    /// Call-stack budget exceeded at `at`.
    #[cold]
    pub fn exhaustion(at: SourcePos) -> Self {
        Self::new(
            ErrorKind::Exhaustion,
            TrapCode::StackOverflow.trap_message(),
            at,
        )
    }

    /// An invariant violation. Validated modules must never reach this.
    #[cold]
    pub fn crash(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Crash, message, None)
    }

    /// The failure kind, for embedders that want to categorize errors.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The administrative instruction's source position, if any.
    pub fn at(&self) -> SourcePos {
        self.at
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.at {
            Some(pos) => write!(f, "{} (at {})", self.message, pos),
            None => write!(f, "{}", self.message),
        }
    }
}

impl error::Error for Error {}

/// A link-time type mismatch, composed into an [`Error::link`] message
/// naming module, item, expected type, and actual type.
#[cold]
pub fn link_type_mismatch(
    module: &str,
    field: &str,
    expected: &str,
    actual: &str,
) -> Error {
    Error::link(format!(
        "incompatible import type for `{module}::{field}`: expected {expected}, found {actual}"
    ))
}

/// Well-known runtime failure codes, mapped to the exact messages required
/// for conformance-suite compatibility.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrapCode {
    /// `unreachable` was executed.
    Unreachable,
    /// A memory access fell outside the bounds of linear memory.
    MemoryOutOfBounds,
    /// A table access fell outside the bounds of the table.
    TableOutOfBounds,
    /// `call_indirect` read an uninitialized (null) table slot.
    UninitializedElement(u32),
    /// Integer division or remainder by zero.
    DivisionByZero,
    /// Signed division overflowed (`MIN / -1`).
    IntegerOverflow,
    /// A float-to-int conversion saw NaN, infinity, or an out-of-range value.
    InvalidConversionToInt,
    /// The thread's call-stack budget was exhausted.
    StackOverflow,
    /// `call_indirect` found a callee whose signature does not match.
    IndirectCallTypeMismatch,
    /// An atomic access was not aligned to its access size.
    UnalignedAtomicAccess,
    /// `memory.atomic.wait` targeted memory that is not shared.
    ExpectedSharedMemory,
    /// A table/element access named an undefined element index.
    UndefinedElement(u32),
}

impl TrapCode {
    /// The exact trap message required for conformance-suite compatibility.
    pub fn trap_message(&self) -> String {
        match self {
            Self::Unreachable => "unreachable executed".to_string(),
            Self::MemoryOutOfBounds => "out of bounds memory access".to_string(),
            Self::TableOutOfBounds => "out of bounds table access".to_string(),
            Self::UninitializedElement(i) => format_args!("uninitialized element {i}").to_string(),
            Self::DivisionByZero => "integer divide by zero".to_string(),
            Self::IntegerOverflow => "integer overflow".to_string(),
            Self::InvalidConversionToInt => "invalid conversion to integer".to_string(),
            Self::StackOverflow => "call stack exhausted".to_string(),
            Self::IndirectCallTypeMismatch => "indirect call type mismatch".to_string(),
            Self::UnalignedAtomicAccess => "unaligned atomic memory access".to_string(),
            Self::ExpectedSharedMemory => "expected shared memory".to_string(),
            Self::UndefinedElement(i) => format_args!("undefined element {i}").to_string(),
        }
    }
}

/// Failure of a type-directed value conversion, used internally by the
/// pure numeric/SIMD evaluators before being lifted into a [`TrapCode`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NumericError {
    /// Division or remainder by zero.
    DivisionByZero,
    /// Signed division overflowed (`MIN / -1`).
    Overflow,
    /// Out-of-range float-to-int conversion (NaN, infinity, or magnitude).
    InvalidConversion,
}

impl From<NumericError> for TrapCode {
    fn from(error: NumericError) -> Self {
        match error {
            NumericError::DivisionByZero => TrapCode::DivisionByZero,
            NumericError::Overflow => TrapCode::IntegerOverflow,
            NumericError::InvalidConversion => TrapCode::InvalidConversionToInt,
        }
    }
}

/// Asserts an invariant that validated modules can never violate.
///
/// Thin wrapper so crash sites read uniformly; panics in all configurations
/// (there is no recovering from a broken invariant).
#[cold]
pub fn crash(message: impl Into<String>) -> ! {
    panic!("wasmi-threads invariant violation (crash): {}", message.into());
}

/// Describes a type mismatch used by [`crash`] call sites that want to name
/// the offending [`ValType`]s.
pub fn type_mismatch_message(expected: ValType, actual: ValType) -> String {
    format!("type mismatch: expected {expected:?}, found {actual:?}")
}
