//! The tagged value type manipulated by the administrative code machine,
//! plus the value- and reference-type tags used to describe it.

use crate::func::FuncRef;
use crate::nan_preserving_float::{F32, F64};
use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// The value type of a [`Value`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit IEEE-754 float.
    F32,
    /// 64-bit IEEE-754 float.
    F64,
    /// 128-bit vector.
    V128,
    /// A reference of the given [`RefType`].
    Ref(RefType),
}

/// The two reference type families defined by the reference-types proposal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RefType {
    /// A nullable reference to a function.
    FuncRef,
    /// A nullable opaque reference supplied by the host.
    ExternRef,
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::I32 => write!(f, "i32"),
            Self::I64 => write!(f, "i64"),
            Self::F32 => write!(f, "f32"),
            Self::F64 => write!(f, "f64"),
            Self::V128 => write!(f, "v128"),
            Self::Ref(RefType::FuncRef) => write!(f, "funcref"),
            Self::Ref(RefType::ExternRef) => write!(f, "externref"),
        }
    }
}

/// The signature of a function: ordered parameter and result value types.
///
/// Two signatures are equal exactly when their parameter and result lists
/// are equal; this is the equality `call_indirect` uses to detect a
/// signature mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    params: Rc<[ValType]>,
    results: Rc<[ValType]>,
}

impl FuncType {
    /// Creates a new function type from parameter and result value types.
    pub fn new(params: impl Into<Vec<ValType>>, results: impl Into<Vec<ValType>>) -> Self {
        Self {
            params: params.into().into(),
            results: results.into().into(),
        }
    }

    /// The parameter types, in call order.
    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    /// The result types, in return order.
    pub fn results(&self) -> &[ValType] {
        &self.results
    }
}

/// An opaque, host-supplied reference carried by a [`Ref::Extern`] value.
///
/// Wraps an `Rc<dyn Any>` rather than `Arc` because the scheduler is
/// single-threaded cooperative: only one thread is ever stepping at a time,
/// so there is no need to pay for atomic refcounting.
#[derive(Clone)]
pub struct ExternRef {
    inner: Rc<dyn Any>,
}

impl ExternRef {
    /// Wraps `value` as a new opaque reference.
    pub fn new<T: 'static + Any>(value: T) -> Self {
        Self {
            inner: Rc::new(value),
        }
    }

    /// Returns the underlying data for downcasting by the host.
    pub fn data(&self) -> &dyn Any {
        &*self.inner
    }

    /// `true` if both references point at the same underlying value.
    pub fn ptr_eq(&self, other: &ExternRef) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ExternRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ExternRef(..)")
    }
}

/// A reference value: null-of-type, a function reference, or an extern
/// reference. Equality on references is by identity, not structure.
#[derive(Debug, Clone)]
pub enum Ref {
    /// The null reference of the given type.
    Null(RefType),
    /// A reference to a function instance.
    Func(FuncRef),
    /// An opaque host reference.
    Extern(ExternRef),
}

impl Ref {
    /// The [`RefType`] of this reference.
    pub fn ty(&self) -> RefType {
        match self {
            Self::Null(ty) => *ty,
            Self::Func(_) => RefType::FuncRef,
            Self::Extern(_) => RefType::ExternRef,
        }
    }

    /// `true` if this is the null reference.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }
}

/// A 128-bit SIMD vector value, addressable as 16/8/4/2 lanes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct V128(u128);

impl V128 {
    /// Builds a [`V128`] from its raw little-endian bit pattern.
    pub fn from_bits(bits: u128) -> Self {
        Self(bits)
    }

    /// Returns the raw little-endian bit pattern.
    pub fn to_bits(self) -> u128 {
        self.0
    }

    /// Returns the 16 little-endian bytes making up this vector.
    pub fn bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    /// Rebuilds a [`V128`] from 16 little-endian bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }
}

/// Runtime representation of a Wasm value.
///
/// Wasm code manipulates values of the five basic value types: 32- and
/// 64-bit integers, 32- and 64-bit IEEE-754 floats, and 128-bit vectors,
/// plus nullable references. There is no distinction between signed and
/// unsigned integers at this layer; operators interpret the bit pattern
/// as whichever signedness they need.
#[derive(Debug, Clone)]
pub enum Value {
    /// 32-bit integer.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(F32),
    /// 64-bit float.
    F64(F64),
    /// 128-bit vector.
    V128(V128),
    /// A reference value.
    Ref(Ref),
}

impl Value {
    /// The default (zero/null) value of the given type.
    pub fn default(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(0f32.into()),
            ValType::F64 => Value::F64(0f64.into()),
            ValType::V128 => Value::V128(V128::default()),
            ValType::Ref(rt) => Value::Ref(Ref::Null(rt)),
        }
    }

    /// This value's [`ValType`].
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::V128(_) => ValType::V128,
            Value::Ref(r) => ValType::Ref(r.ty()),
        }
    }

    /// Structural equality for numerics/vectors, identity equality for
    /// references (per the data-model definition of value equality).
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::V128(a), Value::V128(b)) => a == b,
            (Value::Ref(Ref::Null(a)), Value::Ref(Ref::Null(b))) => a == b,
            (Value::Ref(Ref::Func(a)), Value::Ref(Ref::Func(b))) => Rc::ptr_eq(a.rc(), b.rc()),
            (Value::Ref(Ref::Extern(a)), Value::Ref(Ref::Extern(b))) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Reads this value as an `i32`, crashing on type mismatch.
    pub fn unwrap_i32(&self) -> i32 {
        match self {
            Value::I32(v) => *v,
            other => crate::error::crash(format!("expected i32, found {}", other.ty())),
        }
    }

    /// Reads this value as an `i64`, crashing on type mismatch.
    pub fn unwrap_i64(&self) -> i64 {
        match self {
            Value::I64(v) => *v,
            other => crate::error::crash(format!("expected i64, found {}", other.ty())),
        }
    }

    /// Reads this value as a reference, crashing on type mismatch.
    pub fn unwrap_ref(&self) -> &Ref {
        match self {
            Value::Ref(r) => r,
            other => crate::error::crash(format!("expected reference, found {}", other.ty())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{}", f32::from(*v)),
            Value::F64(v) => write!(f, "{}", f64::from(*v)),
            Value::V128(v) => write!(f, "{:#034x}", v.to_bits()),
            Value::Ref(Ref::Null(_)) => write!(f, "null"),
            Value::Ref(Ref::Func(_)) => write!(f, "funcref"),
            Value::Ref(Ref::Extern(_)) => write!(f, "externref"),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::I32(v as i32)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::I64(v as i64)
    }
}
impl From<F32> for Value {
    fn from(v: F32) -> Self {
        Value::F32(v)
    }
}
impl From<F64> for Value {
    fn from(v: F64) -> Self {
        Value::F64(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::I32(v as i32)
    }
}
