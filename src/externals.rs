//! The host callback boundary: the trait an embedder implements to answer
//! calls into [`FuncInstance::Host`](crate::func::FuncInstance::Host)
//! functions.

use crate::error::Error;
use crate::value::Value;
use std::fmt;

/// Arguments passed to a host function call, with checked accessors.
pub struct RuntimeArgs<'a>(&'a [Value]);

impl<'a> RuntimeArgs<'a> {
    /// Wraps a raw argument slice.
    pub fn new(args: &'a [Value]) -> Self {
        Self(args)
    }

    /// The raw argument slice.
    pub fn as_slice(&self) -> &[Value] {
        self.0
    }

    /// The argument at `index`, or an `Error::crash` if out of range —
    /// a validated call site always passes the right arity.
    pub fn nth(&self, index: usize) -> &Value {
        self.0
            .get(index)
            .unwrap_or_else(|| crate::error::crash(format!("host argument {index} out of range")))
    }

    /// `nth(index)` as an `i32`.
    pub fn nth_i32(&self, index: usize) -> i32 {
        self.nth(index).unwrap_i32()
    }

    /// `nth(index)` as an `i64`.
    pub fn nth_i64(&self, index: usize) -> i64 {
        self.nth(index).unwrap_i64()
    }
}

/// A host-defined error, downcastable by embedders that want to recover
/// their own error type from a propagated trap.
pub trait HostError: 'static + std::error::Error + downcast_rs::Downcast {}
downcast_rs::impl_downcast!(HostError);

/// The embedder collaborator that answers calls into host functions.
///
/// Mirrors the interpreter's own `invoke` shape: given a host function
/// index and its arguments, return its results or a trap.
pub trait Externals {
    /// Invokes the host function identified by `index` with `args`.
    fn invoke_index(&mut self, index: usize, args: RuntimeArgs) -> Result<Vec<Value>, Error>;
}

/// An `Externals` that has no host functions; any call into one crashes,
/// since a module linked against `NopExternals` can never have imported
/// one.
pub struct NopExternals;

impl Externals for NopExternals {
    fn invoke_index(&mut self, index: usize, _args: RuntimeArgs) -> Result<Vec<Value>, Error> {
        crate::error::crash(format!("no host function at index {index}"))
    }
}

impl fmt::Debug for NopExternals {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NopExternals")
    }
}
