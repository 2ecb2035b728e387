//! Function instances: the callable values stored in a store and referenced
//! by table elements, `call`, and `call_indirect`.

use crate::instr::Instr;
use crate::module::ModuleInstance;
use crate::value::{FuncType, ValType};
use std::fmt;
use std::rc::{Rc, Weak};

/// A locally defined function body: its declared local slots (beyond its
/// parameters) and its plain instruction sequence.
#[derive(Debug)]
pub struct FuncBody {
    /// Additional local variable types, in declaration order, following
    /// the function's parameters.
    pub locals: Vec<ValType>,
    /// The function's instruction sequence.
    pub instrs: Rc<[Instr]>,
}

/// A function instance: either a guest function backed by a module's code,
/// or a host function that the embedder's [`Externals`](crate::externals::Externals)
/// collaborator answers for.
pub enum FuncInstance {
    /// A function defined inside a module.
    Ast {
        ty: FuncType,
        module: Weak<ModuleInstance>,
        body: Rc<FuncBody>,
    },
    /// A function implemented by the host, identified by an index the
    /// embedder's `Externals` dispatches on.
    Host { ty: FuncType, host_index: usize },
}

impl fmt::Debug for FuncInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ast { ty, .. } => f.debug_struct("FuncInstance::Ast").field("ty", ty).finish(),
            Self::Host { ty, host_index } => f
                .debug_struct("FuncInstance::Host")
                .field("ty", ty)
                .field("host_index", host_index)
                .finish(),
        }
    }
}

impl FuncInstance {
    /// This function's signature.
    pub fn ty(&self) -> &FuncType {
        match self {
            Self::Ast { ty, .. } => ty,
            Self::Host { ty, .. } => ty,
        }
    }
}

/// A reference-counted handle to a [`FuncInstance`].
///
/// Cloning is cheap: it bumps a refcount, it does not copy the function
/// body. `Rc`, not `Arc`, because the scheduler steps one thread at a time.
#[derive(Clone, Debug)]
pub struct FuncRef(Rc<FuncInstance>);

impl FuncRef {
    /// Wraps a new function instance.
    pub fn new(instance: FuncInstance) -> Self {
        Self(Rc::new(instance))
    }

    /// Access to the underlying `Rc`, for identity comparisons.
    pub fn rc(&self) -> &Rc<FuncInstance> {
        &self.0
    }

    /// This function's signature.
    pub fn ty(&self) -> &FuncType {
        self.0.ty()
    }
}

impl std::ops::Deref for FuncRef {
    type Target = FuncInstance;

    fn deref(&self) -> &FuncInstance {
        &self.0
    }
}
