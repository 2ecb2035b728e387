//! Global variables: a typed, optionally mutable cell.

use crate::error::{self, Error};
use crate::value::{ValType, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// A global variable instance.
pub struct GlobalInstance {
    value: RefCell<Value>,
    mutable: bool,
}

/// A reference-counted handle to a [`GlobalInstance`].
#[derive(Clone)]
pub struct GlobalRef(Rc<GlobalInstance>);

impl GlobalInstance {
    /// Allocates a new global with the given initial value and mutability.
    pub fn alloc(initial: Value, mutable: bool) -> GlobalRef {
        GlobalRef(Rc::new(GlobalInstance {
            value: RefCell::new(initial),
            mutable,
        }))
    }

    /// `true` if writes to this global are permitted.
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// This global's value type.
    pub fn ty(&self) -> ValType {
        self.value.borrow().ty()
    }

    /// Reads the current value.
    pub fn get(&self) -> Value {
        self.value.borrow().clone()
    }

    /// Writes a new value. Writing to an immutable global is impossible
    /// for validated code, so it crashes rather than returning an `Error`.
    pub fn set(&self, value: Value) -> Result<(), Error> {
        if !self.mutable {
            error::crash("store to immutable global");
        }
        *self.value.borrow_mut() = value;
        Ok(())
    }
}

impl GlobalRef {
    /// Borrows the underlying instance.
    pub fn instance(&self) -> &GlobalInstance {
        &self.0
    }

    /// `true` if both handles point at the same global instance.
    pub fn ptr_eq(&self, other: &GlobalRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl std::ops::Deref for GlobalRef {
    type Target = GlobalInstance;

    fn deref(&self) -> &GlobalInstance {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutable_global_round_trips() {
        let g = GlobalInstance::alloc(Value::I32(1), true);
        g.set(Value::I32(2)).unwrap();
        assert!(g.get().same_value(&Value::I32(2)));
    }

    #[test]
    #[should_panic(expected = "immutable global")]
    fn immutable_global_write_crashes() {
        let g = GlobalInstance::alloc(Value::I32(1), false);
        let _ = g.set(Value::I32(2));
    }
}
