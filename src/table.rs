//! Tables: bounded growable arrays of reference values, uniform in
//! reference type, backing `call_indirect` and the reference-types
//! operators.

use crate::error::{Error, TrapCode};
use crate::value::{Ref, RefType};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// The hard ceiling on the number of elements a table can ever reach.
pub const MAX_ELEMENTS: u32 = u32::MAX;

/// Growth/descriptor limits on a table: `min`/`max` given in elements.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TableLimits {
    pub min: u32,
    pub max: Option<u32>,
}

/// A table instance: a growable array of nullable references, all of the
/// same [`RefType`].
pub struct TableInstance {
    elements: RefCell<Vec<Ref>>,
    limits: TableLimits,
    elem_ty: RefType,
}

/// A reference-counted handle to a [`TableInstance`].
#[derive(Clone)]
pub struct TableRef(Rc<TableInstance>);

impl fmt::Debug for TableInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TableInstance")
            .field("size", &self.elements.borrow().len())
            .field("limits", &self.limits)
            .field("elem_ty", &self.elem_ty)
            .finish()
    }
}

impl TableInstance {
    /// Allocates a new table of `limits.min` elements, all null.
    pub fn alloc(elem_ty: RefType, limits: TableLimits) -> Result<TableRef, Error> {
        if let Some(max) = limits.max {
            if max < limits.min {
                return Err(Error::link("table size minimum must not exceed maximum"));
            }
        }
        let elements = vec![Ref::Null(elem_ty); limits.min as usize];
        Ok(TableRef(Rc::new(TableInstance {
            elements: RefCell::new(elements),
            limits,
            elem_ty,
        })))
    }

    /// This table's element type.
    pub fn elem_ty(&self) -> RefType {
        self.elem_ty
    }

    /// Current size in elements.
    pub fn size(&self) -> u32 {
        self.elements.borrow().len() as u32
    }

    /// Grows the table by `delta` elements filled with `init`, returning
    /// the previous size, or `-1` (as `None`) if growth would exceed the
    /// declared maximum.
    pub fn grow(&self, delta: u32, init: Ref) -> Option<u32> {
        let mut elements = self.elements.borrow_mut();
        let current = elements.len() as u32;
        let new_size = current.checked_add(delta)?;
        let ceiling = self.limits.max.unwrap_or(MAX_ELEMENTS);
        if new_size > ceiling {
            return None;
        }
        elements.resize(new_size as usize, init);
        Some(current)
    }

    /// Reads the element at `index`.
    pub fn get(&self, index: u32) -> Result<Ref, Error> {
        self.elements
            .borrow()
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Error::trap(TrapCode::TableOutOfBounds, None))
    }

    /// Writes `value` at `index`.
    pub fn set(&self, index: u32, value: Ref) -> Result<(), Error> {
        let mut elements = self.elements.borrow_mut();
        let slot = elements
            .get_mut(index as usize)
            .ok_or_else(|| Error::trap(TrapCode::TableOutOfBounds, None))?;
        *slot = value;
        Ok(())
    }

    /// Fills a single element at `index` with `value`, for the one-step
    /// `table.fill` administrative reduction.
    pub fn fill_one(&self, index: u32, value: Ref) -> Result<(), Error> {
        self.set(index, value)
    }

    /// Copies a single element from `src` to `dst`, for the one-step
    /// `table.copy` administrative reduction.
    pub fn copy_one(&self, dst: u32, src: u32) -> Result<(), Error> {
        let value = self.get(src)?;
        self.set(dst, value)
    }

    /// Bound check ahead of a bulk operation's first one-step reduction.
    pub fn checked_bounds(&self, offset: u32, len: u32) -> Result<(), Error> {
        let end = offset.checked_add(len);
        match end {
            Some(end) if (end as usize) <= self.elements.borrow().len() => Ok(()),
            _ => Err(Error::trap(TrapCode::TableOutOfBounds, None)),
        }
    }
}

impl TableRef {
    /// Borrows the underlying instance.
    pub fn instance(&self) -> &TableInstance {
        &self.0
    }

    /// `true` if both handles point at the same table instance.
    pub fn ptr_eq(&self, other: &TableRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl std::ops::Deref for TableRef {
    type Target = TableInstance;

    fn deref(&self) -> &TableInstance {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_fills_new_slots_with_init_value() {
        let table = TableInstance::alloc(RefType::FuncRef, TableLimits { min: 1, max: None }).unwrap();
        assert_eq!(table.grow(2, Ref::Null(RefType::FuncRef)), Some(1));
        assert_eq!(table.size(), 3);
    }

    #[test]
    fn grow_past_max_returns_none() {
        let table = TableInstance::alloc(
            RefType::FuncRef,
            TableLimits {
                min: 1,
                max: Some(1),
            },
        )
        .unwrap();
        assert_eq!(table.grow(1, Ref::Null(RefType::FuncRef)), None);
    }

    #[test]
    fn out_of_bounds_get_traps() {
        let table = TableInstance::alloc(RefType::FuncRef, TableLimits { min: 1, max: None }).unwrap();
        assert!(table.get(1).is_err());
        assert!(table.get(0).is_ok());
    }
}
