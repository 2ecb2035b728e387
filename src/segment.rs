//! Element and data segments: the initializer lists consumed by
//! `table.init`/`memory.init` (and, for active segments, by instantiation
//! itself), plus their `drop` operation.

use crate::error::{Error, TrapCode};
use crate::value::Ref;
use std::cell::RefCell;

/// An element segment: a list of references plus a drained flag.
///
/// Passive and declarative segments stay around after instantiation so
/// guest code can `table.init` from them later; a declarative segment is
/// dropped immediately, which is why `drop` is idempotent rather than an
/// error on an already-drained segment.
pub struct ElementSegment {
    elements: RefCell<Option<Vec<Ref>>>,
}

impl ElementSegment {
    /// Builds a new, not-yet-dropped element segment.
    pub fn new(elements: Vec<Ref>) -> Self {
        Self {
            elements: RefCell::new(Some(elements)),
        }
    }

    /// Builds an already-dropped segment (used for declarative segments,
    /// which are dropped the moment instantiation lowers them).
    pub fn new_dropped() -> Self {
        Self {
            elements: RefCell::new(None),
        }
    }

    /// `true` if this segment has been dropped.
    pub fn is_dropped(&self) -> bool {
        self.elements.borrow().is_none()
    }

    /// Reads a slice `[offset, offset+len)` from the segment. Fails with
    /// an out-of-bounds trap if the segment has been dropped or the range
    /// exceeds its length — a drained segment behaves as if it were empty.
    pub fn read(&self, offset: u32, len: u32) -> Result<Vec<Ref>, Error> {
        let guard = self.elements.borrow();
        let elements = guard
            .as_ref()
            .ok_or_else(|| Error::trap(TrapCode::TableOutOfBounds, None))?;
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= elements.len())
            .ok_or_else(|| Error::trap(TrapCode::TableOutOfBounds, None))?;
        Ok(elements[start..end].to_vec())
    }

    /// Reads a single element at `index`, used by the one-step
    /// `table.init` administrative reduction.
    pub fn read_one(&self, index: u32) -> Result<Ref, Error> {
        let guard = self.elements.borrow();
        let elements = guard
            .as_ref()
            .ok_or_else(|| Error::trap(TrapCode::TableOutOfBounds, None))?;
        elements
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Error::trap(TrapCode::TableOutOfBounds, None))
    }

    /// The segment's element count, or 0 once dropped.
    pub fn len(&self) -> u32 {
        self.elements
            .borrow()
            .as_ref()
            .map_or(0, |e| e.len() as u32)
    }

    /// Drops the segment's contents. Idempotent.
    pub fn drop_contents(&self) {
        *self.elements.borrow_mut() = None;
    }
}

/// A data segment: a byte string plus a drained flag, otherwise the same
/// shape and idempotent-drop behavior as [`ElementSegment`].
pub struct DataSegment {
    bytes: RefCell<Option<Vec<u8>>>,
}

impl DataSegment {
    /// Builds a new, not-yet-dropped data segment.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RefCell::new(Some(bytes)),
        }
    }

    /// `true` if this segment has been dropped.
    pub fn is_dropped(&self) -> bool {
        self.bytes.borrow().is_none()
    }

    /// Reads a single byte at `index`, used by the one-step `memory.init`
    /// administrative reduction.
    pub fn read_one(&self, index: u32) -> Result<u8, Error> {
        let guard = self.bytes.borrow();
        let bytes = guard
            .as_ref()
            .ok_or_else(|| Error::trap(TrapCode::MemoryOutOfBounds, None))?;
        bytes
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::trap(TrapCode::MemoryOutOfBounds, None))
    }

    /// The segment's byte length, or 0 once dropped.
    pub fn len(&self) -> u32 {
        self.bytes.borrow().as_ref().map_or(0, |b| b.len() as u32)
    }

    /// Drops the segment's contents. Idempotent.
    pub fn drop_contents(&self) {
        *self.bytes.borrow_mut() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::RefType;

    #[test]
    fn drop_is_idempotent() {
        let seg = DataSegment::new(vec![1, 2, 3]);
        seg.drop_contents();
        seg.drop_contents();
        assert!(seg.is_dropped());
        assert!(seg.read_one(0).is_err());
    }

    #[test]
    fn element_segment_out_of_bounds_after_drop() {
        let seg = ElementSegment::new(vec![Ref::Null(RefType::FuncRef)]);
        assert!(seg.read_one(0).is_ok());
        seg.drop_contents();
        assert!(seg.read_one(0).is_err());
    }
}
