//! Externally visible items: the `Extern` union exchanged across module
//! boundaries by imports and exports, and the link-time type checks that
//! bind an import to a concrete value.

use crate::error::{self, Error};
use crate::func::FuncRef;
use crate::global::GlobalRef;
use crate::memory::{MemoryLimits, MemoryRef};
use crate::table::{TableLimits, TableRef};
use crate::value::{FuncType, RefType};

/// A value an instance can import or export: a function, table, memory,
/// or global.
#[derive(Clone)]
pub enum Extern {
    Func(FuncRef),
    Table(TableRef),
    Memory(MemoryRef),
    Global(GlobalRef),
}

impl Extern {
    /// A short name for the kind of this extern, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Extern::Func(_) => "function",
            Extern::Table(_) => "table",
            Extern::Memory(_) => "memory",
            Extern::Global(_) => "global",
        }
    }
}

/// Checks that `found` matches an imported function's declared type.
pub fn check_func_import(module: &str, field: &str, found: &Extern, expected: &FuncType) -> Result<FuncRef, Error> {
    match found {
        Extern::Func(func) if func.ty() == expected => Ok(func.clone()),
        Extern::Func(func) => Err(error::link_type_mismatch(
            module,
            field,
            &format!("{expected:?}"),
            &format!("{:?}", func.ty()),
        )),
        other => Err(error::link_type_mismatch(
            module,
            field,
            "function",
            other.kind_name(),
        )),
    }
}

/// Checks that `found` matches an imported table's declared element type
/// and is at least as large/constrained as the import demands.
pub fn check_table_import(
    module: &str,
    field: &str,
    found: &Extern,
    elem_ty: RefType,
    limits: TableLimits,
) -> Result<TableRef, Error> {
    match found {
        Extern::Table(table) if table.elem_ty() == elem_ty && compatible_limits(table.size(), limits) => {
            Ok(table.clone())
        }
        Extern::Table(_) => Err(error::link_type_mismatch(
            module,
            field,
            "compatible table",
            "incompatible table",
        )),
        other => Err(error::link_type_mismatch(module, field, "table", other.kind_name())),
    }
}

/// Checks that `found` matches an imported memory's declared limits.
pub fn check_memory_import(
    module: &str,
    field: &str,
    found: &Extern,
    limits: MemoryLimits,
) -> Result<MemoryRef, Error> {
    match found {
        Extern::Memory(memory) if compatible_limits(memory.current_pages(), limits) => Ok(memory.clone()),
        Extern::Memory(_) => Err(error::link_type_mismatch(
            module,
            field,
            "compatible memory",
            "incompatible memory",
        )),
        other => Err(error::link_type_mismatch(module, field, "memory", other.kind_name())),
    }
}

/// Checks that `found` matches an imported global's declared type and
/// mutability.
pub fn check_global_import(
    module: &str,
    field: &str,
    found: &Extern,
    ty: crate::value::ValType,
    mutable: bool,
) -> Result<GlobalRef, Error> {
    match found {
        Extern::Global(global) if global.ty() == ty && global.is_mutable() == mutable => Ok(global.clone()),
        Extern::Global(_) => Err(error::link_type_mismatch(
            module,
            field,
            "compatible global",
            "incompatible global",
        )),
        other => Err(error::link_type_mismatch(module, field, "global", other.kind_name())),
    }
}

fn compatible_limits(current_min: u32, required: impl Into<LimitsView>) -> bool {
    let required = required.into();
    current_min >= required.min
}

struct LimitsView {
    min: u32,
}

impl From<TableLimits> for LimitsView {
    fn from(l: TableLimits) -> Self {
        LimitsView { min: l.min }
    }
}

impl From<MemoryLimits> for LimitsView {
    fn from(l: MemoryLimits) -> Self {
        LimitsView { min: l.min }
    }
}
