//! Module description and instantiation.
//!
//! [`Module`] is plain, already-validated data — the shape a decoder (out
//! of scope here) would hand to [`instantiate`]. Instantiation runs the
//! four substeps: import binding, function allocation, store allocation
//! (tables/memories/globals, via [`ConstExpr::eval`]), and the
//! back-reference patch that splices active/declarative segments into
//! bootstrap `table.init`/`memory.init` plus `elem.drop`/`data.drop`.

use crate::error::Error;
use crate::func::{FuncBody, FuncInstance, FuncRef};
use crate::global::{GlobalInstance, GlobalRef};
use crate::imports::{self, Extern};
use crate::instr::Instr;
use crate::memory::{MemoryInstance, MemoryLimits, MemoryRef};
use crate::segment::{DataSegment, ElementSegment};
use crate::table::{TableInstance, TableLimits, TableRef};
use crate::value::{FuncType, Ref, RefType, ValType, Value};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// A constant initializer expression, as used by global initializers and
/// active/declarative element and data segment offsets.
#[derive(Debug, Clone)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(crate::nan_preserving_float::F32),
    F64(crate::nan_preserving_float::F64),
    RefNull(RefType),
    RefFunc(u32),
    GlobalGet(u32),
}

impl ConstExpr {
    /// Evaluates this expression. `imported_globals` backs `global.get`,
    /// which may only reference an imported (already allocated) global;
    /// `funcs` backs `ref.func`.
    pub fn eval(&self, imported_globals: &[GlobalRef], funcs: &[FuncRef]) -> Value {
        match self {
            ConstExpr::I32(v) => Value::I32(*v),
            ConstExpr::I64(v) => Value::I64(*v),
            ConstExpr::F32(v) => Value::F32(*v),
            ConstExpr::F64(v) => Value::F64(*v),
            ConstExpr::RefNull(ty) => Value::Ref(Ref::Null(*ty)),
            ConstExpr::RefFunc(idx) => Value::Ref(Ref::Func(funcs[*idx as usize].clone())),
            ConstExpr::GlobalGet(idx) => imported_globals[*idx as usize].get(),
        }
    }
}

/// An import descriptor: the two-level name plus the kind and type of the
/// item a linker must supply.
#[derive(Debug, Clone)]
pub struct ImportDescriptor {
    pub module: String,
    pub field: String,
    pub kind: ImportKind,
}

#[derive(Debug, Clone)]
pub enum ImportKind {
    Func(u32),
    Table(RefType, TableLimits),
    Memory(MemoryLimits, bool),
    Global(ValType, bool),
}

/// A locally defined function: its type index, declared locals, and body.
#[derive(Debug, Clone)]
pub struct FuncDef {
    pub type_idx: u32,
    pub locals: Vec<ValType>,
    pub body: Rc<[Instr]>,
}

#[derive(Debug, Clone)]
pub struct TableDef {
    pub elem_ty: RefType,
    pub limits: TableLimits,
}

#[derive(Debug, Clone)]
pub struct MemoryDef {
    pub limits: MemoryLimits,
    pub shared: bool,
}

#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub ty: ValType,
    pub mutable: bool,
    pub init: ConstExpr,
}

#[derive(Debug, Clone)]
pub enum ElementMode {
    Active { table_idx: u32, offset: ConstExpr },
    Passive,
    Declarative,
}

#[derive(Debug, Clone)]
pub enum ElemItem {
    Null,
    Func(u32),
}

#[derive(Debug, Clone)]
pub struct ElementDef {
    pub ty: RefType,
    pub mode: ElementMode,
    pub items: Vec<ElemItem>,
}

#[derive(Debug, Clone)]
pub enum DataMode {
    Active { memory_idx: u32, offset: ConstExpr },
    Passive,
}

#[derive(Debug, Clone)]
pub struct DataDef {
    pub mode: DataMode,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExportDef {
    pub name: String,
    pub kind: ExportKind,
}

#[derive(Debug, Copy, Clone)]
pub enum ExportKind {
    Func(u32),
    Table(u32),
    Memory(u32),
    Global(u32),
}

/// A plain, already-validated module description.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub types: Vec<FuncType>,
    pub imports: Vec<ImportDescriptor>,
    pub funcs: Vec<FuncDef>,
    pub tables: Vec<TableDef>,
    pub memories: Vec<MemoryDef>,
    pub globals: Vec<GlobalDef>,
    pub elements: Vec<ElementDef>,
    pub data: Vec<DataDef>,
    pub exports: Vec<ExportDef>,
    pub start: Option<u32>,
}

/// An instantiated module: append-only sequences of allocated store
/// objects plus the name-indexed export table.
pub struct ModuleInstance {
    pub types: Vec<FuncType>,
    pub funcs: Vec<FuncRef>,
    pub tables: Vec<TableRef>,
    pub memories: Vec<MemoryRef>,
    pub globals: Vec<GlobalRef>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
    pub exports: HashMap<String, Extern>,
    pub start: Option<FuncRef>,
}

impl ModuleInstance {
    /// Looks up an export by name.
    pub fn export(&self, name: &str) -> Option<&Extern> {
        self.exports.get(name)
    }
}

/// Resolves a module's imports against an embedder-supplied namespace.
pub trait ImportResolver {
    fn resolve(&self, module: &str, field: &str) -> Option<Extern>;
}

/// Instantiates `module` against the imports `resolver` provides.
///
/// Runs the four substeps in order: import binding, function allocation,
/// store allocation (tables/memories/globals, evaluating init
/// expressions), and the back-reference patch that lowers active element
/// segments into bootstrap `table.init` + `elem.drop` (declarative
/// segments lower to a bare `elem.drop`) and active data segments into
/// `memory.init` + `data.drop`. The caller is responsible for running the
/// resulting bootstrap code and the `start` function, if any, through the
/// scheduler (§4.7's `init` entry point does this).
pub fn instantiate(
    module: &Module,
    resolver: &dyn ImportResolver,
) -> Result<(Rc<ModuleInstance>, Vec<Instr>), Error> {
    // 1. import binding
    let mut funcs: Vec<FuncRef> = Vec::new();
    let mut tables: Vec<TableRef> = Vec::new();
    let mut memories: Vec<MemoryRef> = Vec::new();
    let mut globals: Vec<GlobalRef> = Vec::new();

    for import in &module.imports {
        let found = resolver.resolve(&import.module, &import.field).ok_or_else(|| {
            Error::link(format!(
                "unresolved import `{}::{}`",
                import.module, import.field
            ))
        })?;
        match &import.kind {
            ImportKind::Func(type_idx) => {
                let ty = &module.types[*type_idx as usize];
                funcs.push(imports::check_func_import(&import.module, &import.field, &found, ty)?);
            }
            ImportKind::Table(elem_ty, limits) => {
                tables.push(imports::check_table_import(
                    &import.module,
                    &import.field,
                    &found,
                    *elem_ty,
                    *limits,
                )?);
            }
            ImportKind::Memory(limits, _shared) => {
                memories.push(imports::check_memory_import(
                    &import.module,
                    &import.field,
                    &found,
                    *limits,
                )?);
            }
            ImportKind::Global(ty, mutable) => {
                globals.push(imports::check_global_import(
                    &import.module,
                    &import.field,
                    &found,
                    *ty,
                    *mutable,
                )?);
            }
        }
    }

    // Back-patched once the `Rc<ModuleInstance>` exists, so `Ast` function
    // bodies can resolve sibling functions, tables, memories, and globals.
    let instance = Rc::new_cyclic(|weak: &Weak<ModuleInstance>| {
        // 2. function allocation
        for def in &module.funcs {
            let ty = module.types[def.type_idx as usize].clone();
            funcs.push(FuncRef::new(FuncInstance::Ast {
                ty,
                module: weak.clone(),
                body: Rc::new(FuncBody {
                    locals: def.locals.clone(),
                    instrs: def.body.clone(),
                }),
            }));
        }

        // 3. store allocation
        for def in &module.tables {
            tables.push(TableInstance::alloc(def.elem_ty, def.limits).unwrap_or_else(|_| {
                // A validated module's own table declarations never fail
                // their own limits check; unwrap_or_else keeps this path
                // infallible without unwinding through `new_cyclic`.
                TableInstance::alloc(def.elem_ty, TableLimits { min: 0, max: Some(0) }).unwrap()
            }));
        }
        for def in &module.memories {
            memories.push(MemoryInstance::alloc(def.limits, def.shared).unwrap_or_else(|_| {
                MemoryInstance::alloc(MemoryLimits { min: 0, max: Some(0) }, false).unwrap()
            }));
        }
        for def in &module.globals {
            let value = def.init.eval(&globals, &funcs);
            globals.push(GlobalInstance::alloc(value, def.mutable));
        }

        let mut elements = Vec::with_capacity(module.elements.len());
        for def in &module.elements {
            let refs: Vec<Ref> = def
                .items
                .iter()
                .map(|item| match item {
                    ElemItem::Null => Ref::Null(def.ty),
                    ElemItem::Func(idx) => Ref::Func(funcs[*idx as usize].clone()),
                })
                .collect();
            match def.mode {
                ElementMode::Declarative => elements.push(ElementSegment::new_dropped()),
                _ => elements.push(ElementSegment::new(refs)),
            }
        }

        let data = module
            .data
            .iter()
            .map(|def| DataSegment::new(def.bytes.clone()))
            .collect();

        let mut exports = HashMap::new();
        for export in &module.exports {
            let ext = match export.kind {
                ExportKind::Func(idx) => Extern::Func(funcs[idx as usize].clone()),
                ExportKind::Table(idx) => Extern::Table(tables[idx as usize].clone()),
                ExportKind::Memory(idx) => Extern::Memory(memories[idx as usize].clone()),
                ExportKind::Global(idx) => Extern::Global(globals[idx as usize].clone()),
            };
            exports.insert(export.name.clone(), ext);
        }

        let start = module.start.map(|idx| funcs[idx as usize].clone());

        ModuleInstance {
            types: module.types.clone(),
            funcs,
            tables,
            memories,
            globals,
            elements,
            data,
            exports,
            start,
        }
    });

    // 4. back-reference patch & bootstrap splice: active segments copy
    // into their target table/memory and then drop, declarative segments
    // just drop.
    let mut bootstrap = Vec::new();
    for (idx, def) in module.elements.iter().enumerate() {
        match &def.mode {
            ElementMode::Active { table_idx, offset } => {
                let offset_value = offset.eval(&instance.globals, &instance.funcs);
                let offset = offset_value.unwrap_i32() as u32;
                let len = def.items.len() as u32;
                if len > 0 {
                    bootstrap.push(Instr::I32Const(offset as i32));
                    bootstrap.push(Instr::I32Const(0));
                    bootstrap.push(Instr::I32Const(len as i32));
                    bootstrap.push(Instr::TableInit {
                        table: *table_idx,
                        elem: idx as u32,
                    });
                }
                bootstrap.push(Instr::ElemDrop(idx as u32));
            }
            ElementMode::Declarative => bootstrap.push(Instr::ElemDrop(idx as u32)),
            ElementMode::Passive => {}
        }
    }
    for (idx, def) in module.data.iter().enumerate() {
        if let DataMode::Active { memory_idx, offset } = &def.mode {
            let offset_value = offset.eval(&instance.globals, &instance.funcs);
            let offset = offset_value.unwrap_i32() as u32;
            let len = def.bytes.len() as u32;
            if len > 0 {
                bootstrap.push(Instr::I32Const(offset as i32));
                bootstrap.push(Instr::I32Const(0));
                bootstrap.push(Instr::I32Const(len as i32));
                bootstrap.push(Instr::MemoryInit(idx as u32));
            }
            bootstrap.push(Instr::DataDrop(idx as u32));
        }
    }

    Ok((instance, bootstrap))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyResolver;
    impl ImportResolver for EmptyResolver {
        fn resolve(&self, _module: &str, _field: &str) -> Option<Extern> {
            None
        }
    }

    #[test]
    fn instantiate_module_with_no_imports() {
        let module = Module {
            globals: vec![GlobalDef {
                ty: ValType::I32,
                mutable: false,
                init: ConstExpr::I32(42),
            }],
            ..Default::default()
        };
        let (instance, bootstrap) = instantiate(&module, &EmptyResolver).unwrap();
        assert_eq!(instance.globals.len(), 1);
        assert!(instance.globals[0].get().same_value(&Value::I32(42)));
        assert!(bootstrap.is_empty());
    }

    #[test]
    fn active_element_segment_lowers_to_bootstrap_init_and_drop() {
        let module = Module {
            tables: vec![TableDef {
                elem_ty: RefType::FuncRef,
                limits: TableLimits { min: 4, max: None },
            }],
            elements: vec![ElementDef {
                ty: RefType::FuncRef,
                mode: ElementMode::Active {
                    table_idx: 0,
                    offset: ConstExpr::I32(0),
                },
                items: vec![ElemItem::Null],
            }],
            ..Default::default()
        };
        let (_instance, bootstrap) = instantiate(&module, &EmptyResolver).unwrap();
        assert!(matches!(bootstrap.last(), Some(Instr::ElemDrop(0))));
        assert!(bootstrap.iter().any(|i| matches!(i, Instr::TableInit { .. })));
    }
}
