//! End-to-end scenarios driving modules built directly from the AST types
//! (this crate has no binary/text decoder): one exported function per
//! scenario, instantiated and run to completion through a
//! [`Configuration`].

use std::rc::Rc;

use wasmi_threads::error::ErrorKind;
use wasmi_threads::externals::{Externals, NopExternals, RuntimeArgs};
use wasmi_threads::flags::Flags;
use wasmi_threads::imports::Extern;
use wasmi_threads::instr::{Instr, MemArg, Signedness};
use wasmi_threads::module::{
    ExportDef, ExportKind, FuncDef, ImportResolver, MemoryDef, Module, TableDef,
};
use wasmi_threads::scheduler::Configuration;
use wasmi_threads::table::TableLimits;
use wasmi_threads::value::{FuncType, RefType, ValType};
use wasmi_threads::{memory::MemoryLimits, Value};

struct NoImports;
impl ImportResolver for NoImports {
    fn resolve(&self, _module: &str, _field: &str) -> Option<Extern> {
        None
    }
}

fn exported_func(module: &Module, instance: &wasmi_threads::module::ModuleInstance, name: &str) -> wasmi_threads::func::FuncRef {
    let _ = module;
    match instance.export(name).expect("export present") {
        Extern::Func(f) => f.clone(),
        _ => panic!("`{name}` is not a function export"),
    }
}

fn run_to_completion(config: &mut Configuration, thread: wasmi_threads::ThreadId, module: &Module) -> wasmi_threads::func::FuncRef {
    let instance = wasmi_threads::init(config, thread, module, &NoImports).unwrap();
    config.eval(thread, &mut NopExternals).expect("bootstrap must not trap");
    exported_func(module, &instance, "main")
}

#[test]
fn unreachable_trap() {
    let mut module = Module::default();
    module.types.push(FuncType::new(vec![], vec![]));
    module.funcs.push(FuncDef {
        type_idx: 0,
        locals: vec![],
        body: Rc::from(vec![Instr::Unreachable]),
    });
    module.exports.push(ExportDef {
        name: "main".into(),
        kind: ExportKind::Func(0),
    });

    let mut config = Configuration::new(Flags::default());
    let thread = config.spawn();
    let main = run_to_completion(&mut config, thread, &module);

    config.invoke(thread, main, vec![]);
    let err = config.eval(thread, &mut NopExternals).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Trap);
    assert_eq!(err.message(), "unreachable executed");
}

#[test]
fn factorial_recursion() {
    // fact(n) = loop accumulating into local 1, counting local 0 down to 0.
    use Instr::*;
    let body = vec![
        // acc (local 1) = 1
        I32Const(1),
        LocalSet(1),
        Loop(
            wasmi_threads::instr::BlockType::Empty,
            Rc::from(vec![
                LocalGet(1), // speculatively carry the accumulator out...
                LocalGet(0),
                I32Eqz,
                BrIf(1), // ...exit to the enclosing block when n == 0
                Drop,    // otherwise the speculative carry goes unused
                LocalGet(1),
                LocalGet(0),
                I32Mul,
                LocalSet(1),
                LocalGet(0),
                I32Const(1),
                I32Sub,
                LocalSet(0),
                Br(0),
            ]),
        ),
        LocalGet(1),
    ];
    // wrap the loop in a block so `BrIf(1)` exits past it, arity 1 (the result)
    let wrapped = vec![Block(wasmi_threads::instr::BlockType::Value(ValType::I32), Rc::from(body))];

    let mut module = Module::default();
    module.types.push(FuncType::new(vec![ValType::I32], vec![ValType::I32]));
    module.funcs.push(FuncDef {
        type_idx: 0,
        locals: vec![ValType::I32],
        body: Rc::from(wrapped),
    });
    module.exports.push(ExportDef {
        name: "main".into(),
        kind: ExportKind::Func(0),
    });

    let mut config = Configuration::new(Flags::default());
    let thread = config.spawn();
    let main = run_to_completion(&mut config, thread, &module);

    config.invoke(thread, main, vec![Value::I32(10)]);
    let results = config.eval(thread, &mut NopExternals).unwrap();
    assert_eq!(results, vec![Value::I32(3628800)]);
}

#[test]
fn indirect_call_type_mismatch() {
    let mut module = Module::default();
    // type 0: []->[i32], type 1: []->[i64]
    module.types.push(FuncType::new(vec![], vec![ValType::I32]));
    module.types.push(FuncType::new(vec![], vec![ValType::I64]));
    module.funcs.push(FuncDef {
        type_idx: 0,
        locals: vec![],
        body: Rc::from(vec![Instr::I32Const(1)]),
    });
    module.tables.push(TableDef {
        elem_ty: RefType::FuncRef,
        limits: TableLimits { min: 1, max: Some(1) },
    });
    module.elements.push(wasmi_threads::module::ElementDef {
        ty: RefType::FuncRef,
        mode: wasmi_threads::module::ElementMode::Active {
            table_idx: 0,
            offset: wasmi_threads::module::ConstExpr::I32(0),
        },
        items: vec![wasmi_threads::module::ElemItem::Func(0)],
    });
    // main: i32.const 0; call_indirect (type 1, table 0)
    module.funcs.push(FuncDef {
        type_idx: 1,
        locals: vec![],
        body: Rc::from(vec![Instr::I32Const(0), Instr::CallIndirect(1, 0)]),
    });
    module.exports.push(ExportDef {
        name: "main".into(),
        kind: ExportKind::Func(1),
    });

    let mut config = Configuration::new(Flags::default());
    let thread = config.spawn();
    let main = run_to_completion(&mut config, thread, &module);

    config.invoke(thread, main, vec![]);
    let err = config.eval(thread, &mut NopExternals).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Trap);
    assert_eq!(err.message(), "indirect call type mismatch");
}

#[test]
fn memory_grow_and_fill() {
    let mut module = Module::default();
    module.memories.push(MemoryDef {
        limits: MemoryLimits { min: 1, max: Some(2) },
        shared: true,
    });
    module.types.push(FuncType::new(vec![], vec![ValType::I32, ValType::I32]));
    use Instr::*;
    // grow(1) returns previous page count; fill(65536, 0xAB, 4); load8_u(65536)
    let body = vec![
        I32Const(1),
        MemoryGrow,
        I32Const(65536),
        I32Const(0xAB),
        I32Const(4),
        MemoryFill,
        I32Const(65536),
        I32Load8(Signedness::Unsigned, MemArg { align: 0, offset: 0 }),
    ];
    module.funcs.push(FuncDef {
        type_idx: 0,
        locals: vec![],
        body: Rc::from(body),
    });
    module.exports.push(ExportDef {
        name: "main".into(),
        kind: ExportKind::Func(0),
    });

    let mut config = Configuration::new(Flags::default());
    let thread = config.spawn();
    let main = run_to_completion(&mut config, thread, &module);

    config.invoke(thread, main, vec![]);
    let results = config.eval(thread, &mut NopExternals).unwrap();
    assert_eq!(results, vec![Value::I32(1), Value::I32(0xAB)]);
}

#[test]
fn wait_notify_rendezvous() {
    let mut module = Module::default();
    module.memories.push(MemoryDef {
        limits: MemoryLimits { min: 1, max: Some(1) },
        shared: true,
    });
    module.types.push(FuncType::new(vec![], vec![ValType::I32]));
    module.types.push(FuncType::new(vec![], vec![ValType::I32]));
    use Instr::*;
    // waiter: memory.atomic.wait32(addr=0, expected=0, timeout=-1)
    module.funcs.push(FuncDef {
        type_idx: 0,
        locals: vec![],
        body: Rc::from(vec![
            I32Const(0),
            I32Const(0),
            I64Const(-1),
            MemoryAtomicWait32(MemArg { align: 2, offset: 0 }),
        ]),
    });
    // notifier: memory.atomic.notify(addr=0, count=1)
    module.funcs.push(FuncDef {
        type_idx: 1,
        locals: vec![],
        body: Rc::from(vec![
            I32Const(0),
            I32Const(1),
            MemoryAtomicNotify(MemArg { align: 2, offset: 0 }),
        ]),
    });
    module.exports.push(ExportDef {
        name: "waiter".into(),
        kind: ExportKind::Func(0),
    });
    module.exports.push(ExportDef {
        name: "notifier".into(),
        kind: ExportKind::Func(1),
    });

    let mut config = Configuration::new(Flags::default());
    let t1 = config.spawn();
    let instance = wasmi_threads::init(&mut config, t1, &module, &NoImports).unwrap();
    config.eval(t1, &mut NopExternals).unwrap();
    let t2 = config.spawn();

    let waiter = match instance.export("waiter").unwrap() {
        Extern::Func(f) => f.clone(),
        _ => unreachable!(),
    };
    let notifier = match instance.export("notifier").unwrap() {
        Extern::Func(f) => f.clone(),
        _ => unreachable!(),
    };

    config.invoke(t1, waiter, vec![]);
    // A single `step` runs the constant pushes and the wait together: none
    // of them yield control back to the scheduler until `wait32` suspends.
    config.step(t1, &mut NopExternals).unwrap();
    assert!(matches!(
        config.status(t1),
        wasmi_threads::thread::ThreadStatus::Suspended
    ));

    config.invoke(t2, notifier, vec![]);
    config.eval(t2, &mut NopExternals).unwrap();
    let t2_results = match config.status(t2) {
        wasmi_threads::thread::ThreadStatus::Result(vs) => vs.clone(),
        other => panic!("expected t2 to finish, got {other:?}"),
    };
    assert_eq!(t2_results, vec![Value::I32(1)]);

    let t1_results = config.eval(t1, &mut NopExternals).unwrap();
    assert_eq!(t1_results, vec![Value::I32(0)]);
}

#[test]
fn bulk_copy_with_overlap() {
    let mut module = Module::default();
    module.memories.push(MemoryDef {
        limits: MemoryLimits { min: 1, max: Some(1) },
        shared: false,
    });
    module.types.push(FuncType::new(vec![], vec![]));
    use Instr::*;
    module.funcs.push(FuncDef {
        type_idx: 0,
        locals: vec![],
        body: Rc::from(vec![I32Const(2), I32Const(0), I32Const(5), MemoryCopy]),
    });
    module.exports.push(ExportDef {
        name: "main".into(),
        kind: ExportKind::Func(0),
    });

    let mut config = Configuration::new(Flags::default());
    let thread = config.spawn();
    let instance = wasmi_threads::init(&mut config, thread, &module, &NoImports).unwrap();
    config.eval(thread, &mut NopExternals).unwrap();

    let memory = instance.memories[0].clone();
    memory.write(0, &[1, 2, 3, 4, 5, 0, 0, 0, 0, 0]).unwrap();

    let main = exported_func(&module, &instance, "main");
    config.invoke(thread, main, vec![]);
    config.eval(thread, &mut NopExternals).unwrap();

    let bytes = memory.read(0, 10).unwrap();
    assert_eq!(bytes, vec![1, 2, 1, 2, 3, 4, 5, 0, 0, 0]);
}

struct EchoHost;
impl Externals for EchoHost {
    fn invoke_index(&mut self, _index: usize, args: RuntimeArgs) -> Result<Vec<Value>, wasmi_threads::Error> {
        Ok(args.as_slice().to_vec())
    }
}

#[test]
fn memory_grow_at_max_returns_minus_one() {
    let mut module = Module::default();
    module.memories.push(MemoryDef {
        limits: MemoryLimits { min: 1, max: Some(1) },
        shared: false,
    });
    module.types.push(FuncType::new(vec![], vec![ValType::I32]));
    module.funcs.push(FuncDef {
        type_idx: 0,
        locals: vec![],
        body: Rc::from(vec![Instr::I32Const(1), Instr::MemoryGrow]),
    });
    module.exports.push(ExportDef {
        name: "main".into(),
        kind: ExportKind::Func(0),
    });

    let mut config = Configuration::new(Flags::default());
    let thread = config.spawn();
    let main = run_to_completion(&mut config, thread, &module);
    config.invoke(thread, main, vec![]);
    let results = config.eval(thread, &mut NopExternals).unwrap();
    assert_eq!(results, vec![Value::I32(-1)]);
}

#[test]
fn table_copy_zero_length_never_traps() {
    let mut module = Module::default();
    module.tables.push(TableDef {
        elem_ty: RefType::FuncRef,
        limits: TableLimits { min: 1, max: Some(1) },
    });
    module.types.push(FuncType::new(vec![], vec![]));
    module.funcs.push(FuncDef {
        type_idx: 0,
        locals: vec![],
        // dst/src both far out of bounds, but n=0: must be a no-op, not a trap
        body: Rc::from(vec![
            Instr::I32Const(1_000_000),
            Instr::I32Const(1_000_000),
            Instr::I32Const(0),
            Instr::TableCopy { dst: 0, src: 0 },
        ]),
    });
    module.exports.push(ExportDef {
        name: "main".into(),
        kind: ExportKind::Func(0),
    });

    let mut config = Configuration::new(Flags::default());
    let thread = config.spawn();
    let main = run_to_completion(&mut config, thread, &module);
    config.invoke(thread, main, vec![]);
    config.eval(thread, &mut NopExternals).unwrap();
    assert!(matches!(
        config.status(thread),
        wasmi_threads::thread::ThreadStatus::Result(vs) if vs.is_empty()
    ));
}

#[test]
fn atomic_wait_nonmatching_value_returns_one_without_suspending() {
    let mut module = Module::default();
    module.memories.push(MemoryDef {
        limits: MemoryLimits { min: 1, max: Some(1) },
        shared: true,
    });
    module.types.push(FuncType::new(vec![], vec![ValType::I32]));
    use Instr::*;
    module.funcs.push(FuncDef {
        type_idx: 0,
        locals: vec![],
        // memory starts zeroed; expect 1 can never match -> result 1, no suspend
        body: Rc::from(vec![
            I32Const(0),
            I32Const(1),
            I64Const(-1),
            MemoryAtomicWait32(MemArg { align: 2, offset: 0 }),
        ]),
    });
    module.exports.push(ExportDef {
        name: "main".into(),
        kind: ExportKind::Func(0),
    });

    let mut config = Configuration::new(Flags::default());
    let thread = config.spawn();
    let main = run_to_completion(&mut config, thread, &module);
    config.invoke(thread, main, vec![]);
    let results = config.eval(thread, &mut NopExternals).unwrap();
    assert_eq!(results, vec![Value::I32(1)]);
}

#[test]
fn host_import_round_trips_arguments() {
    let mut module = Module::default();
    module.types.push(FuncType::new(vec![ValType::I32], vec![ValType::I32]));
    module.imports.push(wasmi_threads::module::ImportDescriptor {
        module: "env".into(),
        field: "echo".into(),
        kind: wasmi_threads::module::ImportKind::Func(0),
    });
    module.funcs.push(FuncDef {
        type_idx: 0,
        locals: vec![],
        body: Rc::from(vec![Instr::LocalGet(0), Instr::Call(0)]),
    });
    module.exports.push(ExportDef {
        name: "main".into(),
        kind: ExportKind::Func(1),
    });

    struct EchoResolver(wasmi_threads::func::FuncRef);
    impl ImportResolver for EchoResolver {
        fn resolve(&self, _module: &str, _field: &str) -> Option<Extern> {
            Some(Extern::Func(self.0.clone()))
        }
    }
    let echo = wasmi_threads::func::FuncRef::new(wasmi_threads::func::FuncInstance::Host {
        ty: FuncType::new(vec![ValType::I32], vec![ValType::I32]),
        host_index: 0,
    });

    let mut config = Configuration::new(Flags::default());
    let thread = config.spawn();
    let instance = wasmi_threads::init(&mut config, thread, &module, &EchoResolver(echo)).unwrap();
    config.eval(thread, &mut EchoHost).unwrap();

    let main = exported_func(&module, &instance, "main");
    config.invoke(thread, main, vec![Value::I32(99)]);
    let results = config.eval(thread, &mut EchoHost).unwrap();
    assert_eq!(results, vec![Value::I32(99)]);
}
