//! Execution core for a WebAssembly interpreter extended with the threads
//! proposal: shared memory, atomic memory operations, and a wait/notify
//! coordination primitive.
//!
//! This crate is the *reduction engine*, not an embedding. It has no
//! binary/text decoder, no validator, and no command-line front end —
//! those are external collaborators that hand this crate an
//! already-validated [`module::Module`] plus host callbacks
//! ([`externals::Externals`]). What lives here is:
//!
//! - a small-step reducer over an administrative-instruction
//!   representation of Wasm code ([`engine`]), covering control flow,
//!   linear memory and tables (including bulk ops), reference types,
//!   SIMD, and atomics;
//! - the stores those instructions operate on: [`memory`], [`table`],
//!   [`global`], [`segment`];
//! - module instantiation and linking ([`module`]);
//! - a cooperative multi-thread [`scheduler`] that turns one thread's
//!   `atomic.wait` into another's unblock via `atomic.notify`, without any
//!   OS threads or locks underneath it.
//!
//! # Example
//!
//! ```no_run
//! use wasmi_threads::{module::{ImportResolver, Module}, scheduler::Configuration, Flags, imports::Extern};
//!
//! struct NoImports;
//! impl ImportResolver for NoImports {
//!     fn resolve(&self, _module: &str, _field: &str) -> Option<Extern> {
//!         None
//!     }
//! }
//!
//! # fn run(module: &Module) -> Result<(), wasmi_threads::error::Error> {
//! let mut config = Configuration::new(Flags::default());
//! let thread = config.spawn();
//! let instance = wasmi_threads::init(&mut config, thread, module, &NoImports)?;
//! let externals = &mut wasmi_threads::externals::NopExternals;
//! config.eval(thread, externals)?;
//!
//! let answer = instance.export("answer").and_then(|e| match e {
//!     Extern::Func(f) => Some(f.clone()),
//!     _ => None,
//! }).expect("module exports a function named `answer`");
//! config.invoke(thread, answer, vec![]);
//! let results = config.eval(thread, externals)?;
//! # let _ = results;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod admin;
pub mod error;
pub mod externals;
pub mod flags;
pub mod func;
pub mod global;
pub mod imports;
pub mod instr;
pub mod memory;
pub mod module;
pub mod nan_preserving_float;
pub mod numeric;
pub mod scheduler;
pub mod segment;
pub mod table;
pub mod thread;
pub mod value;

pub mod engine;

pub use error::Error;
pub use flags::Flags;
pub use module::Module;
pub use scheduler::{Configuration, ThreadId};
pub use value::Value;

use func::FuncRef;
use module::{ImportResolver, ModuleInstance};
use std::rc::Rc;

/// Instantiates `module` against `resolver` and splices its bootstrap
/// code (active/declarative element and data segment initializers,
/// followed by the `start` function if any) onto the front of thread
/// `id`'s code, ahead of whatever it currently holds.
///
/// The caller drives the bootstrap to completion with
/// [`Configuration::eval`] before treating the instance as ready; a
/// `start` function that traps surfaces through `eval` exactly like any
/// other trap.
pub fn init(
    config: &mut Configuration,
    id: ThreadId,
    module: &Module,
    resolver: &dyn ImportResolver,
) -> Result<Rc<ModuleInstance>, Error> {
    let (instance, bootstrap) = module::instantiate(module, resolver)?;

    let mut prefix: Vec<admin::AdminInstr> = bootstrap.into_iter().map(admin::AdminInstr::Plain).collect();
    if let Some(start) = &instance.start {
        prefix.push(admin::AdminInstr::Invoke(start.clone()));
    }

    let thread = config.thread_mut(id);
    if thread.activations.is_empty() {
        thread.activations.push(thread::Activation {
            kind: thread::ControlKind::Label { arity: 0, loop_body: None },
            code: admin::Code::new(),
        });
    }
    thread.status = thread::ThreadStatus::Running;
    let top = thread.activations.last_mut().expect("just ensured non-empty");
    for instr in prefix.into_iter().rev() {
        top.code.push_front(instr);
    }

    Ok(instance)
}

/// Reduces a constant initializer expression to a single value.
///
/// [`module::ConstExpr`] is already a pure, total function of an
/// instance's globals and functions — it has no control flow to step —
/// so this is a direct call rather than a throwaway single-thread
/// configuration.
pub fn eval_const(instance: &ModuleInstance, expr: &module::ConstExpr) -> Value {
    expr.eval(&instance.globals, &instance.funcs)
}

/// Schedules a call to `func` with `args` on thread `id`, to be driven by
/// a subsequent [`Configuration::eval`]. A thin free-function wrapper
/// around [`Configuration::invoke`] matching this crate's external
/// interface naming; most callers reach for the method directly.
pub fn invoke(config: &mut Configuration, id: ThreadId, func: FuncRef, args: Vec<Value>) {
    config.invoke(id, func, args);
}
