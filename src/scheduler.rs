//! Thread & configuration scheduler: a flat, append-only list of
//! cooperatively stepped threads, plus the wait/notify rendezvous that
//! turns one thread's `memory.atomic.notify` into another's unblock.
//!
//! Concurrency here is purely logical (§5): one thread advances one
//! micro-step per [`Configuration::step`] call, chosen by the embedder.
//! There are no OS threads or locks beneath this layer, so atomics
//! degenerate to plain read-modify-write and `atomic.fence` is a no-op.

use crate::admin::{AdminInstr, Code};
use crate::engine::{self, StepOutcome};
use crate::error::Error;
use crate::externals::Externals;
use crate::flags::Flags;
use crate::func::FuncRef;
use crate::thread::{Activation, ControlKind, Thread, ThreadStatus};
use crate::value::Value;

/// A thread's position in a [`Configuration`]'s thread list. Threads are
/// never removed once spawned (only [`Configuration::clear`]ed), so ids
/// stay stable for the configuration's lifetime.
pub type ThreadId = usize;

/// An ordered sequence of threads (§3's "Configuration"). New threads are
/// appended by [`spawn`](Configuration::spawn); none are ever removed.
pub struct Configuration {
    threads: Vec<Thread>,
    flags: Flags,
}

impl Configuration {
    /// An empty configuration; `flags` seeds every thread it spawns.
    pub fn new(flags: Flags) -> Self {
        Self {
            threads: Vec::new(),
            flags,
        }
    }

    /// Appends an idle thread, seeded with the configured call-stack
    /// budget, and returns its id.
    pub fn spawn(&mut self) -> ThreadId {
        self.threads.push(Thread::new(self.flags.call_stack_budget()));
        self.threads.len() - 1
    }

    /// Read-only access to thread `id`, e.g. to inspect `suspended_on`.
    pub fn thread(&self, id: ThreadId) -> &Thread {
        &self.threads[id]
    }

    /// Mutable access to thread `id`. Exposed for `init`'s bootstrap
    /// splice, which pushes the element/data initializers and `start`
    /// call directly onto a chosen thread ahead of whatever it holds.
    pub fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        &mut self.threads[id]
    }

    /// `Running`, `Result`, `Trap`, or `Suspended`, per §4.6.
    pub fn status(&self, id: ThreadId) -> &ThreadStatus {
        &self.threads[id].status
    }

    /// Empties thread `id`'s code, discarding any in-flight activations
    /// and suspension state. The thread reports `Result([])` (an empty
    /// code list) until invoked again.
    pub fn clear(&mut self, id: ThreadId) {
        let thread = &mut self.threads[id];
        thread.activations.clear();
        thread.status = ThreadStatus::Result(Vec::new());
        thread.suspended_on = None;
    }

    /// Type-checks `args` against `func`'s signature (a crash on
    /// mismatch — a validated module's own calls never disagree with a
    /// callee's declared type) and schedules the call on top of thread
    /// `id`'s code, with `args` pushed in reverse order so the callee
    /// sees them in call order.
    ///
    /// The call sits under a bookkeeping root label (arity = the
    /// callee's result count, no branch target) rather than a call
    /// frame: nothing above the callee's own `Invoke` ever reads its
    /// locals, and a label needs no owning module instance to exist.
    pub fn invoke(&mut self, id: ThreadId, func: FuncRef, args: Vec<Value>) {
        let params = func.ty().params();
        if args.len() != params.len() || args.iter().zip(params).any(|(v, t)| v.ty() != *t) {
            crate::error::crash("invoke: argument types do not match callee signature");
        }
        let arity = func.ty().results().len();
        let thread = &mut self.threads[id];
        if matches!(thread.status, ThreadStatus::Trap(_)) {
            thread.activations.clear();
        }
        if thread.activations.is_empty() {
            thread.activations.push(Activation {
                kind: ControlKind::Label { arity, loop_body: None },
                code: Code::new(),
            });
        }
        thread.status = ThreadStatus::Running;
        thread.suspended_on = None;
        let top = thread.activations.last_mut().expect("just ensured non-empty");
        for arg in args.into_iter().rev() {
            top.code.stack.push(arg);
        }
        top.code.instrs.push_back(AdminInstr::Invoke(func));
    }

    /// Advances thread `id` by one [`engine::step_thread`]. When that
    /// produces a `Notify`, walks every *other* thread looking for one
    /// suspended on the same memory and address (by pointer identity, per
    /// §4.6), wakes up to `max_count` of them, and plugs the count
    /// actually woken back into the notifying thread.
    pub fn step(&mut self, id: ThreadId, externals: &mut dyn Externals) -> Result<(), Error> {
        let outcome = engine::step_thread(&mut self.threads[id], externals)?;
        if let StepOutcome::Notify { memory, address, max_count } = outcome {
            let mut woken = 0u32;
            for (other_id, other) in self.threads.iter_mut().enumerate() {
                if woken >= max_count || other_id == id {
                    continue;
                }
                let parked_here = other
                    .suspended_on
                    .as_ref()
                    .is_some_and(|(m, a)| m.ptr_eq(&memory) && *a == address);
                if parked_here {
                    engine::finish_wait(other, 0);
                    woken += 1;
                }
            }
            engine::finish_notify(&mut self.threads[id], woken);
        }
        Ok(())
    }

    /// Steps thread `id` to a fixed point: until its status is no longer
    /// `Running`. Returns the final result values, or propagates the
    /// trap that ended it.
    ///
    /// A thread that lands on `Suspended` without another thread's
    /// `notify` ever reaching it would loop here forever; driving the
    /// schedule across threads so a waiter's `notify` actually runs is
    /// the embedder's responsibility (§5), not this engine's.
    pub fn eval(&mut self, id: ThreadId, externals: &mut dyn Externals) -> Result<Vec<Value>, Error> {
        loop {
            match &self.threads[id].status {
                ThreadStatus::Result(values) => return Ok(values.clone()),
                ThreadStatus::Trap(code) => return Err(Error::trap(*code, None)),
                ThreadStatus::Suspended | ThreadStatus::Running => {}
            }
            self.step(id, externals)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::externals::NopExternals;
    use crate::func::{FuncBody, FuncInstance};
    use crate::instr::Instr;
    use crate::value::{FuncType, ValType};
    use std::rc::Rc;

    fn const_func(value: i32) -> FuncRef {
        FuncRef::new(FuncInstance::Host {
            ty: FuncType::new(vec![], vec![ValType::I32]),
            host_index: value as usize,
        })
    }

    struct ConstExternals;
    impl Externals for ConstExternals {
        fn invoke_index(&mut self, index: usize, _args: crate::externals::RuntimeArgs) -> Result<Vec<Value>, Error> {
            Ok(vec![Value::I32(index as i32)])
        }
    }

    #[test]
    fn spawn_then_invoke_then_eval_returns_result() {
        let mut config = Configuration::new(Flags::default());
        let id = config.spawn();
        config.invoke(id, const_func(42), vec![]);
        let results = config.eval(id, &mut ConstExternals).unwrap();
        assert_eq!(results, vec![Value::I32(42)]);
    }

    #[test]
    fn unreachable_body_traps() {
        let ty = FuncType::new(vec![], vec![]);
        let body = Rc::new(FuncBody {
            locals: vec![],
            instrs: Rc::from(vec![Instr::Unreachable]),
        });
        let module = crate::module::ModuleInstance {
            types: vec![],
            funcs: vec![],
            tables: vec![],
            memories: vec![],
            globals: vec![],
            elements: vec![],
            data: vec![],
            exports: Default::default(),
            start: None,
        };
        let module = Rc::new(module);
        let func = FuncRef::new(FuncInstance::Ast {
            ty,
            module: Rc::downgrade(&module),
            body,
        });

        let mut config = Configuration::new(Flags::default());
        let id = config.spawn();
        config.invoke(id, func, vec![]);
        let err = config.eval(id, &mut NopExternals).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Trap);
        assert_eq!(err.message(), "unreachable executed");
    }

    #[test]
    fn clear_resets_a_finished_thread() {
        let mut config = Configuration::new(Flags::default());
        let id = config.spawn();
        config.invoke(id, const_func(7), vec![]);
        config.eval(id, &mut ConstExternals).unwrap();
        config.clear(id);
        assert!(matches!(config.status(id), ThreadStatus::Result(values) if values.is_empty()));
    }
}
