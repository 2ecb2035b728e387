//! The administrative reduction engine: `step_thread` pops one
//! administrative instruction off a thread's innermost activation and
//! reduces it, mutating the thread's control stack and value stacks in
//! place.
//!
//! Branch and return unwinding is resolved in a single `step_thread` call
//! by popping the explicit activation stack directly, rather than
//! bubbling a `Breaking`/`Returning` marker one `Label` at a time through
//! the instruction stream. Both describe the same observable reduction;
//! this crate takes the direct-pop implementation because it is the
//! natural shape for a `Vec`-backed control stack.

use crate::admin::AdminInstr;
use crate::error::{Error, NumericError, TrapCode};
use crate::externals::{Externals, RuntimeArgs};
use crate::func::FuncInstance;
use crate::instr::{AtomicRmwOp, Instr, Signedness};
use crate::memory::MemoryRef;
use crate::nan_preserving_float::{F32, F64};
use crate::numeric::{ArithmeticOps, ExtendInto, Float, Integer, TransmuteInto, TryTruncateInto, WrapInto};
use crate::thread::{Activation, ControlKind, Frame, Thread, ThreadStatus};
use crate::value::{Ref, Value};
use std::rc::Rc;

/// Threshold below which a `memory.atomic.wait` with a matching value
/// times out immediately instead of suspending (§5: "Cancellation and
/// timeouts"). The core has no wall-clock; this only distinguishes the
/// degenerate zero-ish-timeout case named in the spec from an actual
/// suspend.
const TIMEOUT_EPSILON: i64 = 1_000_000;

/// What the scheduler must do after one `step_thread` call.
pub enum StepOutcome {
    /// Nothing cross-thread needed; the scheduler may step this thread
    /// again (or any other) next.
    Continue,
    /// The thread suspended on `memory.atomic.wait`; `thread.status` is
    /// already `Suspended` and `thread.suspended_on` already set.
    Wait,
    /// The thread executed `memory.atomic.notify`; the scheduler must scan
    /// sibling threads waiting on `memory`/`address`, wake up to
    /// `max_count` of them, and call [`finish_notify`] with the number it
    /// actually woke.
    Notify { memory: MemoryRef, address: u64, max_count: u32 },
}

/// Resumes a thread that was suspended on `memory.atomic.wait`, pushing
/// the outcome code (`0` = woken by notify, `1` = not-equal, `2` =
/// timed-out) onto its now-current activation.
pub fn finish_wait(thread: &mut Thread, result_code: i32) {
    thread.suspended_on = None;
    thread.status = ThreadStatus::Running;
    if let Some(act) = thread.current() {
        act.code.stack.push(Value::I32(result_code));
    }
}

/// Completes a `memory.atomic.notify` step, pushing the number of threads
/// actually woken onto the notifying thread's stack.
pub fn finish_notify(thread: &mut Thread, woken_count: u32) {
    if let Some(act) = thread.current() {
        act.code.stack.push(Value::I32(woken_count as i32));
    }
}

/// Pops one administrative instruction and reduces it, advancing `thread`
/// by a single step. Leaves `thread.status` as `Result`/`Trap` when the
/// thread has finished, and pushes a new `Activation`/pops the finished
/// one as control flow requires.
pub fn step_thread(thread: &mut Thread, externals: &mut dyn Externals) -> Result<StepOutcome, Error> {
    loop {
        let Some(act) = thread.activations.last_mut() else {
            thread.status = ThreadStatus::Result(Vec::new());
            return Ok(StepOutcome::Continue);
        };

        let Some(instr) = act.code.pop_front() else {
            // Activation finished normally: fold its results into the
            // enclosing activation (or finish the thread, if this was the
            // outermost call frame).
            let finished = thread.activations.pop().unwrap();
            let arity = match &finished.kind {
                ControlKind::Label { arity, .. } => *arity,
                ControlKind::Call { arity, .. } => *arity,
            };
            let mut results = finished.code.stack;
            let drain_from = results.len().saturating_sub(arity);
            let results: Vec<Value> = results.split_off(drain_from);
            match thread.activations.last_mut() {
                Some(outer) => outer.code.stack.extend(results),
                None => thread.status = ThreadStatus::Result(results),
            }
            return Ok(StepOutcome::Continue);
        };

        match instr {
            AdminInstr::Invoke(func) => {
                invoke(thread, &func, externals)?;
            }
            AdminInstr::Plain(instr) => match step_plain(thread, instr, externals)? {
                Some(outcome) => return Ok(outcome),
                None => {}
            },
        }

        if let ThreadStatus::Trap(_) = &thread.status {
            return Ok(StepOutcome::Continue);
        }
    }
}

/// Branches out of `depth` enclosing labels (`0` = innermost), carrying
/// the top `arity` values of the label actually targeted. Re-enters the
/// label's own start for a loop target, otherwise resumes just past it.
fn branch(thread: &mut Thread, depth: u32) {
    // Each label owns a separate operand stack (`enter_label` starts a new
    // one from just its block params), so the values `Br`/`BrIf` leaves
    // behind are only visible on the activation they executed in. Take
    // that whole stack once up front and carry it along as intermediate
    // labels are unwound, truncating to the target's arity only once we
    // reach it — an in-between pop must not just discard it.
    let mut vs = std::mem::take(&mut thread.current().unwrap().code.stack);
    let mut remaining = depth;
    loop {
        let act = thread.activations.last().expect("br targets an enclosing label");
        match &act.kind {
            ControlKind::Call { .. } => unreachable!("br cannot cross a call frame boundary"),
            ControlKind::Label { arity, loop_body } => {
                if remaining == 0 {
                    let arity = *arity;
                    let loop_body = loop_body.clone();
                    thread.activations.pop();
                    let drain_from = vs.len().saturating_sub(arity);
                    let carried = vs.split_off(drain_from);
                    match loop_body {
                        Some(body) => {
                            let mut code = crate::admin::Code::from_instrs(body.iter().cloned());
                            code.stack = carried;
                            thread.activations.push(Activation {
                                kind: ControlKind::Label {
                                    arity,
                                    loop_body: Some(body),
                                },
                                code,
                            });
                        }
                        None => {
                            let outer = thread.activations.last_mut().expect("label has an enclosing frame");
                            outer.code.stack.extend(carried);
                        }
                    }
                    return;
                }
                remaining -= 1;
                thread.activations.pop();
            }
        }
    }
}

/// Returns from the innermost call frame, carrying its top `arity` values
/// out to the caller (or finishing the thread, for the outermost frame).
fn do_return(thread: &mut Thread) {
    // Same reasoning as `branch`: the values `Return` leaves behind live on
    // whichever label's stack it executed in, not the enclosing call
    // frame's own (otherwise empty) stack.
    let mut vs = std::mem::take(&mut thread.current().unwrap().code.stack);
    loop {
        let act = thread.activations.last().expect("return targets an enclosing frame");
        if let ControlKind::Call { arity, .. } = &act.kind {
            let arity = *arity;
            thread.activations.pop();
            let drain_from = vs.len().saturating_sub(arity);
            let results = vs.split_off(drain_from);
            match thread.activations.last_mut() {
                Some(outer) => outer.code.stack.extend(results),
                None => thread.status = ThreadStatus::Result(results),
            }
            return;
        }
        thread.activations.pop();
    }
}

fn current_frame(thread: &Thread) -> Frame {
    for act in thread.activations.iter().rev() {
        if let ControlKind::Call { frame, .. } = &act.kind {
            return frame.clone();
        }
    }
    crate::error::crash("no enclosing call frame")
}

fn push(thread: &mut Thread, value: Value) {
    thread.current().unwrap().code.stack.push(value);
}

fn pop(thread: &mut Thread) -> Value {
    thread
        .current()
        .unwrap()
        .code
        .stack
        .pop()
        .unwrap_or_else(|| crate::error::crash("operand stack underflow"))
}

fn invoke(thread: &mut Thread, func: &crate::func::FuncRef, externals: &mut dyn Externals) -> Result<(), Error> {
    if thread.budget == 0 {
        set_trap(thread, TrapCode::StackOverflow);
        return Ok(());
    }
    thread.budget -= 1;
    let arity = func.ty().results().len();
    let nparams = func.ty().params().len();
    let mut args = {
        let top = thread.current().unwrap();
        let drain_from = top.code.stack.len().saturating_sub(nparams);
        top.code.stack.split_off(drain_from)
    };
    match &**func.rc() {
        FuncInstance::Ast { module, body, .. } => {
            let module = module.upgrade().unwrap_or_else(|| crate::error::crash("dangling module back-reference"));
            let mut locals = Vec::with_capacity(nparams + body.locals.len());
            locals.append(&mut args);
            locals.extend(body.locals.iter().map(|ty| Value::default(*ty)));
            let frame = Frame::new(module, locals);
            let code = crate::admin::Code::from_instrs(body.instrs.iter().cloned());
            thread.activations.push(Activation {
                kind: ControlKind::Call { arity, frame },
                code,
            });
        }
        FuncInstance::Host { host_index, .. } => {
            let results = externals.invoke_index(*host_index, RuntimeArgs::new(&args))?;
            thread.current().unwrap().code.stack.extend(results);
        }
    }
    Ok(())
}

fn set_trap(thread: &mut Thread, code: TrapCode) {
    thread.status = ThreadStatus::Trap(code);
}

macro_rules! binop_int {
    ($thread:expr, $variant:ident, $op:ident) => {{
        let b = pop($thread);
        let a = pop($thread);
        match (a, b) {
            (Value::$variant(a), Value::$variant(b)) => push($thread, Value::$variant(a.$op(b))),
            _ => crate::error::crash("type mismatch in integer binop"),
        }
    }};
}

macro_rules! binop_int_fallible {
    ($thread:expr, $variant:ident, $op:ident) => {{
        let b = pop($thread);
        let a = pop($thread);
        match (a, b) {
            (Value::$variant(a), Value::$variant(b)) => match a.$op(b) {
                Ok(r) => push($thread, Value::$variant(r)),
                Err(e) => {
                    set_trap($thread, TrapCode::from(e));
                    return Ok(None);
                }
            },
            _ => crate::error::crash("type mismatch in integer binop"),
        }
    }};
}

macro_rules! binop_float {
    ($thread:expr, $variant:ident, $op:ident) => {{
        let b = pop($thread);
        let a = pop($thread);
        match (a, b) {
            (Value::$variant(a), Value::$variant(b)) => push($thread, Value::$variant(a.$op(b))),
            _ => crate::error::crash("type mismatch in float binop"),
        }
    }};
}

macro_rules! unop_float {
    ($thread:expr, $variant:ident, $op:ident) => {{
        let a = pop($thread);
        match a {
            Value::$variant(a) => push($thread, Value::$variant(a.$op())),
            _ => crate::error::crash("type mismatch in float unop"),
        }
    }};
}

macro_rules! cmp_op {
    ($thread:expr, $variant:ident, $cmp:expr) => {{
        let b = pop($thread);
        let a = pop($thread);
        match (a, b) {
            (Value::$variant(a), Value::$variant(b)) => push($thread, Value::from(($cmp)(a, b))),
            _ => crate::error::crash("type mismatch in comparison"),
        }
    }};
}

fn step_plain(thread: &mut Thread, instr: Instr, externals: &mut dyn Externals) -> Result<Option<StepOutcome>, Error> {
    use Instr::*;
    match instr {
        Unreachable => {
            set_trap(thread, TrapCode::Unreachable);
        }
        Nop | AtomicFence => {}
        Block(bt, body) => {
            let arity = block_arity(thread, &bt);
            let params = block_params(thread, &bt);
            enter_label(thread, arity, params, body, None);
        }
        Loop(bt, body) => {
            // A loop's own branch target is its start, so re-entering it
            // needs its parameter count back, not its result count.
            let params = block_params(thread, &bt);
            enter_label(thread, params, params, body.clone(), Some(body));
        }
        If(bt, then_body, else_body) => {
            let cond = pop(thread).unwrap_i32();
            let arity = block_arity(thread, &bt);
            let params = block_params(thread, &bt);
            let body = if cond != 0 { then_body } else { else_body };
            enter_label(thread, arity, params, body, None);
        }
        Br(depth) => branch(thread, depth),
        BrIf(depth) => {
            let cond = pop(thread).unwrap_i32();
            if cond != 0 {
                branch(thread, depth);
            }
        }
        BrTable(targets, default) => {
            let idx = pop(thread).unwrap_i32();
            let depth = targets.get(idx as usize).copied().unwrap_or(default);
            branch(thread, depth);
        }
        Return => do_return(thread),
        Call(idx) => {
            let func = current_frame(thread).module.funcs[idx as usize].clone();
            invoke(thread, &func, externals)?;
        }
        CallIndirect(type_idx, table_idx) => {
            let frame = current_frame(thread);
            let table = frame.module.tables[table_idx as usize].clone();
            let idx = pop(thread).unwrap_i32();
            if idx < 0 {
                set_trap(thread, TrapCode::UndefinedElement(idx as u32));
                return Ok(None);
            }
            let elem = match table.get(idx as u32) {
                Ok(elem) => elem,
                Err(_) => {
                    set_trap(thread, TrapCode::UndefinedElement(idx as u32));
                    return Ok(None);
                }
            };
            let func = match elem {
                Ref::Func(f) => f,
                Ref::Null(_) => {
                    set_trap(thread, TrapCode::UninitializedElement(idx as u32));
                    return Ok(None);
                }
                Ref::Extern(_) => crate::error::crash("call_indirect through externref table"),
            };
            let expected = &frame.module.types[type_idx as usize];
            if func.ty() != expected {
                set_trap(thread, TrapCode::IndirectCallTypeMismatch);
                return Ok(None);
            }
            invoke(thread, &func, externals)?;
        }

        LocalGet(idx) => push(thread, current_frame(thread).get_local(idx)),
        LocalSet(idx) => {
            let v = pop(thread);
            current_frame(thread).set_local(idx, v);
        }
        LocalTee(idx) => {
            let v = pop(thread);
            current_frame(thread).set_local(idx, v.clone());
            push(thread, v);
        }
        GlobalGet(idx) => push(thread, current_frame(thread).module.globals[idx as usize].get()),
        GlobalSet(idx) => {
            let v = pop(thread);
            current_frame(thread).module.globals[idx as usize].set(v)?;
        }

        Drop => {
            pop(thread);
        }
        Select => {
            let cond = pop(thread).unwrap_i32();
            let b = pop(thread);
            let a = pop(thread);
            push(thread, if cond != 0 { a } else { b });
        }

        RefNull(ty) => push(thread, Value::Ref(Ref::Null(ty))),
        RefIsNull => {
            let v = pop(thread);
            push(thread, Value::from(v.unwrap_ref().is_null()));
        }
        RefFunc(idx) => {
            let func = current_frame(thread).module.funcs[idx as usize].clone();
            push(thread, Value::Ref(Ref::Func(func)));
        }

        TableGet(idx) => {
            let table = current_frame(thread).module.tables[idx as usize].clone();
            let i = pop(thread).unwrap_i32();
            if i < 0 {
                set_trap(thread, TrapCode::TableOutOfBounds);
                return Ok(None);
            }
            match table.get(i as u32) {
                Ok(v) => push(thread, Value::Ref(v)),
                Err(_) => set_trap(thread, TrapCode::TableOutOfBounds),
            }
        }
        TableSet(idx) => {
            let table = current_frame(thread).module.tables[idx as usize].clone();
            let v = pop(thread).unwrap_ref().clone();
            let i = pop(thread).unwrap_i32();
            if i < 0 || table.set(i as u32, v).is_err() {
                set_trap(thread, TrapCode::TableOutOfBounds);
            }
        }
        TableSize(idx) => push(thread, Value::I32(current_frame(thread).module.tables[idx as usize].size() as i32)),
        TableGrow(idx) => {
            let table = current_frame(thread).module.tables[idx as usize].clone();
            let delta = pop(thread).unwrap_i32();
            let init = pop(thread).unwrap_ref().clone();
            let result = if delta < 0 {
                None
            } else {
                table.grow(delta as u32, init)
            };
            push(thread, Value::I32(result.map(|p| p as i32).unwrap_or(-1)));
        }
        TableFill(idx) => {
            let table = current_frame(thread).module.tables[idx as usize].clone();
            let n = pop(thread).unwrap_i32();
            let value = pop(thread).unwrap_ref().clone();
            let i = pop(thread).unwrap_i32();
            // n = 0 never traps, even against endpoints that would trap for n = 1.
            if n != 0 && (n < 0 || i < 0 || table.checked_bounds(i as u32, n as u32).is_err()) {
                set_trap(thread, TrapCode::TableOutOfBounds);
                return Ok(None);
            }
            if n > 0 {
                if let Err(_) = table.fill_one(i as u32, value.clone()) {
                    set_trap(thread, TrapCode::TableOutOfBounds);
                    return Ok(None);
                }
                push(thread, Value::I32(i + 1));
                push(thread, Value::Ref(value));
                push(thread, Value::I32(n - 1));
                thread.current().unwrap().code.push_front(AdminInstr::Plain(TableFill(idx)));
            }
        }
        TableCopy { dst, src } => {
            let dst_table = current_frame(thread).module.tables[dst as usize].clone();
            let src_table = current_frame(thread).module.tables[src as usize].clone();
            let n = pop(thread).unwrap_i32();
            let s = pop(thread).unwrap_i32();
            let d = pop(thread).unwrap_i32();
            // n = 0 never traps, even against endpoints that would trap for n = 1.
            if n != 0
                && (n < 0
                    || d < 0
                    || s < 0
                    || dst_table.checked_bounds(d as u32, n as u32).is_err()
                    || src_table.checked_bounds(s as u32, n as u32).is_err())
            {
                set_trap(thread, TrapCode::TableOutOfBounds);
                return Ok(None);
            }
            if n > 0 {
                step_table_copy_one(thread, &dst_table, &src_table, d as u32, s as u32, n as u32, dst, src);
            }
        }
        TableInit { table, elem } => {
            let table_ref = current_frame(thread).module.tables[table as usize].clone();
            let n = pop(thread).unwrap_i32();
            let s = pop(thread).unwrap_i32();
            let d = pop(thread).unwrap_i32();
            let segment_len = current_frame(thread).module.elements[elem as usize].len();
            // n = 0 never traps, even against endpoints that would trap for n = 1.
            if n != 0
                && (n < 0
                    || s < 0
                    || d < 0
                    || (s as u32).saturating_add(n as u32) > segment_len
                    || table_ref.checked_bounds(d as u32, n as u32).is_err())
            {
                set_trap(thread, TrapCode::TableOutOfBounds);
                return Ok(None);
            }
            if n > 0 {
                let item = current_frame(thread).module.elements[elem as usize].read_one(s as u32)?;
                table_ref.set(d as u32, item)?;
                push(thread, Value::I32(d + 1));
                push(thread, Value::I32(s + 1));
                push(thread, Value::I32(n - 1));
                thread.current().unwrap().code.push_front(AdminInstr::Plain(TableInit { table, elem }));
            }
        }
        ElemDrop(idx) => current_frame(thread).module.elements[idx as usize].drop_contents(),

        MemorySize => push(thread, Value::I32(current_frame(thread).module.memories[0].current_pages() as i32)),
        MemoryGrow => {
            let memory = current_frame(thread).module.memories[0].clone();
            let delta = pop(thread).unwrap_i32();
            let result = if delta < 0 { None } else { memory.grow(delta as u32) };
            push(thread, Value::I32(result.map(|p| p as i32).unwrap_or(-1)));
        }
        MemoryFill => {
            let memory = current_frame(thread).module.memories[0].clone();
            let n = pop(thread).unwrap_i32();
            let value = pop(thread).unwrap_i32();
            let d = pop(thread).unwrap_i32();
            // n = 0 never traps, even against endpoints that would trap for n = 1.
            if n != 0 && (n < 0 || d < 0 || memory.checked_bounds(d as u32, n as u32).is_err()) {
                set_trap(thread, TrapCode::MemoryOutOfBounds);
                return Ok(None);
            }
            if n > 0 {
                memory.fill_one(d as u32, value as u8)?;
                push(thread, Value::I32(d + 1));
                push(thread, Value::I32(value));
                push(thread, Value::I32(n - 1));
                thread.current().unwrap().code.push_front(AdminInstr::Plain(MemoryFill));
            }
        }
        MemoryCopy => {
            let memory = current_frame(thread).module.memories[0].clone();
            let n = pop(thread).unwrap_i32();
            let s = pop(thread).unwrap_i32();
            let d = pop(thread).unwrap_i32();
            // n = 0 never traps, even against endpoints that would trap for n = 1.
            if n != 0
                && (n < 0
                    || s < 0
                    || d < 0
                    || memory.checked_bounds(d as u32, n as u32).is_err()
                    || memory.checked_bounds(s as u32, n as u32).is_err())
            {
                set_trap(thread, TrapCode::MemoryOutOfBounds);
                return Ok(None);
            }
            if n > 0 {
                step_memory_copy_one(thread, &memory, d as u32, s as u32, n as u32);
            }
        }
        MemoryInit(idx) => {
            let memory = current_frame(thread).module.memories[0].clone();
            let n = pop(thread).unwrap_i32();
            let s = pop(thread).unwrap_i32();
            let d = pop(thread).unwrap_i32();
            let segment_len = current_frame(thread).module.data[idx as usize].len();
            // n = 0 never traps, even against endpoints that would trap for n = 1.
            if n != 0
                && (n < 0
                    || s < 0
                    || d < 0
                    || (s as u32).saturating_add(n as u32) > segment_len
                    || memory.checked_bounds(d as u32, n as u32).is_err())
            {
                set_trap(thread, TrapCode::MemoryOutOfBounds);
                return Ok(None);
            }
            if n > 0 {
                let byte = current_frame(thread).module.data[idx as usize].read_one(s as u32)?;
                memory.write(d as u32, &[byte])?;
                push(thread, Value::I32(d + 1));
                push(thread, Value::I32(s + 1));
                push(thread, Value::I32(n - 1));
                thread.current().unwrap().code.push_front(AdminInstr::Plain(MemoryInit(idx)));
            }
        }
        DataDrop(idx) => current_frame(thread).module.data[idx as usize].drop_contents(),

        I32Const(v) => push(thread, Value::I32(v)),
        I64Const(v) => push(thread, Value::I64(v)),
        F32Const(v) => push(thread, Value::F32(v)),
        F64Const(v) => push(thread, Value::F64(v)),

        I32Eqz => {
            let a = pop(thread).unwrap_i32();
            push(thread, Value::from(a == 0));
        }
        I32Eq => cmp_op!(thread, I32, |a: i32, b: i32| a == b),
        I32Ne => cmp_op!(thread, I32, |a: i32, b: i32| a != b),
        I32LtS => cmp_op!(thread, I32, |a: i32, b: i32| a < b),
        I32LtU => cmp_op!(thread, I32, |a: i32, b: i32| (a as u32) < (b as u32)),
        I32GtS => cmp_op!(thread, I32, |a: i32, b: i32| a > b),
        I32GtU => cmp_op!(thread, I32, |a: i32, b: i32| (a as u32) > (b as u32)),
        I32LeS => cmp_op!(thread, I32, |a: i32, b: i32| a <= b),
        I32LeU => cmp_op!(thread, I32, |a: i32, b: i32| (a as u32) <= (b as u32)),
        I32GeS => cmp_op!(thread, I32, |a: i32, b: i32| a >= b),
        I32GeU => cmp_op!(thread, I32, |a: i32, b: i32| (a as u32) >= (b as u32)),
        I32Clz => {
            let a = pop(thread).unwrap_i32();
            push(thread, Value::I32(a.leading_zeros() as i32));
        }
        I32Ctz => {
            let a = pop(thread).unwrap_i32();
            push(thread, Value::I32(a.trailing_zeros() as i32));
        }
        I32Popcnt => {
            let a = pop(thread).unwrap_i32();
            push(thread, Value::I32(a.count_ones() as i32));
        }
        I32Add => binop_int!(thread, I32, add),
        I32Sub => binop_int!(thread, I32, sub),
        I32Mul => binop_int!(thread, I32, mul),
        I32DivS => binop_int_fallible!(thread, I32, div),
        I32DivU => {
            let b = pop(thread).unwrap_i32() as u32;
            let a = pop(thread).unwrap_i32() as u32;
            match a.div(b) {
                Ok(r) => push(thread, Value::I32(r as i32)),
                Err(e) => set_trap(thread, TrapCode::from(e)),
            }
        }
        I32RemS => binop_int_fallible!(thread, I32, rem),
        I32RemU => {
            let b = pop(thread).unwrap_i32() as u32;
            let a = pop(thread).unwrap_i32() as u32;
            match a.rem(b) {
                Ok(r) => push(thread, Value::I32(r as i32)),
                Err(e) => set_trap(thread, TrapCode::from(e)),
            }
        }
        I32And => {
            let b = pop(thread).unwrap_i32();
            let a = pop(thread).unwrap_i32();
            push(thread, Value::I32(a & b));
        }
        I32Or => {
            let b = pop(thread).unwrap_i32();
            let a = pop(thread).unwrap_i32();
            push(thread, Value::I32(a | b));
        }
        I32Xor => {
            let b = pop(thread).unwrap_i32();
            let a = pop(thread).unwrap_i32();
            push(thread, Value::I32(a ^ b));
        }
        I32Shl => {
            let b = pop(thread).unwrap_i32();
            let a = pop(thread).unwrap_i32();
            push(thread, Value::I32(a.wrapping_shl(b as u32 % 32)));
        }
        I32ShrS => {
            let b = pop(thread).unwrap_i32();
            let a = pop(thread).unwrap_i32();
            push(thread, Value::I32(a.wrapping_shr(b as u32 % 32)));
        }
        I32ShrU => {
            let b = pop(thread).unwrap_i32();
            let a = pop(thread).unwrap_i32() as u32;
            push(thread, Value::I32(a.wrapping_shr(b as u32 % 32) as i32));
        }
        I32Rotl => binop_int!(thread, I32, rotl),
        I32Rotr => binop_int!(thread, I32, rotr),

        I64Eqz => {
            let a = pop(thread).unwrap_i64();
            push(thread, Value::from(a == 0));
        }
        I64Eq => cmp_op!(thread, I64, |a: i64, b: i64| a == b),
        I64Ne => cmp_op!(thread, I64, |a: i64, b: i64| a != b),
        I64LtS => cmp_op!(thread, I64, |a: i64, b: i64| a < b),
        I64LtU => cmp_op!(thread, I64, |a: i64, b: i64| (a as u64) < (b as u64)),
        I64GtS => cmp_op!(thread, I64, |a: i64, b: i64| a > b),
        I64GtU => cmp_op!(thread, I64, |a: i64, b: i64| (a as u64) > (b as u64)),
        I64LeS => cmp_op!(thread, I64, |a: i64, b: i64| a <= b),
        I64LeU => cmp_op!(thread, I64, |a: i64, b: i64| (a as u64) <= (b as u64)),
        I64GeS => cmp_op!(thread, I64, |a: i64, b: i64| a >= b),
        I64GeU => cmp_op!(thread, I64, |a: i64, b: i64| (a as u64) >= (b as u64)),
        I64Clz => {
            let a = pop(thread).unwrap_i64();
            push(thread, Value::I64(a.leading_zeros() as i64));
        }
        I64Ctz => {
            let a = pop(thread).unwrap_i64();
            push(thread, Value::I64(a.trailing_zeros() as i64));
        }
        I64Popcnt => {
            let a = pop(thread).unwrap_i64();
            push(thread, Value::I64(a.count_ones() as i64));
        }
        I64Add => binop_int!(thread, I64, add),
        I64Sub => binop_int!(thread, I64, sub),
        I64Mul => binop_int!(thread, I64, mul),
        I64DivS => binop_int_fallible!(thread, I64, div),
        I64DivU => {
            let b = pop(thread).unwrap_i64() as u64;
            let a = pop(thread).unwrap_i64() as u64;
            match a.div(b) {
                Ok(r) => push(thread, Value::I64(r as i64)),
                Err(e) => set_trap(thread, TrapCode::from(e)),
            }
        }
        I64RemS => binop_int_fallible!(thread, I64, rem),
        I64RemU => {
            let b = pop(thread).unwrap_i64() as u64;
            let a = pop(thread).unwrap_i64() as u64;
            match a.rem(b) {
                Ok(r) => push(thread, Value::I64(r as i64)),
                Err(e) => set_trap(thread, TrapCode::from(e)),
            }
        }
        I64And => {
            let b = pop(thread).unwrap_i64();
            let a = pop(thread).unwrap_i64();
            push(thread, Value::I64(a & b));
        }
        I64Or => {
            let b = pop(thread).unwrap_i64();
            let a = pop(thread).unwrap_i64();
            push(thread, Value::I64(a | b));
        }
        I64Xor => {
            let b = pop(thread).unwrap_i64();
            let a = pop(thread).unwrap_i64();
            push(thread, Value::I64(a ^ b));
        }
        I64Shl => {
            let b = pop(thread).unwrap_i64();
            let a = pop(thread).unwrap_i64();
            push(thread, Value::I64(a.wrapping_shl(b as u32 % 64)));
        }
        I64ShrS => {
            let b = pop(thread).unwrap_i64();
            let a = pop(thread).unwrap_i64();
            push(thread, Value::I64(a.wrapping_shr(b as u32 % 64)));
        }
        I64ShrU => {
            let b = pop(thread).unwrap_i64();
            let a = pop(thread).unwrap_i64() as u64;
            push(thread, Value::I64(a.wrapping_shr(b as u32 % 64) as i64));
        }
        I64Rotl => binop_int!(thread, I64, rotl),
        I64Rotr => binop_int!(thread, I64, rotr),

        F32Eq => cmp_op!(thread, F32, |a: F32, b: F32| a == b),
        F32Ne => cmp_op!(thread, F32, |a: F32, b: F32| a != b),
        F32Lt => cmp_op!(thread, F32, |a: F32, b: F32| a < b),
        F32Gt => cmp_op!(thread, F32, |a: F32, b: F32| a > b),
        F32Le => cmp_op!(thread, F32, |a: F32, b: F32| a <= b),
        F32Ge => cmp_op!(thread, F32, |a: F32, b: F32| a >= b),
        F32Abs => unop_float!(thread, F32, abs),
        F32Neg => {
            let a = pop(thread);
            match a {
                Value::F32(a) => push(thread, Value::F32(-a)),
                _ => crate::error::crash("type mismatch"),
            }
        }
        F32Ceil => unop_float!(thread, F32, ceil),
        F32Floor => unop_float!(thread, F32, floor),
        F32Trunc => unop_float!(thread, F32, trunc),
        F32Nearest => unop_float!(thread, F32, nearest),
        F32Sqrt => unop_float!(thread, F32, sqrt),
        F32Add => binop_float!(thread, F32, add),
        F32Sub => binop_float!(thread, F32, sub),
        F32Mul => binop_float!(thread, F32, mul),
        F32Div => {
            let b = pop(thread);
            let a = pop(thread);
            match (a, b) {
                (Value::F32(a), Value::F32(b)) => push(thread, Value::F32(a.div(b).unwrap())),
                _ => crate::error::crash("type mismatch"),
            }
        }
        F32Min => binop_float!(thread, F32, min),
        F32Max => binop_float!(thread, F32, max),
        F32Copysign => binop_float!(thread, F32, copysign),

        F64Eq => cmp_op!(thread, F64, |a: F64, b: F64| a == b),
        F64Ne => cmp_op!(thread, F64, |a: F64, b: F64| a != b),
        F64Lt => cmp_op!(thread, F64, |a: F64, b: F64| a < b),
        F64Gt => cmp_op!(thread, F64, |a: F64, b: F64| a > b),
        F64Le => cmp_op!(thread, F64, |a: F64, b: F64| a <= b),
        F64Ge => cmp_op!(thread, F64, |a: F64, b: F64| a >= b),
        F64Abs => unop_float!(thread, F64, abs),
        F64Neg => {
            let a = pop(thread);
            match a {
                Value::F64(a) => push(thread, Value::F64(-a)),
                _ => crate::error::crash("type mismatch"),
            }
        }
        F64Ceil => unop_float!(thread, F64, ceil),
        F64Floor => unop_float!(thread, F64, floor),
        F64Trunc => unop_float!(thread, F64, trunc),
        F64Nearest => unop_float!(thread, F64, nearest),
        F64Sqrt => unop_float!(thread, F64, sqrt),
        F64Add => binop_float!(thread, F64, add),
        F64Sub => binop_float!(thread, F64, sub),
        F64Mul => binop_float!(thread, F64, mul),
        F64Div => {
            let b = pop(thread);
            let a = pop(thread);
            match (a, b) {
                (Value::F64(a), Value::F64(b)) => push(thread, Value::F64(a.div(b).unwrap())),
                _ => crate::error::crash("type mismatch"),
            }
        }
        F64Min => binop_float!(thread, F64, min),
        F64Max => binop_float!(thread, F64, max),
        F64Copysign => binop_float!(thread, F64, copysign),

        I32WrapI64 => {
            let a = pop(thread).unwrap_i64();
            push(thread, Value::I32(WrapInto::<i32>::wrap_into(a)));
        }
        I64ExtendI32S => {
            let a = pop(thread).unwrap_i32();
            push(thread, Value::I64(ExtendInto::<i64>::extend_into(a)));
        }
        I64ExtendI32U => {
            let a = pop(thread).unwrap_i32() as u32;
            push(thread, Value::I64(ExtendInto::<u64>::extend_into(a) as i64));
        }
        I32Extend8S => {
            let a = pop(thread).unwrap_i32();
            push(thread, Value::I32(ExtendInto::<i32>::extend_into(a as i8)));
        }
        I32Extend16S => {
            let a = pop(thread).unwrap_i32();
            push(thread, Value::I32(ExtendInto::<i32>::extend_into(a as i16)));
        }
        I64Extend8S => {
            let a = pop(thread).unwrap_i64();
            push(thread, Value::I64(ExtendInto::<i64>::extend_into(a as i8)));
        }
        I64Extend16S => {
            let a = pop(thread).unwrap_i64();
            push(thread, Value::I64(ExtendInto::<i64>::extend_into(a as i16)));
        }

        I32TruncF32S => trunc_to_int(thread, |f: F32| TryTruncateInto::<i32, NumericError>::try_truncate_into(f), Value::I32)?,
        I32TruncF32U => trunc_to_int(thread, |f: F32| TryTruncateInto::<u32, NumericError>::try_truncate_into(f), |v| Value::I32(v as i32))?,
        I32TruncF64S => trunc_to_int(thread, |f: F64| TryTruncateInto::<i32, NumericError>::try_truncate_into(f), Value::I32)?,
        I32TruncF64U => trunc_to_int(thread, |f: F64| TryTruncateInto::<u32, NumericError>::try_truncate_into(f), |v| Value::I32(v as i32))?,
        I64TruncF32S => trunc_to_int(thread, |f: F32| TryTruncateInto::<i64, NumericError>::try_truncate_into(f), Value::I64)?,
        I64TruncF32U => trunc_to_int(thread, |f: F32| TryTruncateInto::<u64, NumericError>::try_truncate_into(f), |v| Value::I64(v as i64))?,
        I64TruncF64S => trunc_to_int(thread, |f: F64| TryTruncateInto::<i64, NumericError>::try_truncate_into(f), Value::I64)?,
        I64TruncF64U => trunc_to_int(thread, |f: F64| TryTruncateInto::<u64, NumericError>::try_truncate_into(f), |v| Value::I64(v as i64))?,

        F32ConvertI32S => {
            let a = pop(thread).unwrap_i32();
            push(thread, Value::F32(F32::from_float(a as f32)));
        }
        F32ConvertI32U => {
            let a = pop(thread).unwrap_i32() as u32;
            push(thread, Value::F32(F32::from_float(a as f32)));
        }
        F32ConvertI64S => {
            let a = pop(thread).unwrap_i64();
            push(thread, Value::F32(F32::from_float(a as f32)));
        }
        F32ConvertI64U => {
            let a = pop(thread).unwrap_i64() as u64;
            push(thread, Value::F32(F32::from_float(a as f32)));
        }
        F32DemoteF64 => {
            let a = pop(thread);
            match a {
                Value::F64(a) => push(thread, Value::F32(F32::from_float(a.to_float() as f32))),
                _ => crate::error::crash("type mismatch"),
            }
        }
        F64ConvertI32S => {
            let a = pop(thread).unwrap_i32();
            push(thread, Value::F64(F64::from_float(a as f64)));
        }
        F64ConvertI32U => {
            let a = pop(thread).unwrap_i32() as u32;
            push(thread, Value::F64(F64::from_float(a as f64)));
        }
        F64ConvertI64S => {
            let a = pop(thread).unwrap_i64();
            push(thread, Value::F64(F64::from_float(a as f64)));
        }
        F64ConvertI64U => {
            let a = pop(thread).unwrap_i64() as u64;
            push(thread, Value::F64(F64::from_float(a as f64)));
        }
        F64PromoteF32 => {
            let a = pop(thread);
            match a {
                Value::F32(a) => push(thread, Value::F64(F64::from_float(a.to_float() as f64))),
                _ => crate::error::crash("type mismatch"),
            }
        }
        I32ReinterpretF32 => {
            let a = pop(thread);
            match a {
                Value::F32(a) => push(thread, Value::I32(TransmuteInto::<i32>::transmute_into(a))),
                _ => crate::error::crash("type mismatch"),
            }
        }
        I64ReinterpretF64 => {
            let a = pop(thread);
            match a {
                Value::F64(a) => push(thread, Value::I64(TransmuteInto::<i64>::transmute_into(a))),
                _ => crate::error::crash("type mismatch"),
            }
        }
        F32ReinterpretI32 => {
            let a = pop(thread).unwrap_i32();
            push(thread, Value::F32(TransmuteInto::<F32>::transmute_into(a)));
        }
        F64ReinterpretI64 => {
            let a = pop(thread).unwrap_i64();
            push(thread, Value::F64(TransmuteInto::<F64>::transmute_into(a)));
        }

        I32Load(arg) => load_scalar::<4>(thread, arg, |b| i32::from_le_bytes(b))?,
        I64Load(arg) => load_scalar::<8>(thread, arg, |b| i64::from_le_bytes(b))?,
        F32Load(arg) => load_scalar::<4>(thread, arg, |b| F32::from_bits(u32::from_le_bytes(b)))?,
        F64Load(arg) => load_scalar::<8>(thread, arg, |b| F64::from_bits(u64::from_le_bytes(b)))?,
        I32Load8(sign, arg) => load_packed_i32::<1>(thread, arg, sign)?,
        I32Load16(sign, arg) => load_packed_i32::<2>(thread, arg, sign)?,
        I64Load8(sign, arg) => load_packed_i64::<1>(thread, arg, sign)?,
        I64Load16(sign, arg) => load_packed_i64::<2>(thread, arg, sign)?,
        I64Load32(sign, arg) => load_packed_i64::<4>(thread, arg, sign)?,
        I32Store(arg) => store_scalar(thread, arg, 4, |v| v.unwrap_i32() as u64 & 0xFFFF_FFFF)?,
        I64Store(arg) => store_scalar(thread, arg, 8, |v| v.unwrap_i64() as u64)?,
        F32Store(arg) => store_scalar(thread, arg, 4, |v| match v { Value::F32(f) => f.to_bits() as u64, _ => crate::error::crash("type mismatch") })?,
        F64Store(arg) => store_scalar(thread, arg, 8, |v| match v { Value::F64(f) => f.to_bits(), _ => crate::error::crash("type mismatch") })?,
        I32Store8(arg) => store_scalar(thread, arg, 1, |v| v.unwrap_i32() as u64 & 0xFF)?,
        I32Store16(arg) => store_scalar(thread, arg, 2, |v| v.unwrap_i32() as u64 & 0xFFFF)?,
        I64Store8(arg) => store_scalar(thread, arg, 1, |v| v.unwrap_i64() as u64 & 0xFF)?,
        I64Store16(arg) => store_scalar(thread, arg, 2, |v| v.unwrap_i64() as u64 & 0xFFFF)?,
        I64Store32(arg) => store_scalar(thread, arg, 4, |v| v.unwrap_i64() as u64 & 0xFFFF_FFFF)?,

        MemoryAtomicNotify(arg) => {
            let frame = current_frame(thread);
            let memory = frame.module.memories[0].clone();
            let count = pop(thread).unwrap_i32();
            let addr = pop(thread).effective_address(arg.offset);
            // The alignment/bounds check happens via a dummy load even though
            // the value is discarded (spec.md §9 Open Question 2) — it can
            // still trap.
            let _ = memory.atomic_load(addr, 4)?;
            if !memory.is_shared() {
                push(thread, Value::I32(0));
                return Ok(None);
            }
            let max_count = if count < 0 { u32::MAX } else { count as u32 };
            return Ok(Some(StepOutcome::Notify { memory, address: addr, max_count }));
        }
        MemoryAtomicWait32(arg) => {
            let frame = current_frame(thread);
            let memory = frame.module.memories[0].clone();
            if !memory.is_shared() {
                set_trap(thread, TrapCode::ExpectedSharedMemory);
                return Ok(None);
            }
            let timeout = pop(thread).unwrap_i64();
            let expected = pop(thread).unwrap_i32();
            let addr = pop(thread).effective_address(arg.offset);
            let current = memory.atomic_load(addr, 4)? as u32 as i32;
            if current != expected {
                push(thread, Value::I32(1));
                return Ok(None);
            }
            if (0..TIMEOUT_EPSILON).contains(&timeout) {
                push(thread, Value::I32(2));
                return Ok(None);
            }
            thread.status = ThreadStatus::Suspended;
            thread.suspended_on = Some((memory, addr));
            return Ok(Some(StepOutcome::Wait));
        }
        MemoryAtomicWait64(arg) => {
            let frame = current_frame(thread);
            let memory = frame.module.memories[0].clone();
            if !memory.is_shared() {
                set_trap(thread, TrapCode::ExpectedSharedMemory);
                return Ok(None);
            }
            let timeout = pop(thread).unwrap_i64();
            let expected = pop(thread).unwrap_i64();
            let addr = pop(thread).effective_address(arg.offset);
            let current = memory.atomic_load(addr, 8)? as i64;
            if current != expected {
                push(thread, Value::I32(1));
                return Ok(None);
            }
            if (0..TIMEOUT_EPSILON).contains(&timeout) {
                push(thread, Value::I32(2));
                return Ok(None);
            }
            thread.status = ThreadStatus::Suspended;
            thread.suspended_on = Some((memory, addr));
            return Ok(Some(StepOutcome::Wait));
        }

        I32AtomicLoad(arg) => atomic_load32(thread, arg, 4)?,
        I32AtomicLoad8U(arg) => atomic_load32(thread, arg, 1)?,
        I32AtomicLoad16U(arg) => atomic_load32(thread, arg, 2)?,
        I64AtomicLoad(arg) => atomic_load64(thread, arg, 8)?,
        I64AtomicLoad8U(arg) => atomic_load64(thread, arg, 1)?,
        I64AtomicLoad16U(arg) => atomic_load64(thread, arg, 2)?,
        I64AtomicLoad32U(arg) => atomic_load64(thread, arg, 4)?,
        I32AtomicStore(arg) => atomic_store(thread, arg, 4, |v| v.unwrap_i32() as u64)?,
        I32AtomicStore8(arg) => atomic_store(thread, arg, 1, |v| v.unwrap_i32() as u64 & 0xFF)?,
        I32AtomicStore16(arg) => atomic_store(thread, arg, 2, |v| v.unwrap_i32() as u64 & 0xFFFF)?,
        I64AtomicStore(arg) => atomic_store(thread, arg, 8, |v| v.unwrap_i64() as u64)?,
        I64AtomicStore8(arg) => atomic_store(thread, arg, 1, |v| v.unwrap_i64() as u64 & 0xFF)?,
        I64AtomicStore16(arg) => atomic_store(thread, arg, 2, |v| v.unwrap_i64() as u64 & 0xFFFF)?,
        I64AtomicStore32(arg) => atomic_store(thread, arg, 4, |v| v.unwrap_i64() as u64 & 0xFFFF_FFFF)?,

        I32AtomicRmw(op, arg) => atomic_rmw32(thread, arg, 4, op)?,
        I32AtomicRmw8U(op, arg) => atomic_rmw32(thread, arg, 1, op)?,
        I32AtomicRmw16U(op, arg) => atomic_rmw32(thread, arg, 2, op)?,
        I64AtomicRmw(op, arg) => atomic_rmw64(thread, arg, 8, op)?,
        I64AtomicRmw8U(op, arg) => atomic_rmw64(thread, arg, 1, op)?,
        I64AtomicRmw16U(op, arg) => atomic_rmw64(thread, arg, 2, op)?,
        I64AtomicRmw32U(op, arg) => atomic_rmw64(thread, arg, 4, op)?,

        I32AtomicRmwCmpxchg(arg) => atomic_cmpxchg32(thread, arg, 4)?,
        I32AtomicRmw8CmpxchgU(arg) => atomic_cmpxchg32(thread, arg, 1)?,
        I32AtomicRmw16CmpxchgU(arg) => atomic_cmpxchg32(thread, arg, 2)?,
        I64AtomicRmwCmpxchg(arg) => atomic_cmpxchg64(thread, arg, 8)?,
        I64AtomicRmw8CmpxchgU(arg) => atomic_cmpxchg64(thread, arg, 1)?,
        I64AtomicRmw16CmpxchgU(arg) => atomic_cmpxchg64(thread, arg, 2)?,
        I64AtomicRmw32CmpxchgU(arg) => atomic_cmpxchg64(thread, arg, 4)?,

        V128Const(v) => push(thread, Value::V128(v)),
        V128Load(arg) => {
            let frame = current_frame(thread);
            let memory = frame.module.memories[0].clone();
            let addr = pop(thread).effective_address(arg.offset);
            let bytes: [u8; 16] = memory.read_array(addr)?;
            push(thread, Value::V128(crate::value::V128::from_bytes(bytes)));
        }
        V128Store(arg) => {
            let frame = current_frame(thread);
            let memory = frame.module.memories[0].clone();
            let v = pop(thread);
            let addr = pop(thread).effective_address(arg.offset);
            let bytes = match v {
                Value::V128(v) => v.bytes(),
                _ => crate::error::crash("type mismatch"),
            };
            memory.write(addr, &bytes)?;
        }
        I8x16Splat => splat(thread, |v: i32| { let mut b = [0u8; 16]; b.fill(v as u8); b }),
        I16x8Splat => splat(thread, |v: i32| { let lane = (v as u16).to_le_bytes(); let mut b = [0u8; 16]; for i in 0..8 { b[i*2..i*2+2].copy_from_slice(&lane); } b }),
        I32x4Splat => splat(thread, |v: i32| { let lane = v.to_le_bytes(); let mut b = [0u8; 16]; for i in 0..4 { b[i*4..i*4+4].copy_from_slice(&lane); } b }),
        I64x2Splat => {
            let a = pop(thread).unwrap_i64();
            let lane = a.to_le_bytes();
            let mut b = [0u8; 16];
            b[0..8].copy_from_slice(&lane);
            b[8..16].copy_from_slice(&lane);
            push(thread, Value::V128(crate::value::V128::from_bytes(b)));
        }
        F32x4Splat => {
            let a = pop(thread);
            let bits = match a { Value::F32(f) => f.to_bits(), _ => crate::error::crash("type mismatch") };
            let lane = bits.to_le_bytes();
            let mut b = [0u8; 16];
            for i in 0..4 { b[i*4..i*4+4].copy_from_slice(&lane); }
            push(thread, Value::V128(crate::value::V128::from_bytes(b)));
        }
        F64x2Splat => {
            let a = pop(thread);
            let bits = match a { Value::F64(f) => f.to_bits(), _ => crate::error::crash("type mismatch") };
            let lane = bits.to_le_bytes();
            let mut b = [0u8; 16];
            b[0..8].copy_from_slice(&lane);
            b[8..16].copy_from_slice(&lane);
            push(thread, Value::V128(crate::value::V128::from_bytes(b)));
        }
        I8x16ExtractLaneS(lane) => extract_lane_i32(thread, lane as usize, 1, true),
        I8x16ExtractLaneU(lane) => extract_lane_i32(thread, lane as usize, 1, false),
        I16x8ExtractLaneS(lane) => extract_lane_i32(thread, lane as usize, 2, true),
        I16x8ExtractLaneU(lane) => extract_lane_i32(thread, lane as usize, 2, false),
        I32x4ExtractLane(lane) => extract_lane_i32(thread, lane as usize, 4, true),
        I64x2ExtractLane(lane) => {
            let v = pop(thread);
            let bytes = v128_bytes(v);
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[lane as usize * 8..lane as usize * 8 + 8]);
            push(thread, Value::I64(i64::from_le_bytes(buf)));
        }
        F32x4ExtractLane(lane) => {
            let v = pop(thread);
            let bytes = v128_bytes(v);
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[lane as usize * 4..lane as usize * 4 + 4]);
            push(thread, Value::F32(F32::from_bits(u32::from_le_bytes(buf))));
        }
        F64x2ExtractLane(lane) => {
            let v = pop(thread);
            let bytes = v128_bytes(v);
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[lane as usize * 8..lane as usize * 8 + 8]);
            push(thread, Value::F64(F64::from_bits(u64::from_le_bytes(buf))));
        }
        I8x16ReplaceLane(lane) => {
            let x = pop(thread).unwrap_i32() as u8;
            let v = pop(thread);
            let mut bytes = v128_bytes(v);
            bytes[lane as usize] = x;
            push(thread, Value::V128(crate::value::V128::from_bytes(bytes)));
        }
        I16x8ReplaceLane(lane) => {
            let x = pop(thread).unwrap_i32() as u16;
            let v = pop(thread);
            let mut bytes = v128_bytes(v);
            bytes[lane as usize * 2..lane as usize * 2 + 2].copy_from_slice(&x.to_le_bytes());
            push(thread, Value::V128(crate::value::V128::from_bytes(bytes)));
        }
        I32x4ReplaceLane(lane) => {
            let x = pop(thread).unwrap_i32();
            let v = pop(thread);
            let mut bytes = v128_bytes(v);
            bytes[lane as usize * 4..lane as usize * 4 + 4].copy_from_slice(&x.to_le_bytes());
            push(thread, Value::V128(crate::value::V128::from_bytes(bytes)));
        }
        I64x2ReplaceLane(lane) => {
            let x = pop(thread).unwrap_i64();
            let v = pop(thread);
            let mut bytes = v128_bytes(v);
            bytes[lane as usize * 8..lane as usize * 8 + 8].copy_from_slice(&x.to_le_bytes());
            push(thread, Value::V128(crate::value::V128::from_bytes(bytes)));
        }
        F32x4ReplaceLane(lane) => {
            let x = pop(thread);
            let bits = match x { Value::F32(f) => f.to_bits(), _ => crate::error::crash("type mismatch") };
            let v = pop(thread);
            let mut bytes = v128_bytes(v);
            bytes[lane as usize * 4..lane as usize * 4 + 4].copy_from_slice(&bits.to_le_bytes());
            push(thread, Value::V128(crate::value::V128::from_bytes(bytes)));
        }
        F64x2ReplaceLane(lane) => {
            let x = pop(thread);
            let bits = match x { Value::F64(f) => f.to_bits(), _ => crate::error::crash("type mismatch") };
            let v = pop(thread);
            let mut bytes = v128_bytes(v);
            bytes[lane as usize * 8..lane as usize * 8 + 8].copy_from_slice(&bits.to_le_bytes());
            push(thread, Value::V128(crate::value::V128::from_bytes(bytes)));
        }

        V128Not => v128_unop(thread, |a| !a),
        V128And => v128_binop(thread, |a, b| a & b),
        V128Or => v128_binop(thread, |a, b| a | b),
        V128Xor => v128_binop(thread, |a, b| a ^ b),
        V128AndNot => v128_binop(thread, |a, b| a & !b),
        V128Bitselect => {
            let c = v128_bits(pop(thread));
            let b = v128_bits(pop(thread));
            let a = v128_bits(pop(thread));
            push(thread, Value::V128(crate::value::V128::from_bits((a & c) | (b & !c))));
        }
        I8x16Bitmask => bitmask(thread, 1),
        I16x8Bitmask => bitmask(thread, 2),
        I32x4Bitmask => bitmask(thread, 4),
        I64x2Bitmask => bitmask(thread, 8),
        I8x16Shl | I8x16ShrS | I8x16ShrU | I16x8Shl | I16x8ShrS | I16x8ShrU | I32x4Shl | I32x4ShrS
        | I32x4ShrU | I64x2Shl | I64x2ShrS | I64x2ShrU => {
            let shift = pop(thread).unwrap_i32();
            let v = pop(thread);
            push(thread, Value::V128(lane_shift(&instr, v, shift)));
        }
        I8x16Add => lane_binop::<1>(thread, |a, b| a.wrapping_add(b)),
        I8x16Sub => lane_binop::<1>(thread, |a, b| a.wrapping_sub(b)),
        I16x8Add => lane_binop::<2>(thread, |a, b| a.wrapping_add(b)),
        I16x8Sub => lane_binop::<2>(thread, |a, b| a.wrapping_sub(b)),
        I16x8Mul => lane_binop::<2>(thread, |a, b| a.wrapping_mul(b)),
        I32x4Add => lane_binop::<4>(thread, |a, b| a.wrapping_add(b)),
        I32x4Sub => lane_binop::<4>(thread, |a, b| a.wrapping_sub(b)),
        I32x4Mul => lane_binop::<4>(thread, |a, b| a.wrapping_mul(b)),
        I64x2Add => lane_binop::<8>(thread, |a, b| a.wrapping_add(b)),
        I64x2Sub => lane_binop::<8>(thread, |a, b| a.wrapping_sub(b)),
        I64x2Mul => lane_binop::<8>(thread, |a, b| a.wrapping_mul(b)),
        F32x4Add | F32x4Sub | F32x4Mul | F32x4Div => lane_float_binop_32(thread, &instr),
        F64x2Add | F64x2Sub | F64x2Mul | F64x2Div => lane_float_binop_64(thread, &instr),
    }
    Ok(None)
}

fn step_table_copy_one(
    thread: &mut Thread,
    dst_table: &crate::table::TableRef,
    src_table: &crate::table::TableRef,
    d: u32,
    s: u32,
    n: u32,
    dst_idx: u32,
    src_idx: u32,
) {
    let descending = crate::memory::copy_direction_descending(d, s);
    let (cur_d, cur_s) = if descending {
        (d + n - 1, s + n - 1)
    } else {
        (d, s)
    };
    if dst_table.copy_one(cur_d, cur_s).is_err() {
        set_trap(thread, TrapCode::TableOutOfBounds);
        return;
    }
    let _ = src_table;
    if n > 1 {
        let (next_d, next_s) = if descending { (d, s) } else { (d + 1, s + 1) };
        push(thread, Value::I32(next_d as i32));
        push(thread, Value::I32(next_s as i32));
        push(thread, Value::I32((n - 1) as i32));
        thread
            .current()
            .unwrap()
            .code
            .push_front(AdminInstr::Plain(Instr::TableCopy { dst: dst_idx, src: src_idx }));
    }
}

fn step_memory_copy_one(thread: &mut Thread, memory: &crate::memory::MemoryRef, d: u32, s: u32, n: u32) {
    let descending = crate::memory::copy_direction_descending(d, s);
    let (cur_d, cur_s) = if descending { (d + n - 1, s + n - 1) } else { (d, s) };
    if memory.copy_one(cur_d, cur_s).is_err() {
        set_trap(thread, TrapCode::MemoryOutOfBounds);
        return;
    }
    if n > 1 {
        let (next_d, next_s) = if descending { (d, s) } else { (d + 1, s + 1) };
        push(thread, Value::I32(next_d as i32));
        push(thread, Value::I32(next_s as i32));
        push(thread, Value::I32((n - 1) as i32));
        thread.current().unwrap().code.push_front(AdminInstr::Plain(Instr::MemoryCopy));
    }
}

fn block_arity(thread: &Thread, bt: &crate::instr::BlockType) -> usize {
    match bt {
        crate::instr::BlockType::Empty => 0,
        crate::instr::BlockType::Value(_) => 1,
        crate::instr::BlockType::FuncType(idx) => current_frame(thread).module.types[*idx as usize].results().len(),
    }
}

fn block_params(thread: &Thread, bt: &crate::instr::BlockType) -> usize {
    match bt {
        crate::instr::BlockType::FuncType(idx) => current_frame(thread).module.types[*idx as usize].params().len(),
        _ => 0,
    }
}

fn enter_label(thread: &mut Thread, arity: usize, nparams: usize, body: Rc<[Instr]>, loop_body: Option<Rc<[Instr]>>) {
    let top = thread.current().unwrap();
    let drain_from = top.code.stack.len().saturating_sub(nparams);
    let params = top.code.stack.split_off(drain_from);
    let mut code = crate::admin::Code::from_instrs(body.iter().cloned());
    code.stack = params;
    thread.activations.push(Activation {
        kind: ControlKind::Label { arity, loop_body },
        code,
    });
}

fn trunc_to_int<F, T>(thread: &mut Thread, convert: impl FnOnce(F) -> Result<T, NumericError>, wrap: impl FnOnce(T) -> Value) -> Result<(), Error>
where
    F: TryFrom<Value, Error = ()>,
{
    let raw = pop(thread);
    let f = F::try_from(raw).map_err(|_| crate::error::crash("type mismatch in trunc"));
    let f = match f {
        Ok(f) => f,
        Err(_) => unreachable!(),
    };
    match convert(f) {
        Ok(v) => push(thread, wrap(v)),
        Err(e) => set_trap(thread, TrapCode::from(e)),
    }
    Ok(())
}

impl TryFrom<Value> for F32 {
    type Error = ();
    fn try_from(v: Value) -> Result<Self, ()> {
        match v {
            Value::F32(f) => Ok(f),
            _ => Err(()),
        }
    }
}
impl TryFrom<Value> for F64 {
    type Error = ();
    fn try_from(v: Value) -> Result<Self, ()> {
        match v {
            Value::F64(f) => Ok(f),
            _ => Err(()),
        }
    }
}

/// Computes a 64-bit effective address from a 32-bit guest address plus a
/// 32-bit static offset (spec.md §4.2: "Addresses are 64-bit internally
/// ... to detect overflow against `bound(mem) = pages × 65536`"). Adding
/// in `u64` instead of wrapping in `u32` means a base address near
/// `u32::MAX` plus a nonzero offset lands past any real memory's bound
/// instead of wrapping back into it.
trait EffectiveAddress {
    fn effective_address(self, offset: u32) -> u64;
}
impl EffectiveAddress for Value {
    fn effective_address(self, offset: u32) -> u64 {
        (self.unwrap_i32() as u32 as u64) + offset as u64
    }
}

fn load_scalar<const N: usize, R: Into<Value>>(thread: &mut Thread, arg: crate::instr::MemArg, decode: impl FnOnce([u8; N]) -> R) -> Result<(), Error> {
    let frame = current_frame(thread);
    let memory = frame.module.memories[0].clone();
    let addr = pop(thread).effective_address(arg.offset);
    let bytes: [u8; N] = memory.read_array(addr)?;
    push(thread, decode(bytes).into());
    Ok(())
}

fn load_packed_i32<const N: usize>(thread: &mut Thread, arg: crate::instr::MemArg, sign: Signedness) -> Result<(), Error> {
    let frame = current_frame(thread);
    let memory = frame.module.memories[0].clone();
    let addr = pop(thread).effective_address(arg.offset);
    let bytes: [u8; N] = memory.read_array(addr)?;
    let mut buf = [0u8; 4];
    buf[..N].copy_from_slice(&bytes);
    let unsigned = u32::from_le_bytes(buf);
    let value = match sign {
        Signedness::Unsigned => unsigned as i32,
        Signedness::Signed => {
            let shift = (4 - N) * 8;
            ((unsigned << shift) as i32) >> shift
        }
    };
    push(thread, Value::I32(value));
    Ok(())
}

fn load_packed_i64<const N: usize>(thread: &mut Thread, arg: crate::instr::MemArg, sign: Signedness) -> Result<(), Error> {
    let frame = current_frame(thread);
    let memory = frame.module.memories[0].clone();
    let addr = pop(thread).effective_address(arg.offset);
    let bytes: [u8; N] = memory.read_array(addr)?;
    let mut buf = [0u8; 8];
    buf[..N].copy_from_slice(&bytes);
    let unsigned = u64::from_le_bytes(buf);
    let value = match sign {
        Signedness::Unsigned => unsigned as i64,
        Signedness::Signed => {
            let shift = (8 - N) * 8;
            ((unsigned << shift) as i64) >> shift
        }
    };
    push(thread, Value::I64(value));
    Ok(())
}

fn store_scalar(thread: &mut Thread, arg: crate::instr::MemArg, size: usize, encode: impl FnOnce(Value) -> u64) -> Result<(), Error> {
    let frame = current_frame(thread);
    let memory = frame.module.memories[0].clone();
    let v = pop(thread);
    let encoded = encode(v);
    let addr = pop(thread).effective_address(arg.offset);
    let bytes = encoded.to_le_bytes();
    memory.write(addr, &bytes[..size])
}

fn atomic_load32(thread: &mut Thread, arg: crate::instr::MemArg, size: usize) -> Result<(), Error> {
    let frame = current_frame(thread);
    let memory = frame.module.memories[0].clone();
    let addr = pop(thread).effective_address(arg.offset);
    let value = memory.atomic_load(addr, size)?;
    push(thread, Value::I32(value as i32));
    Ok(())
}

fn atomic_load64(thread: &mut Thread, arg: crate::instr::MemArg, size: usize) -> Result<(), Error> {
    let frame = current_frame(thread);
    let memory = frame.module.memories[0].clone();
    let addr = pop(thread).effective_address(arg.offset);
    let value = memory.atomic_load(addr, size)?;
    push(thread, Value::I64(value as i64));
    Ok(())
}

fn atomic_store(thread: &mut Thread, arg: crate::instr::MemArg, size: usize, encode: impl FnOnce(Value) -> u64) -> Result<(), Error> {
    let frame = current_frame(thread);
    let memory = frame.module.memories[0].clone();
    let v = pop(thread);
    let encoded = encode(v);
    let addr = pop(thread).effective_address(arg.offset);
    memory.atomic_store(addr, size, encoded)
}

fn rmw_apply(op: AtomicRmwOp, old: u64, operand: u64) -> u64 {
    match op {
        AtomicRmwOp::Add => old.wrapping_add(operand),
        AtomicRmwOp::Sub => old.wrapping_sub(operand),
        AtomicRmwOp::And => old & operand,
        AtomicRmwOp::Or => old | operand,
        AtomicRmwOp::Xor => old ^ operand,
        AtomicRmwOp::Xchg => operand,
    }
}

fn atomic_rmw32(thread: &mut Thread, arg: crate::instr::MemArg, size: usize, op: AtomicRmwOp) -> Result<(), Error> {
    let frame = current_frame(thread);
    let memory = frame.module.memories[0].clone();
    let operand = pop(thread).unwrap_i32() as u32 as u64;
    let addr = pop(thread).effective_address(arg.offset);
    let old = memory.atomic_rmw(addr, size, |old| rmw_apply(op, old, operand))?;
    push(thread, Value::I32(old as i32));
    Ok(())
}

fn atomic_rmw64(thread: &mut Thread, arg: crate::instr::MemArg, size: usize, op: AtomicRmwOp) -> Result<(), Error> {
    let frame = current_frame(thread);
    let memory = frame.module.memories[0].clone();
    let operand = pop(thread).unwrap_i64() as u64;
    let addr = pop(thread).effective_address(arg.offset);
    let old = memory.atomic_rmw(addr, size, |old| rmw_apply(op, old, operand))?;
    push(thread, Value::I64(old as i64));
    Ok(())
}

fn atomic_cmpxchg32(thread: &mut Thread, arg: crate::instr::MemArg, size: usize) -> Result<(), Error> {
    let frame = current_frame(thread);
    let memory = frame.module.memories[0].clone();
    let replacement = pop(thread).unwrap_i32() as u32 as u64;
    let expected = pop(thread).unwrap_i32() as u32 as u64;
    let addr = pop(thread).effective_address(arg.offset);
    let old = memory.atomic_compare_exchange(addr, size, expected, replacement)?;
    push(thread, Value::I32(old as i32));
    Ok(())
}

fn atomic_cmpxchg64(thread: &mut Thread, arg: crate::instr::MemArg, size: usize) -> Result<(), Error> {
    let frame = current_frame(thread);
    let memory = frame.module.memories[0].clone();
    let replacement = pop(thread).unwrap_i64() as u64;
    let expected = pop(thread).unwrap_i64() as u64;
    let addr = pop(thread).effective_address(arg.offset);
    let old = memory.atomic_compare_exchange(addr, size, expected, replacement)?;
    push(thread, Value::I64(old as i64));
    Ok(())
}

fn v128_bytes(v: Value) -> [u8; 16] {
    match v {
        Value::V128(v) => v.bytes(),
        _ => crate::error::crash("type mismatch"),
    }
}

fn v128_bits(v: Value) -> u128 {
    match v {
        Value::V128(v) => v.to_bits(),
        _ => crate::error::crash("type mismatch"),
    }
}

fn splat(thread: &mut Thread, f: impl FnOnce(i32) -> [u8; 16]) {
    let a = pop(thread).unwrap_i32();
    push(thread, Value::V128(crate::value::V128::from_bytes(f(a))));
}

fn extract_lane_i32(thread: &mut Thread, lane: usize, width: usize, signed: bool) {
    let v = pop(thread);
    let bytes = v128_bytes(v);
    let mut buf = [0u8; 4];
    buf[..width].copy_from_slice(&bytes[lane * width..lane * width + width]);
    let unsigned = u32::from_le_bytes(buf);
    let value = if signed && width < 4 {
        let shift = (4 - width) * 8;
        ((unsigned << shift) as i32) >> shift
    } else {
        unsigned as i32
    };
    push(thread, Value::I32(value));
}

fn v128_unop(thread: &mut Thread, f: impl FnOnce(u128) -> u128) {
    let a = v128_bits(pop(thread));
    push(thread, Value::V128(crate::value::V128::from_bits(f(a))));
}

fn v128_binop(thread: &mut Thread, f: impl FnOnce(u128, u128) -> u128) {
    let b = v128_bits(pop(thread));
    let a = v128_bits(pop(thread));
    push(thread, Value::V128(crate::value::V128::from_bits(f(a, b))));
}

fn bitmask(thread: &mut Thread, lane_width: usize) {
    let bytes = v128_bytes(pop(thread));
    let lanes = 16 / lane_width;
    let mut mask = 0i32;
    for i in 0..lanes {
        let sign_byte = bytes[i * lane_width + lane_width - 1];
        if sign_byte & 0x80 != 0 {
            mask |= 1 << i;
        }
    }
    push(thread, Value::I32(mask));
}

fn lane_binop<const W: usize>(thread: &mut Thread, f: impl Fn(u64, u64) -> u64) {
    let b = v128_bytes(pop(thread));
    let a = v128_bytes(pop(thread));
    let mut out = [0u8; 16];
    for i in 0..16 / W {
        let mut ab = [0u8; 8];
        let mut bb = [0u8; 8];
        ab[..W].copy_from_slice(&a[i * W..i * W + W]);
        bb[..W].copy_from_slice(&b[i * W..i * W + W]);
        let r = f(u64::from_le_bytes(ab), u64::from_le_bytes(bb));
        out[i * W..i * W + W].copy_from_slice(&r.to_le_bytes()[..W]);
    }
    push(thread, Value::V128(crate::value::V128::from_bytes(out)));
}

fn lane_shift(instr: &Instr, v: Value, shift: i32) -> crate::value::V128 {
    use Instr::*;
    let (width, arith) = match instr {
        I8x16Shl => (1, None),
        I8x16ShrS => (1, Some(true)),
        I8x16ShrU => (1, Some(false)),
        I16x8Shl => (2, None),
        I16x8ShrS => (2, Some(true)),
        I16x8ShrU => (2, Some(false)),
        I32x4Shl => (4, None),
        I32x4ShrS => (4, Some(true)),
        I32x4ShrU => (4, Some(false)),
        I64x2Shl => (8, None),
        I64x2ShrS => (8, Some(true)),
        I64x2ShrU => (8, Some(false)),
        _ => unreachable!(),
    };
    let bytes = v128_bytes(v);
    let bits = (width * 8) as u32;
    let amount = shift as u32 % bits;
    let mut out = [0u8; 16];
    for i in 0..16 / width {
        let mut buf = [0u8; 8];
        buf[..width].copy_from_slice(&bytes[i * width..i * width + width]);
        let lane = u64::from_le_bytes(buf);
        let result = match arith {
            None => (lane << amount) & (u64::MAX >> (64 - bits)),
            Some(false) => lane >> amount,
            Some(true) => {
                let sign_mask = 1u64 << (bits - 1);
                if lane & sign_mask != 0 {
                    let filled = !0u64 << (bits - amount).max(0).min(bits);
                    (lane >> amount) | filled
                } else {
                    lane >> amount
                }
            }
        };
        out[i * width..i * width + width].copy_from_slice(&result.to_le_bytes()[..width]);
    }
    crate::value::V128::from_bytes(out)
}

fn lane_float_binop_32(thread: &mut Thread, instr: &Instr) {
    use Instr::*;
    let b = v128_bytes(pop(thread));
    let a = v128_bytes(pop(thread));
    let mut out = [0u8; 16];
    for i in 0..4 {
        let mut ab = [0u8; 4];
        let mut bb = [0u8; 4];
        ab.copy_from_slice(&a[i * 4..i * 4 + 4]);
        bb.copy_from_slice(&b[i * 4..i * 4 + 4]);
        let fa = F32::from_bits(u32::from_le_bytes(ab));
        let fb = F32::from_bits(u32::from_le_bytes(bb));
        let r = match instr {
            F32x4Add => fa.add(fb),
            F32x4Sub => fa.sub(fb),
            F32x4Mul => fa.mul(fb),
            F32x4Div => fa.div(fb).unwrap(),
            _ => unreachable!(),
        };
        out[i * 4..i * 4 + 4].copy_from_slice(&r.to_bits().to_le_bytes());
    }
    push(thread, Value::V128(crate::value::V128::from_bytes(out)));
}

fn lane_float_binop_64(thread: &mut Thread, instr: &Instr) {
    use Instr::*;
    let b = v128_bytes(pop(thread));
    let a = v128_bytes(pop(thread));
    let mut out = [0u8; 16];
    for i in 0..2 {
        let mut ab = [0u8; 8];
        let mut bb = [0u8; 8];
        ab.copy_from_slice(&a[i * 8..i * 8 + 8]);
        bb.copy_from_slice(&b[i * 8..i * 8 + 8]);
        let fa = F64::from_bits(u64::from_le_bytes(ab));
        let fb = F64::from_bits(u64::from_le_bytes(bb));
        let r = match instr {
            F64x2Add => fa.add(fb),
            F64x2Sub => fa.sub(fb),
            F64x2Mul => fa.mul(fb),
            F64x2Div => fa.div(fb).unwrap(),
            _ => unreachable!(),
        };
        out[i * 8..i * 8 + 8].copy_from_slice(&r.to_bits().to_le_bytes());
    }
    push(thread, Value::V128(crate::value::V128::from_bytes(out)));
}
