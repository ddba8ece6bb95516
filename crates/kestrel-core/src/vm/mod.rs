//! The evaluator: VM contexts and the sequence-id step protocol.
//!
//! A context owns three stacks. The data stack holds operand [`Item`]s.
//! The code stack holds [`CodeFrame`]s; each frame is one tree node (or
//! engine step) plus a `seq` counter recording how far its execution has
//! advanced. The call stack holds one [`CallFrame`] per active function.
//! The driver loop always executes the top code frame at its current seq;
//! steps advance their own seq and push child frames instead of recursing,
//! so evaluation can stop, suspend and resume between any two steps.

mod expr;
mod stmt;

pub use expr::{BinOp, CmpOp, Const, Expr, UnaryOp};
pub use stmt::Stmt;

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{Error, RunResult};
use crate::gc::{Collector, GcRoot, Marker};
use crate::heap::HeapObject;
use crate::item::{new_cell, Item, VarCell};
use crate::mantra::Function;
use crate::module::space::ModSpace;
use crate::module::Module;

/// One schedulable unit on the code stack.
#[derive(Debug, Clone)]
pub enum Step {
    Expr(Arc<Expr>),
    Stmt(Arc<Stmt>),
    /// Delivers a precomputed item to the data stack; used by continuation
    /// points such as module loading.
    PushItem(Item),
    /// Pops and discards the data top.
    Discard,
    /// Calls a function with no arguments, pushing its own return slot.
    Invoke(Arc<Function>),
}

#[derive(Debug, Clone)]
pub struct CodeFrame {
    step: Step,
    seq: u32,
    /// Data stack depth at frame entry; loop steps restore it before each
    /// iteration.
    data_depth: u32,
}

#[derive(Debug)]
pub struct CallFrame {
    /// Executing function; `None` for host entry frames.
    function: Option<Arc<Function>>,
    module: Option<Arc<Module>>,
    /// Data index of the callee slot, which becomes the return slot.
    base: usize,
    code_base: usize,
    handler_base: usize,
    /// Dynamic binds: closure captures and `global` statement bindings.
    /// Checked before function variables, so `global` shadows locals.
    binds: HashMap<String, VarCell>,
}

#[derive(Debug)]
struct HandlerFrame {
    code_depth: usize,
    data_depth: usize,
    call_depth: usize,
    catch_var: String,
    handler: Arc<Stmt>,
}

/// Why [`VmContext::run`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All frames drained; the result (if any) is on the data stack.
    Completed,
    /// A step requested suspension; stacks are intact, call `run` again to
    /// resume.
    Suspended,
    /// The termination flag was raised between steps.
    Terminated,
}

enum Resolved {
    Slot(usize),
    Cell(VarCell),
}

pub struct VmContext {
    id: u32,
    gc: Arc<Collector>,
    space: Option<Arc<ModSpace>>,
    data: Vec<Item>,
    code: Vec<CodeFrame>,
    calls: Vec<CallFrame>,
    handlers: Vec<HandlerFrame>,
    terminate: Arc<AtomicBool>,
    suspend_pending: bool,
}

impl VmContext {
    #[must_use]
    pub fn new(id: u32, gc: Arc<Collector>, space: Option<Arc<ModSpace>>) -> Self {
        VmContext {
            id,
            gc,
            space,
            data: Vec::new(),
            code: Vec::new(),
            calls: Vec::new(),
            handlers: Vec::new(),
            terminate: Arc::new(AtomicBool::new(false)),
            suspend_pending: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn gc(&self) -> &Arc<Collector> {
        &self.gc
    }

    #[must_use]
    pub fn space(&self) -> Option<&Arc<ModSpace>> {
        self.space.as_ref()
    }

    /// Shareable flag that stops the context between steps when raised.
    #[must_use]
    pub fn terminator(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    /// Asks the driver to stop after the current step, keeping all stacks
    /// for later resumption.
    pub fn request_suspend(&mut self) {
        self.suspend_pending = true;
    }

    // ===== stack primitives =====

    pub fn push_data(&mut self, item: Item) {
        self.data.push(item);
    }

    pub fn pop_data(&mut self) -> Item {
        self.data.pop().unwrap_or(Item::Nil)
    }

    #[must_use]
    pub fn top_data(&self) -> Item {
        self.data.last().copied().unwrap_or(Item::Nil)
    }

    #[must_use]
    pub fn data_depth(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn push_step(&mut self, step: Step) {
        let data_depth = u32::try_from(self.data.len()).unwrap_or(u32::MAX);
        self.code.push(CodeFrame {
            step,
            seq: 0,
            data_depth,
        });
    }

    pub fn push_expr(&mut self, e: Arc<Expr>) {
        self.push_step(Step::Expr(e));
    }

    pub fn push_stmt(&mut self, s: Arc<Stmt>) {
        self.push_step(Step::Stmt(s));
    }

    /// Schedules a quoted item: trees are evaluated, anything else is
    /// delivered as-is. This is how eta functions force their arguments.
    pub fn push_quoted(&mut self, item: Item) {
        if let Some(obj) = self.gc.deref(&item) {
            if let HeapObject::Tree(e) = &*obj {
                self.push_expr(Arc::clone(e));
                return;
            }
        }
        self.push_step(Step::PushItem(item));
    }

    // ===== call protocol =====

    /// Pushes a host entry frame. Its return slot is a fresh Nil; when the
    /// scheduled steps drain, the last computed value is returned there.
    pub fn push_entry(&mut self, module: Option<Arc<Module>>) {
        let base = self.data.len();
        self.data.push(Item::Nil);
        self.calls.push(CallFrame {
            function: None,
            module,
            base,
            code_base: self.code.len(),
            handler_base: self.handlers.len(),
            binds: HashMap::new(),
        });
    }

    fn push_call_frame(
        &mut self,
        function: Arc<Function>,
        binds: HashMap<String, VarCell>,
        argc: usize,
    ) {
        let base = self.data.len() - argc - 1;
        let module = function.module();
        self.calls.push(CallFrame {
            function: Some(function),
            module,
            base,
            code_base: self.code.len(),
            handler_base: self.handlers.len(),
            binds,
        });
    }

    /// Pads missing arguments with Nil, drops extras, and reserves local
    /// slots. Called by syntactic bodies before their first step.
    pub(crate) fn adjust_arity(&mut self, func: &Arc<Function>, argc: usize) {
        let Some(frame) = self.calls.last() else { return };
        let base = frame.base;
        let params = func.param_count();
        if argc > params {
            self.data.truncate(base + 1 + params);
        }
        while self.data.len() < base + 1 + params {
            self.data.push(Item::Nil);
        }
        for _ in 0..func.vars().local_count() {
            self.data.push(Item::Nil);
        }
    }

    /// Pops the current call frame, unwinding its code frames and operand
    /// slice, and delivers `value` in the return slot.
    pub fn return_frame(&mut self, value: Item) -> RunResult<()> {
        let frame = self
            .calls
            .pop()
            .ok_or_else(|| Error::code("return outside of any call frame"))?;
        self.code.truncate(frame.code_base);
        self.handlers.truncate(frame.handler_base);
        self.data.truncate(frame.base);
        self.data.push(value);
        Ok(())
    }

    /// The nth argument of the current call, for native bodies.
    #[must_use]
    pub fn param(&self, n: usize) -> Item {
        let Some(frame) = self.calls.last() else {
            return Item::Nil;
        };
        self.data.get(frame.base + 1 + n).copied().unwrap_or(Item::Nil)
    }

    #[must_use]
    pub fn current_module(&self) -> Option<Arc<Module>> {
        self.calls.last().and_then(|f| f.module.clone())
    }

    // ===== driver =====

    /// Drives the top code frame until the context drains, a step requests
    /// suspension, or the termination flag is raised. Errors unwind to the
    /// nearest handler frame; with none installed they propagate out and
    /// the stacks are left as the unwind found them.
    pub fn run(&mut self) -> RunResult<RunOutcome> {
        loop {
            if self.terminate.load(Ordering::Relaxed) {
                return Ok(RunOutcome::Terminated);
            }
            self.auto_return()?;
            if self.code.is_empty() {
                return Ok(RunOutcome::Completed);
            }
            if let Err(e) = self.step_once() {
                self.unwind(e)?;
            }
            if self.suspend_pending {
                self.suspend_pending = false;
                return Ok(RunOutcome::Suspended);
            }
        }
    }

    /// Returns call frames whose code drained without an explicit return.
    /// Function frames yield Nil; entry frames yield the last computed
    /// value, which is how expression evaluation delivers its result.
    fn auto_return(&mut self) -> RunResult<()> {
        while let Some(frame) = self.calls.last() {
            if self.code.len() > frame.code_base {
                break;
            }
            let result = if frame.function.is_none() && self.data.len() > frame.base + 1 {
                self.top_data()
            } else {
                Item::Nil
            };
            self.return_frame(result)?;
        }
        Ok(())
    }

    fn unwind(&mut self, err: Error) -> RunResult<()> {
        let Some(h) = self.handlers.pop() else {
            return Err(err);
        };
        self.calls.truncate(h.call_depth);
        self.code.truncate(h.code_depth);
        self.data.truncate(h.data_depth);
        // the guarding Try frame is now on top; route it to its done state
        if let Some(frame) = self.code.last_mut() {
            frame.seq = 2;
        }
        let text = self.gc.store_item(HeapObject::Str(err.to_string()));
        if let Some(frame) = self.calls.last_mut() {
            frame.binds.insert(h.catch_var, new_cell(text));
        }
        self.push_stmt(h.handler);
        Ok(())
    }

    fn step_once(&mut self) -> RunResult<()> {
        let idx = self.code.len() - 1;
        let seq = self.code[idx].seq;
        let step = self.code[idx].step.clone();
        match step {
            Step::Expr(e) => self.exec_expr(idx, &e, seq),
            Step::Stmt(s) => self.exec_stmt(idx, &s, seq),
            Step::PushItem(item) => {
                self.code.truncate(idx);
                self.data.push(item);
                Ok(())
            }
            Step::Discard => {
                self.code.truncate(idx);
                self.data.pop();
                Ok(())
            }
            Step::Invoke(f) => {
                self.code.truncate(idx);
                self.data.push(Item::Nil);
                self.push_call_frame(Arc::clone(&f), HashMap::new(), 0);
                f.invoke(self, 0)
            }
        }
    }

    // ===== name resolution =====

    fn resolve_name(&self, name: &str) -> Option<Resolved> {
        if let Some(frame) = self.calls.last() {
            if let Some(cell) = frame.binds.get(name) {
                return Some(Resolved::Cell(Arc::clone(cell)));
            }
            if let Some(func) = &frame.function {
                use crate::mantra::VarSlot;
                match func.vars().find(name) {
                    Some(VarSlot::Param(i)) => return Some(Resolved::Slot(frame.base + 1 + i)),
                    Some(VarSlot::Local(i)) => {
                        return Some(Resolved::Slot(frame.base + 1 + func.param_count() + i));
                    }
                    // closed variables resolve through binds; absent means
                    // the closure was never materialized, fall through
                    Some(VarSlot::Closed(_)) | None => {}
                }
            }
            if let Some(module) = &frame.module {
                if let Some(cell) = module.cell_for(name) {
                    return Some(Resolved::Cell(cell));
                }
            }
        }
        if let Some(space) = &self.space {
            if let Some(cell) = space.resolve_export(name) {
                return Some(Resolved::Cell(cell));
            }
        }
        None
    }

    /// Attaches the current module/symbol to an error that lacks them.
    fn locate(&self, mut err: Error) -> Error {
        if let Some(frame) = self.calls.last() {
            if err.module().is_none() {
                if let Some(m) = &frame.module {
                    err = err.in_module(m.name());
                }
            }
            if err.symbol().is_none() {
                if let Some(f) = &frame.function {
                    err = err.in_symbol(f.name());
                }
            }
        }
        err
    }

    fn const_item(&self, c: &Const) -> Item {
        match c {
            Const::Nil => Item::Nil,
            Const::Bool(b) => Item::Bool(*b),
            Const::Int(i) => Item::Int(*i),
            Const::Float(f) => Item::Float(*f),
            Const::Str(s) => self.gc.store_item(HeapObject::Str(s.clone())),
        }
    }

    // ===== expression steps =====

    #[allow(clippy::too_many_lines)]
    fn exec_expr(&mut self, idx: usize, e: &Expr, seq: u32) -> RunResult<()> {
        match e {
            Expr::Lit(c) => {
                let item = self.const_item(c);
                self.code.truncate(idx);
                self.data.push(item);
                Ok(())
            }
            Expr::Name(name) => {
                let item = match self.resolve_name(name) {
                    Some(Resolved::Slot(i)) => self.data[i],
                    Some(Resolved::Cell(cell)) => *cell.read().unwrap(),
                    None => {
                        return Err(
                            self.locate(Error::code(format!("undefined symbol '{name}'")))
                        );
                    }
                };
                self.code.truncate(idx);
                self.data.push(item);
                Ok(())
            }
            Expr::Assign { target, value } => {
                if seq == 0 {
                    self.code[idx].seq = 1;
                    self.push_expr(Arc::clone(value));
                    return Ok(());
                }
                let v = self.top_data();
                match self.resolve_name(target) {
                    Some(Resolved::Slot(i)) => self.data[i] = v,
                    Some(Resolved::Cell(cell)) => *cell.write().unwrap() = v,
                    None => {
                        return Err(self.locate(Error::code(format!(
                            "assignment to undefined symbol '{target}'"
                        ))));
                    }
                }
                // the assigned value is the expression's result
                self.code.truncate(idx);
                Ok(())
            }
            Expr::Unary { op, operand } => {
                if seq == 0 {
                    self.code[idx].seq = 1;
                    self.push_expr(Arc::clone(operand));
                    return Ok(());
                }
                let v = self.pop_data();
                let out = match op {
                    UnaryOp::Not => Item::Bool(!v.is_true()),
                    UnaryOp::Neg => match v {
                        Item::Int(i) => Item::Int(i.wrapping_neg()),
                        Item::Float(f) => Item::Float(-f),
                        other => {
                            return Err(self.locate(Error::operand(format!(
                                "cannot negate {}",
                                other.tag_name()
                            ))));
                        }
                    },
                };
                self.code.truncate(idx);
                self.data.push(out);
                Ok(())
            }
            Expr::Binary { op, lhs, rhs } => self.exec_binary(idx, *op, lhs, rhs, seq),
            Expr::Compare { op, lhs, rhs } => self.exec_compare(idx, *op, lhs, rhs, seq),
            Expr::And { lhs, rhs } => match seq {
                0 => {
                    self.code[idx].seq = 1;
                    self.push_expr(Arc::clone(lhs));
                    Ok(())
                }
                1 => {
                    let first = self.pop_data();
                    if first.is_true() {
                        // jump the gate to the end seq and reduce the
                        // second operand
                        self.code[idx].seq = 2;
                        self.push_expr(Arc::clone(rhs));
                    } else {
                        self.code.truncate(idx);
                        self.data.push(Item::Bool(false));
                    }
                    Ok(())
                }
                _ => {
                    let second = self.pop_data();
                    self.code.truncate(idx);
                    self.data.push(Item::Bool(second.is_true()));
                    Ok(())
                }
            },
            Expr::Or { lhs, rhs } => match seq {
                0 => {
                    self.code[idx].seq = 1;
                    self.push_expr(Arc::clone(lhs));
                    Ok(())
                }
                1 => {
                    let first = self.pop_data();
                    if first.is_true() {
                        self.code.truncate(idx);
                        self.data.push(Item::Bool(true));
                    } else {
                        self.code[idx].seq = 2;
                        self.push_expr(Arc::clone(rhs));
                    }
                    Ok(())
                }
                _ => {
                    let second = self.pop_data();
                    self.code.truncate(idx);
                    self.data.push(Item::Bool(second.is_true()));
                    Ok(())
                }
            },
            Expr::Ternary {
                cond,
                on_true,
                on_false,
            } => match seq {
                0 => {
                    self.code[idx].seq = 1;
                    self.push_expr(Arc::clone(cond));
                    Ok(())
                }
                1 => {
                    let c = self.pop_data();
                    self.code[idx].seq = 2;
                    let branch = if c.is_true() { on_true } else { on_false };
                    self.push_expr(Arc::clone(branch));
                    Ok(())
                }
                _ => {
                    // branch result stays on the stack
                    self.code.truncate(idx);
                    Ok(())
                }
            },
            Expr::Call { callee, args } => self.exec_call(idx, callee, args, seq),
            Expr::Closure(f) => {
                let closure = {
                    let this: &VmContext = self;
                    f.close(|name| match this.resolve_name(name) {
                        Some(Resolved::Cell(cell)) => Some(cell),
                        // stack slots are snapshotted into fresh cells at
                        // materialization time
                        Some(Resolved::Slot(i)) => Some(new_cell(this.data[i])),
                        None => None,
                    })
                };
                let item = match closure {
                    Some(c) => self.gc.store_item(HeapObject::Closure(c)),
                    None => self.gc.store_item(HeapObject::Func(Arc::clone(f))),
                };
                self.code.truncate(idx);
                self.data.push(item);
                Ok(())
            }
        }
    }

    fn exec_call(
        &mut self,
        idx: usize,
        callee: &Arc<Expr>,
        args: &[Arc<Expr>],
        seq: u32,
    ) -> RunResult<()> {
        if seq == 0 {
            self.code[idx].seq = 1;
            self.push_expr(Arc::clone(callee));
            return Ok(());
        }
        if seq == 1 {
            if self.callee_is_eta(&self.top_data()) {
                // eta: hand the arguments over unevaluated, as trees
                self.code.truncate(idx);
                for a in args {
                    let t = self.gc.store_item(HeapObject::Tree(Arc::clone(a)));
                    self.data.push(t);
                }
                return self.invoke_callable(args.len());
            }
            if args.is_empty() {
                self.code.truncate(idx);
                return self.invoke_callable(0);
            }
            self.code[idx].seq = 2;
            self.push_expr(Arc::clone(&args[0]));
            return Ok(());
        }
        let done = (seq - 1) as usize;
        if done < args.len() {
            self.code[idx].seq = seq + 1;
            self.push_expr(Arc::clone(&args[done]));
            Ok(())
        } else {
            self.code.truncate(idx);
            self.invoke_callable(args.len())
        }
    }

    fn callee_is_eta(&self, callee: &Item) -> bool {
        self.gc.deref(callee).is_some_and(|obj| match &*obj {
            HeapObject::Func(f) => f.is_eta(),
            HeapObject::Closure(c) => c.function().is_eta(),
            _ => false,
        })
    }

    /// Calls whatever sits under the top `argc` operands: a function, a
    /// closure, or a class (construction).
    pub fn invoke_callable(&mut self, argc: usize) -> RunResult<()> {
        let base = self.data.len() - argc - 1;
        let callee = self.data[base];
        let Some(obj) = self.gc.deref(&callee) else {
            return Err(self.locate(Error::operand(format!(
                "{} is not callable",
                callee.tag_name()
            ))));
        };
        match &*obj {
            HeapObject::Func(f) => {
                let f = Arc::clone(f);
                self.push_call_frame(Arc::clone(&f), HashMap::new(), argc);
                f.invoke(self, argc)
            }
            HeapObject::Closure(c) => {
                let f = Arc::clone(c.function());
                let binds = c
                    .captures()
                    .iter()
                    .map(|(n, cell)| (n.clone(), Arc::clone(cell)))
                    .collect();
                self.push_call_frame(Arc::clone(&f), binds, argc);
                f.invoke(self, argc)
            }
            HeapObject::Class(class) => {
                let class = Arc::clone(class);
                self.construct(&class, argc)
            }
            other => Err(self.locate(Error::operand(format!(
                "{} is not callable",
                other.type_name()
            )))),
        }
    }

    fn construct(&mut self, class: &Arc<crate::mantra::ClassDef>, argc: usize) -> RunResult<()> {
        let base = self.data.len() - argc - 1;
        let instance = self
            .gc
            .store_item(HeapObject::Object(crate::heap::UserObject::new(Arc::clone(
                class,
            ))));
        match class.constructor() {
            None => {
                self.data.truncate(base);
                self.data.push(instance);
                Ok(())
            }
            Some(ctor) => {
                // whatever the constructor returns, the call's result is
                // the instance
                self.push_step(Step::PushItem(instance));
                self.push_step(Step::Discard);
                self.data.insert(base + 1, instance);
                let ctor = Arc::clone(ctor);
                self.push_call_frame(Arc::clone(&ctor), HashMap::new(), argc + 1);
                ctor.invoke(self, argc + 1)
            }
        }
    }

    // ===== binary operators =====

    fn exec_binary(
        &mut self,
        idx: usize,
        op: BinOp,
        lhs: &Arc<Expr>,
        rhs: &Arc<Expr>,
        seq: u32,
    ) -> RunResult<()> {
        match seq {
            0 => {
                self.code[idx].seq = 1;
                self.push_expr(Arc::clone(rhs));
                Ok(())
            }
            1 => {
                self.code[idx].seq = 2;
                self.push_expr(Arc::clone(lhs));
                Ok(())
            }
            2 => {
                let a = self.pop_data();
                let b = self.pop_data();
                if let Some(hook) = self.operator_hook(&a, op.slot_name()) {
                    // forward to the object's overload slot; seq 3 passes
                    // the returned value through
                    self.code[idx].seq = 3;
                    self.data.push(Item::Nil);
                    self.data.push(a);
                    self.data.push(b);
                    self.push_call_frame(Arc::clone(&hook), HashMap::new(), 2);
                    return hook.invoke(self, 2);
                }
                let out = self.arith(op, a, b)?;
                self.code.truncate(idx);
                self.data.push(out);
                Ok(())
            }
            _ => {
                // overload result is already on the stack
                self.code.truncate(idx);
                Ok(())
            }
        }
    }

    fn operator_hook(&self, item: &Item, slot: &str) -> Option<Arc<Function>> {
        if !matches!(item, Item::User(_)) {
            return None;
        }
        let obj = self.gc.deref(item)?;
        match &*obj {
            HeapObject::Object(o) => o.class().method(slot),
            _ => None,
        }
    }

    fn arith(&self, op: BinOp, a: Item, b: Item) -> RunResult<Item> {
        use Item::{Float, Int};
        let out = match (op, a, b) {
            (BinOp::Add, Int(x), Int(y)) => Int(x.wrapping_add(y)),
            (BinOp::Sub, Int(x), Int(y)) => Int(x.wrapping_sub(y)),
            (BinOp::Mul, Int(x), Int(y)) => Int(x.wrapping_mul(y)),
            (BinOp::Div, Int(_), Int(0)) => {
                return Err(self.locate(Error::operand("division by zero")));
            }
            (BinOp::Div, Int(x), Int(y)) => Int(x.wrapping_div(y)),
            (op, Float(x), Float(y)) => self.arith_f(op, x, y)?,
            (op, Int(x), Float(y)) => self.arith_f(op, x as f64, y)?,
            (op, Float(x), Int(y)) => self.arith_f(op, x, y as f64)?,
            (BinOp::Add, a, b) => {
                if let Some(s) = self.concat(&a, &b) {
                    s
                } else {
                    return Err(self.arith_err(op, &a, &b));
                }
            }
            (op, a, b) => return Err(self.arith_err(op, &a, &b)),
        };
        Ok(out)
    }

    fn arith_f(&self, op: BinOp, x: f64, y: f64) -> RunResult<Item> {
        let v = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => {
                if y == 0.0 {
                    return Err(self.locate(Error::operand("division by zero")));
                }
                x / y
            }
        };
        Ok(Item::Float(v))
    }

    fn concat(&self, a: &Item, b: &Item) -> Option<Item> {
        let (oa, ob) = (self.gc.deref(a)?, self.gc.deref(b)?);
        match (&*oa, &*ob) {
            (HeapObject::Str(sa), HeapObject::Str(sb)) => {
                let mut s = String::with_capacity(sa.len() + sb.len());
                s.push_str(sa);
                s.push_str(sb);
                Some(self.gc.store_item(HeapObject::Str(s)))
            }
            _ => None,
        }
    }

    fn arith_err(&self, op: BinOp, a: &Item, b: &Item) -> Error {
        self.locate(Error::operand(format!(
            "operator {op:?} not supported for {} and {}",
            a.tag_name(),
            b.tag_name()
        )))
    }

    // ===== comparison =====

    fn exec_compare(
        &mut self,
        idx: usize,
        op: CmpOp,
        lhs: &Arc<Expr>,
        rhs: &Arc<Expr>,
        seq: u32,
    ) -> RunResult<()> {
        match seq {
            0 => {
                self.code[idx].seq = 1;
                self.push_expr(Arc::clone(rhs));
                Ok(())
            }
            1 => {
                self.code[idx].seq = 2;
                self.push_expr(Arc::clone(lhs));
                Ok(())
            }
            2 => {
                let a = self.pop_data();
                let b = self.pop_data();
                if let Some(hook) = self.operator_hook(&a, "__compare__") {
                    // the comparison slot runs as a regular call and may
                    // itself suspend; seq 3 interprets its result
                    self.code[idx].seq = 3;
                    self.data.push(Item::Nil);
                    self.data.push(a);
                    self.data.push(b);
                    self.push_call_frame(Arc::clone(&hook), HashMap::new(), 2);
                    return hook.invoke(self, 2);
                }
                let ord = self.deep_compare(&a, &b);
                self.code.truncate(idx);
                self.data.push(Item::Bool(op.holds(ord)));
                Ok(())
            }
            _ => {
                let result = self.pop_data();
                let Item::Int(n) = result else {
                    return Err(self.locate(Error::operand(
                        "comparison slot must return an integer ordering",
                    )));
                };
                let ord = n.cmp(&0);
                self.code.truncate(idx);
                self.data.push(Item::Bool(op.holds(ord)));
                Ok(())
            }
        }
    }

    /// Flat total order refined for heap strings, which compare by
    /// content.
    fn deep_compare(&self, a: &Item, b: &Item) -> CmpOrdering {
        if let (Some(oa), Some(ob)) = (self.gc.deref(a), self.gc.deref(b)) {
            if let (HeapObject::Str(sa), HeapObject::Str(sb)) = (&*oa, &*ob) {
                return sa.cmp(sb);
            }
        }
        a.flat_compare(b)
    }

    // ===== statement steps =====

    fn exec_stmt(&mut self, idx: usize, s: &Stmt, seq: u32) -> RunResult<()> {
        match s {
            Stmt::Expr(e) => {
                if seq == 0 {
                    self.code[idx].seq = 1;
                    self.push_expr(Arc::clone(e));
                } else {
                    self.data.pop();
                    self.code.truncate(idx);
                }
                Ok(())
            }
            Stmt::Block(stmts) => {
                let k = seq as usize;
                if k < stmts.len() {
                    self.code[idx].seq = seq + 1;
                    self.push_stmt(Arc::clone(&stmts[k]));
                } else {
                    self.code.truncate(idx);
                }
                Ok(())
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                if seq == 0 {
                    self.code[idx].seq = 1;
                    self.push_expr(Arc::clone(cond));
                    return Ok(());
                }
                let c = self.pop_data();
                self.code.truncate(idx);
                if c.is_true() {
                    self.push_stmt(Arc::clone(then_body));
                } else if let Some(e) = else_body {
                    self.push_stmt(Arc::clone(e));
                }
                Ok(())
            }
            Stmt::While { cond, body } => {
                if seq == 0 {
                    // re-arm: discard anything an unbalanced body left
                    let depth = self.code[idx].data_depth as usize;
                    self.data.truncate(depth);
                    self.code[idx].seq = 1;
                    self.push_expr(Arc::clone(cond));
                    return Ok(());
                }
                let c = self.pop_data();
                if c.is_true() {
                    self.code[idx].seq = 0;
                    self.push_stmt(Arc::clone(body));
                } else {
                    self.code.truncate(idx);
                }
                Ok(())
            }
            Stmt::Return(value) => {
                if seq == 0 {
                    if let Some(e) = value {
                        self.code[idx].seq = 1;
                        self.push_expr(Arc::clone(e));
                        return Ok(());
                    }
                    return self.return_frame(Item::Nil);
                }
                let v = self.pop_data();
                self.return_frame(v)
            }
            Stmt::Global { names, line } => {
                self.code.truncate(idx);
                let module = self.current_module().ok_or_else(|| {
                    Error::code("global statement outside of a module").at_line(*line)
                })?;
                for name in names {
                    let cell = module.cell_for(name).ok_or_else(|| {
                        self.locate(
                            Error::code(format!("undefined global '{name}'")).at_line(*line),
                        )
                    })?;
                    if let Some(frame) = self.calls.last_mut() {
                        frame.binds.insert(name.clone(), cell);
                    }
                }
                Ok(())
            }
            Stmt::Try {
                body,
                catch_var,
                handler,
            } => match seq {
                0 => {
                    self.code[idx].seq = 1;
                    self.handlers.push(HandlerFrame {
                        code_depth: self.code.len(),
                        data_depth: self.data.len(),
                        call_depth: self.calls.len(),
                        catch_var: catch_var.clone(),
                        handler: Arc::clone(handler),
                    });
                    self.push_stmt(Arc::clone(body));
                    Ok(())
                }
                1 => {
                    // body completed without raising
                    self.handlers.pop();
                    self.code.truncate(idx);
                    Ok(())
                }
                _ => {
                    // handler ran; the unwind already consumed the frame
                    self.code.truncate(idx);
                    Ok(())
                }
            },
        }
    }
}

impl GcRoot for VmContext {
    fn mark_roots(&self, marker: &mut Marker<'_>) {
        for item in &self.data {
            marker.trace(*item);
        }
        let mut scoped = Vec::new();
        for frame in &self.calls {
            for cell in frame.binds.values() {
                marker.trace(*cell.read().unwrap());
            }
            // a frame's module scope keeps that module's items alive even
            // when no space holds the module
            if let Some(module) = &frame.module {
                module.contained_items(&mut scoped);
            }
        }
        for item in scoped {
            marker.trace(item);
        }
        for frame in &self.code {
            if let Step::PushItem(item) = &frame.step {
                marker.trace(*item);
            }
        }
    }
}

// ===== convenience entry points =====

impl VmContext {
    /// Evaluates one expression against an optional module scope and runs
    /// to completion.
    pub fn eval_in(&mut self, module: Option<Arc<Module>>, expr: Arc<Expr>) -> RunResult<Item> {
        self.push_entry(module);
        self.push_expr(expr);
        self.finish()
    }

    /// Executes one statement against an optional module scope.
    pub fn exec_in(&mut self, module: Option<Arc<Module>>, stmt: Arc<Stmt>) -> RunResult<Item> {
        self.push_entry(module);
        self.push_stmt(stmt);
        self.finish()
    }

    /// Invokes the module's entry function and returns its result.
    pub fn call_main(&mut self, module: &Arc<Module>) -> RunResult<Item> {
        let main = module.main_function().ok_or_else(|| {
            Error::code("module has no entry function").in_module(module.name())
        })?;
        self.push_entry(Some(Arc::clone(module)));
        self.push_step(Step::Invoke(main));
        self.finish()
    }

    fn finish(&mut self) -> RunResult<Item> {
        match self.run()? {
            RunOutcome::Completed => Ok(self.pop_data()),
            RunOutcome::Suspended => Err(Error::code("evaluation suspended unexpectedly")),
            RunOutcome::Terminated => Err(Error::code("evaluation terminated")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::heap::UserObject;
    use crate::mantra::{ClassDef, FuncBody};
    use std::sync::atomic::AtomicI64;

    fn ctx() -> VmContext {
        VmContext::new(1, Arc::new(Collector::new()), None)
    }

    fn lit(n: i64) -> Arc<Expr> {
        Arc::new(Expr::Lit(Const::Int(n)))
    }

    fn lit_f(f: f64) -> Arc<Expr> {
        Arc::new(Expr::Lit(Const::Float(f)))
    }

    fn lit_s(s: &str) -> Arc<Expr> {
        Arc::new(Expr::Lit(Const::Str(s.to_string())))
    }

    fn lit_b(b: bool) -> Arc<Expr> {
        Arc::new(Expr::Lit(Const::Bool(b)))
    }

    fn var(n: &str) -> Arc<Expr> {
        Arc::new(Expr::Name(n.to_string()))
    }

    fn bin(op: BinOp, l: Arc<Expr>, r: Arc<Expr>) -> Arc<Expr> {
        Arc::new(Expr::Binary { op, lhs: l, rhs: r })
    }

    fn cmp(op: CmpOp, l: Arc<Expr>, r: Arc<Expr>) -> Arc<Expr> {
        Arc::new(Expr::Compare { op, lhs: l, rhs: r })
    }

    fn assign(target: &str, value: Arc<Expr>) -> Arc<Expr> {
        Arc::new(Expr::Assign {
            target: target.to_string(),
            value,
        })
    }

    fn call(callee: Arc<Expr>, args: Vec<Arc<Expr>>) -> Arc<Expr> {
        Arc::new(Expr::Call { callee, args })
    }

    /// Installs a function item under `name` in `module`, the way linking
    /// would publish it.
    fn install(gc: &Collector, module: &Arc<Module>, name: &str, f: Function) {
        f.set_module(module);
        let item = gc.store_item(HeapObject::Func(Arc::new(f)));
        let slot = module.add_global(name, Item::Nil);
        *module.global_cell(slot).unwrap().write().unwrap() = item;
    }

    /// A module with a native `bump()` that counts its invocations.
    fn counter_module(gc: &Collector) -> (Arc<Module>, Arc<AtomicI64>) {
        let m = Module::new("m", "kes:/m");
        let hits = Arc::new(AtomicI64::new(0));
        let h = Arc::clone(&hits);
        let f = Function::native(
            "bump",
            Arc::new(move |ctx: &mut VmContext, _argc: usize| {
                h.fetch_add(1, Ordering::Relaxed);
                ctx.return_frame(Item::Bool(true))
            }),
        );
        install(gc, &m, "bump", f);
        (m, hits)
    }

    #[test]
    fn test_int_arithmetic() {
        let mut c = ctx();
        let e = bin(BinOp::Add, lit(2), bin(BinOp::Mul, lit(3), lit(4)));
        assert_eq!(c.eval_in(None, e).unwrap(), Item::Int(14));
    }

    #[test]
    fn test_mixed_arithmetic_promotes_to_float() {
        let mut c = ctx();
        let e = bin(BinOp::Add, lit(1), lit_f(0.5));
        assert_eq!(c.eval_in(None, e).unwrap(), Item::Float(1.5));
    }

    #[test]
    fn test_division_by_zero_is_operand_error() {
        let mut c = ctx();
        let err = c.eval_in(None, bin(BinOp::Div, lit(1), lit(0))).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Operand(_)));
    }

    #[test]
    fn test_string_concatenation() {
        let mut c = ctx();
        let v = c
            .eval_in(None, bin(BinOp::Add, lit_s("ab"), lit_s("cd")))
            .unwrap();
        let obj = c.gc().deref(&v).unwrap();
        match &*obj {
            HeapObject::Str(s) => assert_eq!(s, "abcd"),
            other => panic!("expected string, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_strings_compare_by_content() {
        let mut c = ctx();
        let e = cmp(CmpOp::Lt, lit_s("abc"), lit_s("abd"));
        assert_eq!(c.eval_in(None, e).unwrap(), Item::Bool(true));
        // distinct heap values, equal content
        let e = cmp(CmpOp::Eq, lit_s("same"), lit_s("same"));
        assert_eq!(c.eval_in(None, e).unwrap(), Item::Bool(true));
    }

    #[test]
    fn test_unary_operators() {
        let mut c = ctx();
        let e = Arc::new(Expr::Unary {
            op: UnaryOp::Neg,
            operand: lit(5),
        });
        assert_eq!(c.eval_in(None, e).unwrap(), Item::Int(-5));
        let e = Arc::new(Expr::Unary {
            op: UnaryOp::Not,
            operand: lit(0),
        });
        assert_eq!(c.eval_in(None, e).unwrap(), Item::Bool(true));
    }

    #[test]
    fn test_and_skips_second_operand_when_first_false() {
        let mut c = ctx();
        let (m, hits) = counter_module(c.gc());
        let e = Arc::new(Expr::And {
            lhs: lit_b(false),
            rhs: call(var("bump"), vec![]),
        });
        assert_eq!(c.eval_in(Some(m), e).unwrap(), Item::Bool(false));
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_and_reduces_second_operand_when_first_true() {
        let mut c = ctx();
        let (m, hits) = counter_module(c.gc());
        let e = Arc::new(Expr::And {
            lhs: lit_b(true),
            rhs: call(var("bump"), vec![]),
        });
        assert_eq!(c.eval_in(Some(m), e).unwrap(), Item::Bool(true));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_or_skips_second_operand_when_first_true() {
        let mut c = ctx();
        let (m, hits) = counter_module(c.gc());
        let e = Arc::new(Expr::Or {
            lhs: lit_b(true),
            rhs: call(var("bump"), vec![]),
        });
        assert_eq!(c.eval_in(Some(m), e).unwrap(), Item::Bool(true));
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_ternary_takes_one_branch() {
        let mut c = ctx();
        let e = Arc::new(Expr::Ternary {
            cond: cmp(CmpOp::Gt, lit(3), lit(2)),
            on_true: lit(10),
            on_false: lit(20),
        });
        assert_eq!(c.eval_in(None, e).unwrap(), Item::Int(10));
    }

    #[test]
    fn test_assignment_writes_global_and_yields_value() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        m.add_global("v", Item::Int(0));
        let v = c
            .eval_in(Some(Arc::clone(&m)), assign("v", lit(7)))
            .unwrap();
        assert_eq!(v, Item::Int(7));
        assert_eq!(*m.cell_for("v").unwrap().read().unwrap(), Item::Int(7));
    }

    #[test]
    fn test_undefined_name_is_code_error() {
        let mut c = ctx();
        let err = c.eval_in(None, var("ghost")).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Code(_)));
    }

    #[test]
    fn test_while_loop_accumulates() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        m.add_global("i", Item::Int(0));
        m.add_global("acc", Item::Int(0));
        let body = Arc::new(Stmt::Block(vec![
            Arc::new(Stmt::Expr(assign(
                "acc",
                bin(BinOp::Add, var("acc"), var("i")),
            ))),
            Arc::new(Stmt::Expr(assign("i", bin(BinOp::Add, var("i"), lit(1))))),
        ]));
        let loop_stmt = Arc::new(Stmt::While {
            cond: cmp(CmpOp::Lt, var("i"), lit(5)),
            body,
        });
        c.exec_in(Some(Arc::clone(&m)), loop_stmt).unwrap();
        assert_eq!(*m.cell_for("acc").unwrap().read().unwrap(), Item::Int(10));
    }

    #[test]
    fn test_if_else_branches() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        m.add_global("v", Item::Int(0));
        let stmt = Arc::new(Stmt::If {
            cond: lit_b(false),
            then_body: Arc::new(Stmt::Expr(assign("v", lit(1)))),
            else_body: Some(Arc::new(Stmt::Expr(assign("v", lit(2))))),
        });
        c.exec_in(Some(Arc::clone(&m)), stmt).unwrap();
        assert_eq!(*m.cell_for("v").unwrap().read().unwrap(), Item::Int(2));
    }

    #[test]
    fn test_syntactic_call_with_parameters() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        let mut f = Function::new(
            "add2",
            1,
            FuncBody::Syntactic(Arc::new(Stmt::Return(Some(bin(
                BinOp::Add,
                var("a"),
                var("b"),
            ))))),
        );
        f.vars_mut().add_param("a");
        f.vars_mut().add_param("b");
        install(c.gc(), &m, "add2", f);
        let v = c
            .eval_in(Some(m), call(var("add2"), vec![lit(3), lit(4)]))
            .unwrap();
        assert_eq!(v, Item::Int(7));
    }

    #[test]
    fn test_missing_arguments_pad_with_nil() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        let mut f = Function::new(
            "second",
            1,
            FuncBody::Syntactic(Arc::new(Stmt::Return(Some(var("b"))))),
        );
        f.vars_mut().add_param("a");
        f.vars_mut().add_param("b");
        install(c.gc(), &m, "second", f);
        let v = c.eval_in(Some(m), call(var("second"), vec![lit(1)])).unwrap();
        assert_eq!(v, Item::Nil);
    }

    #[test]
    fn test_closure_captures_module_cell() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        m.add_global("n", Item::Int(41));
        let mut f = Function::new(
            "succ",
            1,
            FuncBody::Syntactic(Arc::new(Stmt::Return(Some(bin(
                BinOp::Add,
                var("n"),
                lit(1),
            ))))),
        );
        f.vars_mut().add_closed("n");
        let e = call(Arc::new(Expr::Closure(Arc::new(f))), vec![]);
        assert_eq!(c.eval_in(Some(m), e).unwrap(), Item::Int(42));
    }

    #[test]
    fn test_eta_function_receives_unevaluated_trees() {
        let mut c = ctx();
        let (m, hits) = counter_module(c.gc());
        let mut f = Function::native(
            "quote",
            Arc::new(move |ctx: &mut VmContext, argc: usize| {
                let arg = ctx.param(0);
                let is_tree = ctx
                    .gc()
                    .deref(&arg)
                    .is_some_and(|o| matches!(&*o, HeapObject::Tree(_)));
                let argc = i64::try_from(argc).unwrap_or(0);
                ctx.return_frame(if is_tree { Item::Int(argc) } else { Item::Nil })
            }),
        );
        f.set_eta(true);
        install(c.gc(), &m, "quote", f);
        // the argument would bump the counter if it were evaluated
        let e = call(var("quote"), vec![call(var("bump"), vec![])]);
        assert_eq!(c.eval_in(Some(m), e).unwrap(), Item::Int(1));
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_try_catches_and_binds_message() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        m.add_global("msg", Item::Nil);
        let stmt = Arc::new(Stmt::Try {
            body: Arc::new(Stmt::Expr(bin(BinOp::Div, lit(1), lit(0)))),
            catch_var: "e".to_string(),
            handler: Arc::new(Stmt::Expr(assign("msg", var("e")))),
        });
        c.exec_in(Some(Arc::clone(&m)), stmt).unwrap();
        let msg = *m.cell_for("msg").unwrap().read().unwrap();
        let obj = c.gc().deref(&msg).unwrap();
        match &*obj {
            HeapObject::Str(s) => assert!(s.contains("division by zero")),
            other => panic!("expected string, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_execution_continues_after_handled_error() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        m.add_global("v", Item::Int(0));
        let stmt = Arc::new(Stmt::Block(vec![
            Arc::new(Stmt::Try {
                body: Arc::new(Stmt::Expr(bin(BinOp::Div, lit(1), lit(0)))),
                catch_var: "e".to_string(),
                handler: Arc::new(Stmt::Block(vec![])),
            }),
            Arc::new(Stmt::Expr(assign("v", lit(3)))),
        ]));
        c.exec_in(Some(Arc::clone(&m)), stmt).unwrap();
        assert_eq!(*m.cell_for("v").unwrap().read().unwrap(), Item::Int(3));
    }

    #[test]
    fn test_uncaught_error_propagates() {
        let mut c = ctx();
        let stmt = Arc::new(Stmt::Expr(bin(BinOp::Div, lit(1), lit(0))));
        let err = c.exec_in(None, stmt).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Operand(_)));
    }

    #[test]
    fn test_global_statement_shadows_parameter() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        m.add_global("v", Item::Int(0));
        let mut f = Function::new(
            "writer",
            1,
            FuncBody::Syntactic(Arc::new(Stmt::Block(vec![
                Arc::new(Stmt::Global {
                    names: vec!["v".to_string()],
                    line: 1,
                }),
                Arc::new(Stmt::Expr(assign("v", lit(9)))),
            ]))),
        );
        f.vars_mut().add_param("v");
        install(c.gc(), &m, "writer", f);
        c.eval_in(Some(Arc::clone(&m)), call(var("writer"), vec![lit(1)]))
            .unwrap();
        // the module cell was written, not the parameter slot
        assert_eq!(*m.cell_for("v").unwrap().read().unwrap(), Item::Int(9));
    }

    #[test]
    fn test_construction_yields_instance() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        let mut class = ClassDef::new("Point", 1, false);
        let mut ctor = Function::native(
            "Point",
            Arc::new(|ctx: &mut VmContext, _argc: usize| {
                let this = ctx.param(0);
                let x = ctx.param(1);
                if let Some(obj) = ctx.gc().deref(&this) {
                    if let HeapObject::Object(o) = &*obj {
                        o.set_field("x", x);
                    }
                }
                ctx.return_frame(Item::Nil)
            }),
        );
        ctor.vars_mut().add_param("self");
        ctor.vars_mut().add_param("x");
        class.set_constructor(Arc::new(ctor));
        let item = c.gc().store_item(HeapObject::Class(Arc::new(class)));
        let slot = m.add_global("Point", Item::Nil);
        *m.global_cell(slot).unwrap().write().unwrap() = item;

        let v = c.eval_in(Some(m), call(var("Point"), vec![lit(3)])).unwrap();
        assert!(matches!(v, Item::User(_)));
        let obj = c.gc().deref(&v).unwrap();
        match &*obj {
            HeapObject::Object(o) => {
                assert_eq!(o.class().name(), "Point");
                assert_eq!(o.get_field("x"), Some(Item::Int(3)));
            }
            other => panic!("expected object, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_operator_overload_slot() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        let class = ClassDef::new("Acc", 1, false);
        let mut add = Function::native(
            "__add__",
            Arc::new(|ctx: &mut VmContext, _argc: usize| {
                let this = ctx.param(0);
                let rhs = ctx.param(1);
                let base = match ctx.gc().deref(&this).as_deref() {
                    Some(HeapObject::Object(o)) => o.get_field("n").unwrap_or(Item::Int(0)),
                    _ => Item::Int(0),
                };
                let (Item::Int(a), Item::Int(b)) = (base, rhs) else {
                    return ctx.return_frame(Item::Nil);
                };
                ctx.return_frame(Item::Int(a + b))
            }),
        );
        add.vars_mut().add_param("self");
        add.vars_mut().add_param("other");
        let class = Arc::new(class);
        class.add_method(Arc::new(add));
        let instance = UserObject::new(Arc::clone(&class));
        instance.set_field("n", Item::Int(40));
        let item = c.gc().store_item(HeapObject::Object(instance));
        let slot = m.add_global("acc", Item::Nil);
        *m.global_cell(slot).unwrap().write().unwrap() = item;

        let v = c
            .eval_in(Some(m), bin(BinOp::Add, var("acc"), lit(2)))
            .unwrap();
        assert_eq!(v, Item::Int(42));
    }

    #[test]
    fn test_suspend_preserves_stacks_for_resume() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        let f = Function::native(
            "pause",
            Arc::new(|ctx: &mut VmContext, _argc: usize| {
                ctx.request_suspend();
                ctx.return_frame(Item::Int(5))
            }),
        );
        install(c.gc(), &m, "pause", f);
        c.push_entry(Some(m));
        c.push_expr(bin(BinOp::Add, call(var("pause"), vec![]), lit(1)));
        let mut saw_suspend = false;
        loop {
            match c.run().unwrap() {
                RunOutcome::Suspended => saw_suspend = true,
                RunOutcome::Completed => break,
                RunOutcome::Terminated => panic!("unexpected termination"),
            }
        }
        assert!(saw_suspend);
        assert_eq!(c.pop_data(), Item::Int(6));
    }

    #[test]
    fn test_terminate_flag_stops_between_steps() {
        let mut c = ctx();
        c.push_entry(None);
        c.push_expr(lit(1));
        c.terminator().store(true, Ordering::Relaxed);
        assert_eq!(c.run().unwrap(), RunOutcome::Terminated);
    }

    #[test]
    fn test_call_main_runs_entry_function() {
        let mut c = ctx();
        let m = Module::new("m", "kes:/m");
        let f = Function::new(
            crate::module::MAIN_NAME,
            1,
            FuncBody::Syntactic(Arc::new(Stmt::Return(Some(lit(99))))),
        );
        m.add_mantra(crate::mantra::Mantra::Function(Arc::new(f)), false)
            .unwrap();
        assert_eq!(c.call_main(&m).unwrap(), Item::Int(99));
    }

    #[test]
    fn test_gc_roots_cover_data_and_binds() {
        let gc = Arc::new(Collector::new());
        let mut c = VmContext::new(1, Arc::clone(&gc), None);
        let kept = gc.store_item(HeapObject::Str("kept".to_string()));
        c.push_data(kept);
        let dropped = gc.store_item(HeapObject::Str("dropped".to_string()));
        gc.collect(&[&c]);
        assert!(gc.deref(&kept).is_some());
        assert!(gc.deref(&dropped).is_none());
    }
}
