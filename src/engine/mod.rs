pub mod ast;
pub mod compiler;
pub mod gc;
pub mod lexer;
pub mod parser;
pub mod proto;
pub mod value;
pub mod vm;

use std::cell::{Cell as StdCell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::any::Any;
use crate::engine::gc::{GcAccount, GcStats};
use crate::engine::proto::Proto;
use crate::engine::value::{Cell, Closure, NativeFn, Table, TableRef, Value};
use crate::engine::vm::Frame;

/// Dispatch seam for operations on bridged host values that need the
/// marshaling layer: invocation and member access. Pure value operations
/// (display, equality, length) are handled by the engine directly.
pub trait ForeignOps {
    fn call(&self, target: &Any, args: Vec<Value>) -> Result<Value, String>;

    fn index(&self, target: &Any, key: &Value) -> Result<Value, String>;

    fn set_index(&self, target: &Any, key: &Value, value: Value) -> Result<(), String>;
}

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// One guest engine instance: value stack, call frames, globals, collector
/// accounting, and the foreign dispatch hook.
///
/// All methods take `&self`; interior mutability keeps the engine
/// re-entrant, so a native function invoked mid-run can call back into the
/// same engine. Instances are not `Send` and must stay on the thread that
/// created them.
pub struct Engine {
    id: u64,
    stack: RefCell<Vec<Value>>,
    frames: RefCell<Vec<Frame>>,
    globals: RefCell<TableRef>,
    gc: RefCell<GcAccount>,
    foreign: RefCell<Option<Rc<dyn ForeignOps>>>,
    dead: StdCell<bool>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            stack: RefCell::new(Vec::new()),
            frames: RefCell::new(Vec::new()),
            globals: RefCell::new(Rc::new(RefCell::new(Table::new()))),
            gc: RefCell::new(GcAccount::new()),
            foreign: RefCell::new(None),
            dead: StdCell::new(false),
        }
    }

    /// Engine-instance identity; what session equality compares.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_dead(&self) -> bool {
        self.dead.get()
    }

    pub(crate) fn ensure_alive(&self) -> Result<(), String> {
        if self.dead.get() {
            Err("engine instance has been shut down".to_string())
        } else {
            Ok(())
        }
    }

    /// Irreversibly invalidates the instance: clears the stack, frames,
    /// globals, and collector registry. Later operations fail.
    pub fn shutdown(&self) {
        self.dead.set(true);
        self.stack.borrow_mut().clear();
        self.frames.borrow_mut().clear();
        *self.globals.borrow_mut() = Rc::new(RefCell::new(Table::new()));
        self.gc.borrow_mut().clear();
        *self.foreign.borrow_mut() = None;
    }

    pub fn globals(&self) -> TableRef {
        self.globals.borrow().clone()
    }

    pub fn set_foreign_ops(&self, ops: Rc<dyn ForeignOps>) {
        *self.foreign.borrow_mut() = Some(ops);
    }

    pub(crate) fn foreign_ops(&self) -> Option<Rc<dyn ForeignOps>> {
        self.foreign.borrow().clone()
    }

    pub fn set_global(&self, name: &str, value: Value) {
        let globals = self.globals();
        let _ = globals
            .borrow_mut()
            .set(Value::String(name.into()), value);
    }

    pub fn get_global(&self, name: &str) -> Value {
        self.globals().borrow().raw_get(&Value::String(name.into()))
    }

    pub fn register_native<F>(&self, name: &str, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + 'static,
    {
        let f: NativeFn = Rc::new(f);
        self.set_global(name, Value::Native(f));
    }

    /// Allocates a collector-tracked table.
    pub fn new_table(&self) -> TableRef {
        let table = Rc::new(RefCell::new(Table::new()));
        let mut gc = self.gc.borrow_mut();
        gc.track_table(Rc::downgrade(&table));
        if gc.should_collect() {
            gc.collect();
        }
        table
    }

    pub(crate) fn new_closure(&self, proto: Rc<Proto>, upvals: Vec<Cell>) -> Rc<Closure> {
        let closure = Rc::new(Closure { proto, upvals });
        let mut gc = self.gc.borrow_mut();
        gc.track_closure(Rc::downgrade(&closure));
        if gc.should_collect() {
            gc.collect();
        }
        closure
    }

    // ---- stack surface -------------------------------------------------

    /// Current stack depth; also the absolute index of the top slot.
    pub fn top(&self) -> usize {
        self.stack.borrow().len()
    }

    pub fn push_value(&self, v: Value) {
        self.stack.borrow_mut().push(v);
    }

    pub fn pop_value(&self) -> Value {
        self.stack.borrow_mut().pop().unwrap_or(Value::Nil)
    }

    pub fn pop_n(&self, n: usize) {
        let mut stack = self.stack.borrow_mut();
        let new_len = stack.len().saturating_sub(n);
        stack.truncate(new_len);
    }

    /// Resolves an index to a zero-based stack offset. Positive indices are
    /// 1-based from the bottom, negative from the top (`-1` is the top).
    fn abs_index(&self, idx: isize) -> Result<usize, String> {
        let len = self.stack.borrow().len() as isize;
        let abs = if idx > 0 { idx - 1 } else { len + idx };
        if abs < 0 || abs >= len {
            return Err(format!("stack index {} out of range (depth {})", idx, len));
        }
        Ok(abs as usize)
    }

    /// Reads the value at a stack index. An index one past the top reads as
    /// an absent slot (`None`), which the marshaler maps to undefined.
    pub fn value_at(&self, idx: isize) -> Option<Value> {
        let abs = self.abs_index(idx).ok()?;
        Some(self.stack.borrow()[abs].clone())
    }

    // ---- chunk loading -------------------------------------------------

    /// Compiles source text and pushes the resulting chunk closure.
    pub fn load_source(&self, source: &str, chunk_name: &str) -> Result<(), String> {
        self.ensure_alive()?;
        let proto = compiler::compile_chunk(source, chunk_name)?;
        let closure = self.instantiate(Rc::new(proto));
        self.push_value(Value::Closure(closure));
        Ok(())
    }

    /// Loads serialized bytecode and pushes the resulting closure. Upvalue
    /// cells start out nil except the reserved `_ENV` slot, which binds to
    /// this engine's global table.
    pub fn load_bytecode(&self, bytes: &[u8]) -> Result<(), String> {
        self.ensure_alive()?;
        let proto = proto::load(bytes)?;
        let closure = self.instantiate(Rc::new(proto));
        self.push_value(Value::Closure(closure));
        Ok(())
    }

    /// Compiles source to serialized bytecode without running it.
    pub fn compile_source(
        &self,
        source: &str,
        chunk_name: &str,
        strip_debug: bool,
    ) -> Result<Vec<u8>, String> {
        self.ensure_alive()?;
        let compiled = compiler::compile_chunk(source, chunk_name)?;
        let compiled = if strip_debug {
            compiled.strip_debug()
        } else {
            compiled
        };
        Ok(proto::dump(&compiled))
    }

    fn instantiate(&self, proto: Rc<Proto>) -> Rc<Closure> {
        let upvals: Vec<Cell> = proto
            .upvals
            .iter()
            .map(|desc| {
                let initial = if desc.name == compiler::ENV_UPVAL {
                    Value::Table(self.globals())
                } else {
                    Value::Nil
                };
                Rc::new(RefCell::new(initial))
            })
            .collect();
        self.new_closure(proto, upvals)
    }

    /// Serializes the function at the given stack index. Only guest
    /// closures have a dumpable form.
    pub fn dump_function(&self, idx: isize) -> Result<Vec<u8>, String> {
        match self.value_at(idx) {
            Some(Value::Closure(c)) => Ok(proto::dump(&c.proto)),
            Some(other) => Err(format!(
                "cannot dump a {} value",
                value::type_name(&other)
            )),
            None => Err("no function at the given stack index".to_string()),
        }
    }

    // ---- upvalue introspection ----------------------------------------

    fn closure_at(&self, idx: isize) -> Result<Rc<Closure>, String> {
        match self.value_at(idx) {
            Some(Value::Closure(c)) => Ok(c),
            Some(other) => Err(format!(
                "expected a function at index {}, found {}",
                idx,
                value::type_name(&other)
            )),
            None => Err(format!("no value at stack index {}", idx)),
        }
    }

    pub fn upvalue_count(&self, idx: isize) -> usize {
        self.closure_at(idx).map(|c| c.upvals.len()).unwrap_or(0)
    }

    pub fn upvalue_name(&self, idx: isize, n: usize) -> Option<String> {
        let closure = self.closure_at(idx).ok()?;
        closure.upvalue_name(n).map(str::to_string)
    }

    /// Index of the upvalue with the given name, if the function has one.
    pub fn find_upvalue(&self, idx: isize, name: &str) -> Option<usize> {
        let closure = self.closure_at(idx).ok()?;
        closure
            .proto
            .upvals
            .iter()
            .position(|u| u.name == name)
    }

    pub fn get_upvalue(&self, idx: isize, n: usize) -> Option<Value> {
        let closure = self.closure_at(idx).ok()?;
        closure.upvals.get(n).map(|cell| cell.borrow().clone())
    }

    /// Writes through the upvalue cell, so every closure sharing the cell
    /// observes the new value.
    pub fn set_upvalue_value(&self, idx: isize, n: usize, v: Value) -> bool {
        let Ok(closure) = self.closure_at(idx) else {
            return false;
        };
        match closure.upvals.get(n) {
            Some(cell) => {
                *cell.borrow_mut() = v;
                true
            }
            None => false,
        }
    }

    // ---- collector controls -------------------------------------------

    pub fn gc_collect(&self) -> usize {
        self.gc.borrow_mut().collect()
    }

    pub fn gc_step(&self, kb: i32) -> bool {
        self.gc.borrow_mut().step(kb)
    }

    pub fn gc_set_pause(&self, pause: i32) -> i32 {
        self.gc.borrow_mut().set_pause(pause)
    }

    pub fn gc_set_step_mul(&self, step_mul: i32) -> i32 {
        self.gc.borrow_mut().set_step_mul(step_mul)
    }

    pub fn gc_stop(&self) {
        self.gc.borrow_mut().stop()
    }

    pub fn gc_restart(&self) {
        self.gc.borrow_mut().restart()
    }

    pub fn gc_is_running(&self) -> bool {
        self.gc.borrow().is_running()
    }

    pub fn gc_count_kb(&self) -> i32 {
        self.gc.borrow().count_kb()
    }

    pub fn gc_set_mode(&self, mode: gc::GcMode) {
        self.gc.borrow_mut().set_mode(mode)
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.borrow().stats()
    }

    pub(crate) fn with_frames<R>(&self, f: impl FnOnce(&mut Vec<Frame>) -> R) -> R {
        f(&mut self.frames.borrow_mut())
    }

    pub(crate) fn with_stack<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> R {
        f(&mut self.stack.borrow_mut())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Engine {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
