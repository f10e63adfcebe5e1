use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::any::Any;
use crate::engine::proto::Proto;

pub type TableRef = Rc<RefCell<Table>>;
pub type Cell = Rc<RefCell<Value>>;
pub type NativeFn = Rc<dyn Fn(&[Value]) -> Result<Value, String>>;

/// A guest runtime value.
///
/// The engine has a single numeric type; integers pushed by the embedder
/// arrive as `Number`, which is what forces the marshaler's integer/double
/// disambiguation heuristic on the way back out.
///
/// `Foreign` carries a bridged host value; `Pointer` is the native-only
/// escape hatch (an opaque embedder address) that the marshaler refuses to
/// convert.
#[derive(Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    Table(TableRef),
    Closure(Rc<Closure>),
    Native(NativeFn),
    Foreign(Any),
    Pointer(usize),
}

/// A guest closure: compiled prototype plus positional upvalue cells.
///
/// Upvalues are shared mutable cells; a closure created inside another
/// function aliases the enclosing frame's cells, so mutations on either
/// side stay visible. Slot order matches `proto.upvals` and is load-bearing
/// for the bridge's capture/restore protocol.
pub struct Closure {
    pub proto: Rc<Proto>,
    pub upvals: Vec<Cell>,
}

impl Closure {
    pub fn upvalue_name(&self, index: usize) -> Option<&str> {
        self.proto.upvals.get(index).map(|u| u.name.as_str())
    }
}

/// Insertion-ordered table of guest key/value pairs.
///
/// `fallback` is consulted when a lookup misses, which is how the
/// environment proxy chains to the true global table. Writes always land in
/// this table, never in the fallback.
#[derive(Default)]
pub struct Table {
    entries: Vec<(Value, Value)>,
    pub fallback: Option<TableRef>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn pair_count(&self) -> usize {
        self.entries.len()
    }

    /// Raw lookup without the fallback chain.
    pub fn raw_get(&self, key: &Value) -> Value {
        for (k, v) in &self.entries {
            if keys_equal(k, key) {
                return v.clone();
            }
        }
        Value::Nil
    }

    /// Lookup following the fallback chain on a miss.
    pub fn get(&self, key: &Value) -> Value {
        let hit = self.raw_get(key);
        if !matches!(hit, Value::Nil) {
            return hit;
        }
        let mut next = self.fallback.clone();
        while let Some(table) = next {
            let table = table.borrow();
            let hit = table.raw_get(key);
            if !matches!(hit, Value::Nil) {
                return hit;
            }
            next = table.fallback.clone();
        }
        Value::Nil
    }

    /// Insert or replace; a nil value deletes the key.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), String> {
        if matches!(key, Value::Nil) {
            return Err("table index is nil".to_string());
        }
        if let Value::Number(n) = key {
            if n.is_nan() {
                return Err("table index is NaN".to_string());
            }
        }
        if matches!(value, Value::Nil) {
            self.entries.retain(|(k, _)| !keys_equal(k, &key));
            return Ok(());
        }
        for slot in &mut self.entries {
            if keys_equal(&slot.0, &key) {
                slot.1 = value;
                return Ok(());
            }
        }
        self.entries.push((key, value));
        Ok(())
    }

    /// Sequence length: the number of consecutive integer keys from 1.
    pub fn seq_len(&self) -> usize {
        let mut n = 0usize;
        loop {
            let key = Value::Number((n + 1) as f64);
            if matches!(self.raw_get(&key), Value::Nil) {
                return n;
            }
            n += 1;
        }
    }
}

/// Key equality: scalars by value, reference values by identity.
pub fn keys_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Table(x), Value::Table(y)) => Rc::ptr_eq(x, y),
        (Value::Closure(x), Value::Closure(y)) => Rc::ptr_eq(x, y),
        (Value::Native(x), Value::Native(y)) => Rc::ptr_eq(x, y),
        (Value::Foreign(x), Value::Foreign(y)) => x.identity() == y.identity(),
        (Value::Pointer(x), Value::Pointer(y)) => x == y,
        _ => false,
    }
}

/// Runtime equality as seen by the `==` operator. Scalars and identities as
/// for keys, plus host equality between two foreign values.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Foreign(x), Value::Foreign(y)) => x == y,
        _ => keys_equal(a, b),
    }
}

pub fn is_truthy(v: &Value) -> bool {
    !matches!(v, Value::Nil | Value::Boolean(false))
}

/// Canonical runtime type label used in error messages and by `type()`.
pub fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Nil => "nil",
        Value::Boolean(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Table(_) => "table",
        Value::Closure(_) | Value::Native(_) => "function",
        Value::Foreign(_) => "userdata",
        Value::Pointer(_) => "pointer",
    }
}

/// Number rendering shared by `tostring`, concatenation, and table display:
/// integral values print without a trailing `.0`.
pub fn number_text(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

pub fn display_value(v: &Value) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => number_text(*n),
        Value::String(s) => s.to_string(),
        Value::Table(t) => format!("table: {:p}", Rc::as_ptr(t)),
        Value::Closure(c) => format!("function: {:p}", Rc::as_ptr(c)),
        Value::Native(f) => format!("function: builtin {:p}", Rc::as_ptr(f)),
        Value::Foreign(a) => a.to_display(),
        Value::Pointer(p) => format!("pointer: 0x{:x}", p),
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", display_value(other)),
        }
    }
}
