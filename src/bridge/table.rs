//! Host-side snapshot of a guest table.
//!
//! A `ScriptTable` keeps guest table data alive outside the engine so it can
//! be shared and passed between threads. Pairs keep insertion order; key
//! equality is by value for scalar tags and by payload identity for
//! reference tags. The table travels through the value model as a
//! `UserObject`.

use std::sync::{Arc, RwLock};

use crate::any::{Any, AnyType, UserObject};
use crate::bytes::ByteBuf;
use crate::error::ScriptError;

pub struct ScriptTable {
    entries: RwLock<Vec<(Any, Any)>>,
}

impl Default for ScriptTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ScriptTable {
    fn clone(&self) -> Self {
        Self {
            entries: RwLock::new(self.pairs()),
        }
    }
}

impl UserObject for ScriptTable {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn type_name(&self) -> &'static str {
        "ScriptTable"
    }

    fn to_display(&self) -> String {
        self.to_string()
    }

    fn size(&self) -> usize {
        self.len()
    }
}

/// Key equality: nullish keys match their own tag, the scalar tags match by
/// value, and everything else matches by payload identity. The comparison
/// is tag-exact, so an `Int32` key never aliases an `Int64` key.
fn keys_match(a: &Any, b: &Any) -> bool {
    if a.type_tag() != b.type_tag() {
        return false;
    }
    match a.type_tag() {
        AnyType::Undefined | AnyType::Null => true,
        AnyType::Boolean
        | AnyType::Int32
        | AnyType::Int64
        | AnyType::Float
        | AnyType::Double
        | AnyType::String => a == b,
        _ => a.identity() == b.identity(),
    }
}

fn unquoted(v: &Any) -> bool {
    matches!(
        v.type_tag(),
        AnyType::Int32 | AnyType::Int64 | AnyType::Float | AnyType::Double | AnyType::Boolean
    ) || v.downcast_user::<ScriptTable>().is_some()
}

impl ScriptTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn from_pairs(pairs: Vec<(Any, Any)>) -> Self {
        Self {
            entries: RwLock::new(pairs),
        }
    }

    /// Wraps this table as an `Any` user-object handle.
    pub fn into_any(self) -> Any {
        Any::user_object(Arc::new(self))
    }

    /// Rebuilds a table from a host array or object; nested containers
    /// become nested tables. Arrays map to 1-based integer keys.
    pub fn from_any(value: &Any) -> ScriptTable {
        if let Some(table) = value.downcast_user::<ScriptTable>() {
            return table.clone();
        }
        let table = ScriptTable::new();
        if value.is_array() {
            for (i, item) in value.array_items().into_iter().enumerate() {
                let key = Any::from((i + 1) as i64);
                if item.is_array() || item.is_object() {
                    table.set_item(&key, &ScriptTable::from_any(&item).into_any());
                } else {
                    table.set_item(&key, &item);
                }
            }
        } else if value.is_object() {
            for (k, v) in value.object_pairs() {
                let key = Any::string(k);
                if v.is_array() || v.is_object() {
                    table.set_item(&key, &ScriptTable::from_any(&v).into_any());
                } else {
                    table.set_item(&key, &v);
                }
            }
        }
        table
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pairs(&self) -> Vec<(Any, Any)> {
        self.entries.read().expect("table lock").clone()
    }

    /// Lookup by key; a missing key reads as null.
    pub fn get_item(&self, key: &Any) -> Any {
        let entries = self.entries.read().expect("table lock");
        entries
            .iter()
            .find(|(k, _)| keys_match(k, key))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(Any::null)
    }

    /// Insert or replace; writing null or undefined deletes the key.
    pub fn set_item(&self, key: &Any, value: &Any) {
        if value.is_nullish() {
            self.del_item(key);
            return;
        }
        let mut entries = self.entries.write().expect("table lock");
        for slot in entries.iter_mut() {
            if keys_match(&slot.0, key) {
                slot.1 = value.clone();
                return;
            }
        }
        entries.push((key.clone(), value.clone()));
    }

    pub fn del_item(&self, key: &Any) {
        let mut entries = self.entries.write().expect("table lock");
        if let Some(pos) = entries.iter().position(|(k, _)| keys_match(k, key)) {
            entries.remove(pos);
        }
    }

    /// Whether the key set qualifies for array conversion: every key an
    /// integer (an empty table counts).
    pub fn is_array(&self) -> bool {
        self.entries
            .read()
            .expect("table lock")
            .iter()
            .all(|(k, _)| matches!(k.type_tag(), AnyType::Int32 | AnyType::Int64))
    }

    /// Array conversion: integer keys are sorted and must start at 0 or 1;
    /// the produced sequence stops at the first gap.
    pub fn to_array(&self) -> Any {
        let mut keyed: Vec<(i64, Any)> = self
            .entries
            .read()
            .expect("table lock")
            .iter()
            .filter_map(|(k, v)| {
                matches!(k.type_tag(), AnyType::Int32 | AnyType::Int64)
                    .then(|| (k.as_i64().unwrap_or(0), v.clone()))
            })
            .collect();
        let array = Any::array();
        if keyed.is_empty() {
            return array;
        }
        keyed.sort_by_key(|(k, _)| *k);

        let origin = keyed[0].0;
        if origin != 0 && origin != 1 {
            return array;
        }
        let mut expected = origin;
        for (k, v) in keyed {
            if k != expected {
                break;
            }
            let item = match v.downcast_user::<ScriptTable>() {
                Some(nested) => nested.to_object(),
                None => v,
            };
            let _ = array.push_back(item);
            expected += 1;
        }
        array
    }

    /// Object conversion. Arrays convert via [`Self::to_array`]; otherwise
    /// only string keys carry over and nested tables convert recursively.
    pub fn to_object(&self) -> Any {
        if self.is_array() {
            return self.to_array();
        }
        let obj = Any::object();
        for (k, v) in self.pairs() {
            if !k.is_string() {
                continue;
            }
            let value = match v.downcast_user::<ScriptTable>() {
                Some(nested) => nested.to_object(),
                None => v,
            };
            let _ = obj.set_item(&k, value);
        }
        obj
    }

    pub fn to_json_string(&self) -> String {
        crate::any::json::to_json_string(&self.to_object())
    }

    pub fn iterator(self: &Arc<Self>) -> ScriptTableIter {
        ScriptTableIter::new(self.clone())
    }

    /// Recursive binary serialization. Each pair writes a nested-table tag
    /// byte per slot: 1 for a nested table, 0 for a scalar payload.
    pub fn write_to(&self, buf: &mut ByteBuf) -> Result<(), ScriptError> {
        let entries = self.pairs();
        buf.write_u32(entries.len() as u32);
        for (k, v) in &entries {
            write_slot(buf, k)?;
            write_slot(buf, v)?;
        }
        Ok(())
    }

    pub fn read_from(buf: &mut ByteBuf) -> Result<ScriptTable, ScriptError> {
        let count = buf
            .read_u32()
            .ok_or_else(|| ScriptError::marshal("truncated table payload"))?;
        let mut pairs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = read_slot(buf)?;
            let value = read_slot(buf)?;
            pairs.push((key, value));
        }
        Ok(ScriptTable::from_pairs(pairs))
    }
}

fn write_slot(buf: &mut ByteBuf, value: &Any) -> Result<(), ScriptError> {
    if let Some(nested) = value.downcast_user::<ScriptTable>() {
        buf.write_u8(1);
        return nested.write_to(buf);
    }
    buf.write_u8(0);
    write_scalar(buf, value)
}

fn read_slot(buf: &mut ByteBuf) -> Result<Any, ScriptError> {
    let tag = buf
        .read_u8()
        .ok_or_else(|| ScriptError::marshal("truncated table payload"))?;
    if tag == 1 {
        return Ok(ScriptTable::read_from(buf)?.into_any());
    }
    read_scalar(buf)
}

fn write_scalar(buf: &mut ByteBuf, value: &Any) -> Result<(), ScriptError> {
    match value.type_tag() {
        AnyType::Undefined => buf.write_u8(0),
        AnyType::Null => buf.write_u8(1),
        AnyType::Boolean => {
            buf.write_u8(2);
            buf.write_u8(value.as_bool().unwrap_or(false) as u8);
        }
        AnyType::Int8 | AnyType::Int16 | AnyType::Int32 | AnyType::Int64 => {
            buf.write_u8(3);
            buf.write_i64(value.as_i64().unwrap_or(0));
        }
        AnyType::Float | AnyType::Double => {
            buf.write_u8(4);
            buf.write_f64(value.as_f64().unwrap_or(0.0));
        }
        AnyType::String => {
            buf.write_u8(5);
            buf.write_str(value.as_str().unwrap_or_default());
        }
        other => {
            return Err(ScriptError::marshal(format!(
                "cannot serialize a {} value into a table payload",
                other.name()
            )));
        }
    }
    Ok(())
}

fn read_scalar(buf: &mut ByteBuf) -> Result<Any, ScriptError> {
    let bad = || ScriptError::marshal("truncated table payload");
    let tag = buf.read_u8().ok_or_else(bad)?;
    Ok(match tag {
        0 => Any::undefined(),
        1 => Any::null(),
        2 => Any::from(buf.read_u8().ok_or_else(bad)? != 0),
        3 => Any::from(buf.read_i64().ok_or_else(bad)?),
        4 => Any::from(buf.read_f64().ok_or_else(bad)?),
        5 => Any::string(buf.read_str().ok_or_else(bad)?),
        other => {
            return Err(ScriptError::marshal(format!(
                "unknown table payload tag {}",
                other
            )));
        }
    })
}

impl std::fmt::Display for ScriptTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.pairs().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if unquoted(k) {
                write!(f, "[{}]=", k.to_display())?;
            } else {
                write!(f, "[\"{}\"]=", k.to_display())?;
            }
            if unquoted(v) {
                write!(f, "{}", v.to_display())?;
            } else {
                write!(f, "\"{}\"", v.to_display())?;
            }
        }
        write!(f, "}}")
    }
}

/// Bidirectional cursor over a table, following the host value model's
/// iterator convention. `remove` deletes the element most recently returned
/// by `next` or `previous`.
pub struct ScriptTableIter {
    table: Arc<ScriptTable>,
    pos: usize,
    last: Option<usize>,
}

impl ScriptTableIter {
    fn new(table: Arc<ScriptTable>) -> Self {
        Self {
            table,
            pos: 0,
            last: None,
        }
    }

    pub fn has_next(&self) -> bool {
        self.pos < self.table.len()
    }

    pub fn next(&mut self) -> Option<(Any, Any)> {
        let entries = self.table.entries.read().expect("table lock");
        let pair = entries.get(self.pos).cloned()?;
        self.last = Some(self.pos);
        self.pos += 1;
        Some(pair)
    }

    pub fn has_previous(&self) -> bool {
        self.pos > 0
    }

    pub fn previous(&mut self) -> Option<(Any, Any)> {
        if self.pos == 0 {
            return None;
        }
        self.pos -= 1;
        self.last = Some(self.pos);
        let entries = self.table.entries.read().expect("table lock");
        entries.get(self.pos).cloned()
    }

    pub fn remove(&mut self) {
        let Some(last) = self.last.take() else {
            return;
        };
        let mut entries = self.table.entries.write().expect("table lock");
        if last < entries.len() {
            entries.remove(last);
            if self.pos > last {
                self.pos -= 1;
            }
        }
    }

    pub fn to_front(&mut self) {
        self.pos = 0;
        self.last = None;
    }

    pub fn to_back(&mut self) {
        self.pos = self.table.len();
        self.last = None;
    }
}
