//! The bidirectional value converter between the host value model and
//! guest runtime values.
//!
//! Both directions are exhaustive over their source's closed tag set; a
//! guest value with no host form fails loudly rather than coercing. Two
//! conversions are intentionally lossy: the integer/double disambiguation
//! below, and the host→guest collapse of wide integers into the guest's
//! single numeric type.

use crate::any::{Any, AnyType};
use crate::bridge::function;
use crate::bridge::session::ScriptVm;
use crate::bridge::table::ScriptTable;
use crate::engine::value::{Value, type_name};
use crate::error::ScriptError;

/// Fractional distance from the floor below which a guest number is
/// classified as a 64-bit integer. The guest engine has a single numeric
/// type, so this heuristic is the only signal; a fractional value closer
/// than this to the next-lower integer silently rounds down.
pub const NUMBER_INT_EPS: f64 = 1e-6;

/// Converts the guest stack slot at `idx` to a host value. An index one
/// past the top reads as an absent slot and converts to undefined.
pub fn host_from_stack(vm: &ScriptVm, idx: isize) -> Result<Any, ScriptError> {
    match vm.engine().value_at(idx) {
        None => Ok(Any::undefined()),
        Some(value) => host_from_value(vm, &value),
    }
}

/// Converts a guest value to a host value.
pub fn host_from_value(vm: &ScriptVm, value: &Value) -> Result<Any, ScriptError> {
    match value {
        Value::Nil => Ok(Any::null()),
        Value::Boolean(b) => Ok(Any::from(*b)),
        Value::Number(n) => {
            if n - n.floor() < NUMBER_INT_EPS {
                Ok(Any::from(*n as i64))
            } else {
                Ok(Any::from(*n))
            }
        }
        Value::String(s) => Ok(Any::string(s.to_string())),
        Value::Table(table) => {
            // snapshot at the moment of conversion, not a live view
            let pairs = table.borrow().entries().to_vec();
            let snapshot = ScriptTable::new();
            for (k, v) in &pairs {
                let key = host_from_value(vm, k)?;
                let value = host_from_value(vm, v)?;
                snapshot.set_item(&key, &value);
            }
            Ok(snapshot.into_any())
        }
        Value::Closure(_) | Value::Native(_) => function::make_function_any(vm, value),
        Value::Foreign(any) => Ok(any.clone()),
        Value::Pointer(_) => Err(ScriptError::marshal(format!(
            "unsupported guest type crossing the boundary: {}",
            type_name(value)
        ))),
    }
}

/// Converts a host value and pushes exactly one guest stack slot.
pub fn push_host(vm: &ScriptVm, value: &Any, prefer_native_table: bool) -> Result<(), ScriptError> {
    let guest = guest_from_host(vm, value, prefer_native_table)?;
    vm.engine().push_value(guest);
    Ok(())
}

/// Converts a host value to a guest value.
///
/// With `prefer_native_table` set, an ordered-table payload re-expands into
/// a native guest table recursively; otherwise it crosses as an opaque
/// foreign slot like every other reference tag.
pub fn guest_from_host(
    vm: &ScriptVm,
    value: &Any,
    prefer_native_table: bool,
) -> Result<Value, ScriptError> {
    let guest = match value.type_tag() {
        AnyType::Undefined | AnyType::Null => Value::Nil,
        AnyType::Boolean => Value::Boolean(value.as_bool().unwrap_or(false)),
        AnyType::Int8 | AnyType::Int16 | AnyType::Int32 | AnyType::Int64 => {
            // wide integers land in the guest's single numeric type; values
            // beyond its exact range lose precision
            Value::Number(value.as_i64().unwrap_or(0) as f64)
        }
        AnyType::Float | AnyType::Double => Value::Number(value.as_f64().unwrap_or(0.0)),
        AnyType::String => Value::String(value.as_str().unwrap_or_default().into()),
        AnyType::UserObject if prefer_native_table => {
            match value.downcast_user::<ScriptTable>() {
                Some(table) => expand_table(vm, table)?,
                None => Value::Foreign(value.clone()),
            }
        }
        AnyType::Array
        | AnyType::Object
        | AnyType::Function
        | AnyType::Class
        | AnyType::Property
        | AnyType::Enum
        | AnyType::Exception
        | AnyType::UserObject
        | AnyType::Caller => Value::Foreign(value.clone()),
    };
    Ok(guest)
}

fn expand_table(vm: &ScriptVm, table: &ScriptTable) -> Result<Value, ScriptError> {
    let out = vm.engine().new_table();
    for (k, v) in table.pairs() {
        let key = guest_from_host(vm, &k, true)?;
        let value = guest_from_host(vm, &v, true)?;
        out.borrow_mut()
            .set(key, value)
            .map_err(ScriptError::marshal)?;
    }
    Ok(Value::Table(out))
}
