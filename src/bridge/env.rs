//! Environment binding: per-chunk isolated global lookup with read-through
//! to the true globals.
//!
//! Attaching builds a proxy table whose fallback chain points at the
//! engine's global table, stores the host environment object under a
//! reserved field, and copies each of its fields as top-level bindings so
//! script code sees them as bare names. The proxy replaces the function's
//! reserved `_ENV` upvalue; a function with no `_ENV` upvalue has no free
//! global references, so attaching is a no-op.

use crate::any::Any;
use crate::bridge::marshal;
use crate::bridge::session::ScriptVm;
use crate::engine::compiler::ENV_UPVAL;
use crate::engine::value::{TableRef, Value};
use crate::error::ScriptError;

/// Reserved proxy-table field holding the bridged environment object.
pub const ENV_FIELD: &str = "__env";

/// Attaches `environment` to the function at `func_idx`. Re-attaching
/// replaces the previous proxy and its recorded fields.
pub fn set_environment(
    vm: &ScriptVm,
    func_idx: isize,
    environment: &Any,
) -> Result<(), ScriptError> {
    let engine = vm.engine();
    let Some(slot) = engine.find_upvalue(func_idx, ENV_UPVAL) else {
        return Ok(());
    };

    let proxy = engine.new_table();
    proxy.borrow_mut().fallback = Some(engine.globals());

    if environment.is_object() {
        proxy
            .borrow_mut()
            .set(
                Value::String(ENV_FIELD.into()),
                Value::Foreign(environment.clone()),
            )
            .map_err(ScriptError::marshal)?;
        for (name, value) in environment.object_pairs() {
            let guest = marshal::guest_from_host(vm, &value, false)?;
            proxy
                .borrow_mut()
                .set(Value::String(name.as_str().into()), guest)
                .map_err(ScriptError::marshal)?;
        }
    }

    engine.set_upvalue_value(func_idx, slot, Value::Table(proxy));
    Ok(())
}

/// Recovers the environment object attached to the function at `func_idx`.
/// Absence (no `_ENV` upvalue, no proxy, or a reclaimed object) reads as
/// undefined.
pub fn get_environment(vm: &ScriptVm, func_idx: isize) -> Any {
    let engine = vm.engine();
    let Some(slot) = engine.find_upvalue(func_idx, ENV_UPVAL) else {
        return Any::undefined();
    };
    match engine.get_upvalue(func_idx, slot) {
        Some(Value::Table(table)) => environment_field(&table),
        _ => Any::undefined(),
    }
}

/// Value-level variant used while capturing a closure that is not on the
/// stack.
pub(crate) fn environment_of_value(value: &Value) -> Any {
    let Value::Closure(closure) = value else {
        return Any::undefined();
    };
    let Some(index) = closure
        .proto
        .upvals
        .iter()
        .position(|u| u.name == ENV_UPVAL)
    else {
        return Any::undefined();
    };
    match &*closure.upvals[index].borrow() {
        Value::Table(table) => environment_field(table),
        _ => Any::undefined(),
    }
}

fn environment_field(table: &TableRef) -> Any {
    match table.borrow().raw_get(&Value::String(ENV_FIELD.into())) {
        Value::Foreign(any) if any.is_object() => any,
        _ => Any::undefined(),
    }
}
