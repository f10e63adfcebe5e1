//! Guest-function persistence: the capture-and-replay machinery that makes
//! a guest closure callable as a host function value from any thread.
//!
//! A capture is built once, at the function's first crossing into the host
//! value model. It records the closure's compiled form, its non-`_ENV`
//! upvalues by position, and weak references back to the origin session and
//! the attached environment. Invocation prefers the live closure when the
//! caller is the origin thread and the origin session is still up;
//! otherwise the closure is rebuilt from bytecode in the calling thread's
//! own session and the recorded upvalues are written back by position.

use std::sync::{Arc, Weak};

use crate::any::{Any, AnyWeak};
use crate::bridge::session::{ScriptVm, SessionCore};
use crate::bridge::{env, marshal, surface};
use crate::context;
use crate::engine::compiler::ENV_UPVAL;
use crate::engine::proto;
use crate::engine::value::Value;
use crate::error::ScriptError;

/// How a captured upvalue is reconstructed on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueKind {
    /// A genuine guest value; re-marshaled through the converter with
    /// native table expansion.
    Guest,
    /// A value that was already a bridged host value; pushed back as a
    /// foreign slot, no conversion.
    Bridged,
}

/// One captured upvalue. `index` is the closure's upvalue position at
/// capture time and is load-bearing: restore writes by exactly this index.
pub struct UpvalueSlot {
    pub index: usize,
    pub value: Any,
    pub kind: UpvalueKind,
}

/// The persisted form of a guest function. Immutable after construction;
/// any thread may read it without locking. Dropping the last host handle
/// deregisters the capture from the origin session's registry.
pub struct ClosureCapture {
    name: String,
    bytecode: Vec<u8>,
    upvalues: Vec<UpvalueSlot>,
    environment: Option<AnyWeak>,
    origin: Weak<SessionCore>,
    origin_id: u64,
    slot: u64,
}

impl Drop for ClosureCapture {
    fn drop(&mut self) {
        if let Some(core) = self.origin.upgrade() {
            core.release_slot(self.slot);
        }
    }
}

/// Wraps the guest function value as a host function backed by a fresh
/// capture. The live closure is pinned in the session's registry until the
/// returned handle (and all clones) are gone.
pub(crate) fn make_function_any(vm: &ScriptVm, value: &Value) -> Result<Any, ScriptError> {
    let environment_value = env::environment_of_value(value);
    let environment = environment_value
        .is_object()
        .then(|| environment_value.downgrade());

    let upvalues = dump_upvalues(vm, value)?;

    // bytecode is captured exactly once; native host functions have no
    // dumpable form and keep an empty blob, so a cross-thread restore of
    // one fails
    let bytecode = match value {
        Value::Closure(closure) => proto::dump(&closure.proto),
        _ => Vec::new(),
    };

    let slot = vm.pin_closure(value.clone());
    let name = format!("ScriptFunction<{:x}:{:x}>", vm.session_id(), slot);

    let capture = Arc::new(ClosureCapture {
        name: name.clone(),
        bytecode,
        upvalues,
        environment,
        origin: Arc::downgrade(vm.core()),
        origin_id: vm.session_id(),
        slot,
    });

    Ok(Any::function(name, move |args| {
        invoke_capture(&capture, args)
    }))
}

/// Enumerates a closure's upvalues, skipping the reserved `_ENV` slot.
/// Values that are already bridged host values keep their handle; genuine
/// guest values convert through the marshaler.
fn dump_upvalues(vm: &ScriptVm, value: &Value) -> Result<Vec<UpvalueSlot>, ScriptError> {
    let Value::Closure(closure) = value else {
        return Ok(Vec::new());
    };
    let mut slots = Vec::new();
    for (index, cell) in closure.upvals.iter().enumerate() {
        if closure.upvalue_name(index) == Some(ENV_UPVAL) {
            continue;
        }
        let current = cell.borrow().clone();
        let slot = match &current {
            Value::Foreign(any) => UpvalueSlot {
                index,
                value: any.clone(),
                kind: UpvalueKind::Bridged,
            },
            other => UpvalueSlot {
                index,
                value: marshal::host_from_value(vm, other)?,
                kind: UpvalueKind::Guest,
            },
        };
        slots.push(slot);
    }
    Ok(slots)
}

/// Writes captured upvalues back into the function at `func_idx` by
/// positional index. A missing slot on the restored function is reported
/// and skipped rather than failing the whole call.
pub(crate) fn store_upvalues(
    vm: &ScriptVm,
    func_idx: isize,
    upvalues: &[UpvalueSlot],
) -> Result<(), ScriptError> {
    for slot in upvalues {
        let value = match slot.kind {
            UpvalueKind::Bridged => Value::Foreign(slot.value.clone()),
            UpvalueKind::Guest => marshal::guest_from_host(vm, &slot.value, true)?,
        };
        if !vm.engine().set_upvalue_value(func_idx, slot.index, value) {
            surface::emit_log(
                "warn",
                &format!("restore: no upvalue slot {} on restored function", slot.index),
            );
        }
    }
    Ok(())
}

/// The host-side entry point of a captured function.
fn invoke_capture(capture: &ClosureCapture, args: &[Any]) -> Result<Any, String> {
    let vm = match ScriptVm::thread_local() {
        Ok(vm) => vm,
        Err(err) => return route(err.to_string()),
    };
    vm.prune_released();
    if vm.engine().is_dead() {
        return route("session has been shut down".to_string());
    }

    // live path requires the origin session to be this thread's session,
    // still alive, and still pinning the closure
    let live_value = capture
        .origin
        .upgrade()
        .filter(|core| core.is_alive() && capture.origin_id == vm.session_id())
        .and_then(|_| vm.pinned_value(capture.slot));

    let engine = vm.engine();
    let base = engine.top();
    let restored = live_value.is_none();

    let result = (|| -> Result<Any, String> {
        match live_value {
            Some(function) => engine.push_value(function),
            None => {
                if capture.bytecode.is_empty() {
                    return Err(format!(
                        "cannot restore function \"{}\": capture holds no bytecode",
                        capture.name
                    ));
                }
                engine
                    .load_bytecode(&capture.bytecode)
                    .map_err(|e| format!("load function \"{}\" bytecode error: {}", capture.name, e))?;
            }
        }
        let func_idx = engine.top() as isize;

        if let Some(environment) = capture.environment.as_ref().and_then(AnyWeak::upgrade) {
            env::set_environment(&vm, func_idx, &environment).map_err(|e| e.to_string())?;
        }
        if restored {
            store_upvalues(&vm, func_idx, &capture.upvalues).map_err(|e| e.to_string())?;
        }
        for arg in args {
            marshal::push_host(&vm, arg, false).map_err(|e| e.to_string())?;
        }
        engine.call(args.len())?;
        let converted = marshal::host_from_stack(&vm, -1).map_err(|e| e.to_string());
        engine.pop_n(1);
        converted
    })();

    match result {
        Ok(value) => Ok(value),
        Err(message) => {
            // leave the stack as we found it before reporting
            let depth = engine.top();
            if depth > base {
                engine.pop_n(depth - base);
            }
            route(message)
        }
    }
}

/// Applies the process-wide exception handler convention: with a handler
/// installed the failure is delivered there and the call yields undefined;
/// otherwise it propagates to the caller.
fn route(message: String) -> Result<Any, String> {
    match context::route_failure(&message) {
        Some(fallback) => Ok(fallback),
        None => Err(message),
    }
}
