//! The bridge surface registered into every new session: globals the guest
//! can call, the `Any` constructor namespace, and the dispatch hook that
//! gives foreign slots their member-access and invocation behavior.

use std::rc::Rc;

use crate::any::{Any, AnyType};
use crate::bridge::marshal;
use crate::bridge::session::ScriptVm;
use crate::bridge::table::ScriptTable;
use crate::engine::ForeignOps;
use crate::engine::value::{NativeFn, Value, display_value, type_name};

/// Level-prefixed diagnostics channel shared by the guest-visible log
/// functions and the bridge's own warnings.
pub fn emit_log(level: &str, message: &str) {
    eprintln!("[lys:{}] {}", level, message);
}

/// Installs natives, the `Any` namespace, and foreign dispatch into a
/// freshly created session. Runs once, at session boot.
pub(crate) fn install(vm: &ScriptVm) {
    let engine = vm.engine();

    engine.register_native("print", |args| {
        let parts: Vec<String> = args.iter().map(display_value).collect();
        println!("{}", parts.join("\t"));
        Ok(Value::Nil)
    });

    engine.register_native("tostring", |args| {
        let value = args.first().unwrap_or(&Value::Nil);
        Ok(Value::String(display_value(value).into()))
    });

    engine.register_native("type", |args| {
        let value = args.first().unwrap_or(&Value::Nil);
        Ok(Value::String(type_name(value).into()))
    });

    for level in ["log", "logw", "loge"] {
        let tag = match level {
            "logw" => "warn",
            "loge" => "error",
            _ => "info",
        };
        engine.register_native(level, move |args| {
            let parts: Vec<String> = args.iter().map(display_value).collect();
            emit_log(tag, &parts.join("\t"));
            Ok(Value::Nil)
        });
    }

    engine.register_native("requirels", |args| {
        let vm = ScriptVm::thread_local().map_err(|e| e.to_string())?;
        let name = match args.first() {
            Some(Value::String(name)) => name.to_string(),
            _ => return Err("requirels expects a module name string".to_string()),
        };
        let environment = match args.get(1) {
            None | Some(Value::Nil) => Any::object(),
            Some(Value::Foreign(any)) if any.is_object() => any.clone(),
            Some(Value::Table(_)) => {
                let snapshot = marshal::host_from_value(&vm, &args[1]).map_err(|e| e.to_string())?;
                snapshot
                    .downcast_user::<ScriptTable>()
                    .map(ScriptTable::to_object)
                    .unwrap_or_else(Any::object)
            }
            Some(other) => {
                return Err(format!(
                    "requirels environment must be an object, got {}",
                    type_name(other)
                ));
            }
        };
        let result = vm
            .require_ls(&name, &environment)
            .map_err(|e| e.to_string())?;
        marshal::guest_from_host(&vm, &result, false).map_err(|e| e.to_string())
    });

    install_any_namespace(vm);
    engine.set_foreign_ops(Rc::new(BridgeOps));
}

/// `Any.*` constructors exposed to scripts.
fn install_any_namespace(vm: &ScriptVm) {
    let engine = vm.engine();
    let namespace = engine.new_table();

    let entries: [(&str, NativeFn); 5] = [
        ("object", Rc::new(|_: &[Value]| Ok(Value::Foreign(Any::object())))),
        ("array", Rc::new(|_: &[Value]| Ok(Value::Foreign(Any::array())))),
        ("null", Rc::new(|_: &[Value]| Ok(Value::Foreign(Any::null())))),
        (
            "undefined",
            Rc::new(|_: &[Value]| Ok(Value::Foreign(Any::undefined()))),
        ),
        (
            "parse_json",
            Rc::new(|args: &[Value]| {
                let Some(Value::String(text)) = args.first() else {
                    return Err("parse_json expects a string".to_string());
                };
                let vm = ScriptVm::thread_local().map_err(|e| e.to_string())?;
                let parsed = crate::any::json::parse_json(text)?;
                marshal::guest_from_host(&vm, &parsed, false).map_err(|e| e.to_string())
            }),
        ),
    ];
    for (name, native) in entries {
        let _ = namespace
            .borrow_mut()
            .set(Value::String(name.into()), Value::Native(native));
    }
    engine.set_global("Any", Value::Table(namespace));
}

/// Marshaling-backed behavior of foreign slots inside the guest.
struct BridgeOps;

impl ForeignOps for BridgeOps {
    fn call(&self, target: &Any, args: Vec<Value>) -> Result<Value, String> {
        let vm = ScriptVm::thread_local().map_err(|e| e.to_string())?;
        match target.type_tag() {
            AnyType::Function | AnyType::Caller | AnyType::Property => {
                let mut host_args = Vec::with_capacity(args.len());
                for arg in &args {
                    host_args.push(marshal::host_from_value(&vm, arg).map_err(|e| e.to_string())?);
                }
                let result = target.call(&host_args)?;
                marshal::guest_from_host(&vm, &result, false).map_err(|e| e.to_string())
            }
            other => Err(format!("attempt to call a {} value", other.name())),
        }
    }

    fn index(&self, target: &Any, key: &Value) -> Result<Value, String> {
        let vm = ScriptVm::thread_local().map_err(|e| e.to_string())?;
        let host_key = marshal::host_from_value(&vm, key).map_err(|e| e.to_string())?;
        if let Some(table) = target.downcast_user::<ScriptTable>() {
            let field = table.get_item(&host_key);
            if !field.is_null() {
                return marshal::guest_from_host(&vm, &field, false).map_err(|e| e.to_string());
            }
        } else {
            let field = target.get_item(&host_key);
            if !field.is_undefined() {
                return marshal::guest_from_host(&vm, &field, false).map_err(|e| e.to_string());
            }
        }
        if let Some(name) = host_key.as_str() {
            if let Some(method) = builtin_method(target, name) {
                return Ok(method);
            }
        }
        Ok(Value::Nil)
    }

    fn set_index(&self, target: &Any, key: &Value, value: Value) -> Result<(), String> {
        let vm = ScriptVm::thread_local().map_err(|e| e.to_string())?;
        if let Some(table) = target.downcast_user::<ScriptTable>() {
            let host_key = marshal::host_from_value(&vm, key).map_err(|e| e.to_string())?;
            let host_value = marshal::host_from_value(&vm, &value).map_err(|e| e.to_string())?;
            table.set_item(&host_key, &host_value);
            return Ok(());
        }
        match target.type_tag() {
            AnyType::Object | AnyType::Array | AnyType::Class => {
                let host_key = marshal::host_from_value(&vm, key).map_err(|e| e.to_string())?;
                let host_value =
                    marshal::host_from_value(&vm, &value).map_err(|e| e.to_string())?;
                target.set_item(&host_key, host_value)
            }
            other => Err(format!("cannot set fields on a {} value", other.name())),
        }
    }
}

/// Small built-in method set available on every foreign slot, mirroring the
/// host value model's reflection surface.
fn builtin_method(target: &Any, name: &str) -> Option<Value> {
    let target = target.clone();
    let native: NativeFn = match name {
        "typeName" => Rc::new(move |_| Ok(Value::String(target.type_name().into()))),
        "size" | "length" => Rc::new(move |_| Ok(Value::Number(target.size() as f64))),
        "clone" => Rc::new(move |_| Ok(Value::Foreign(target.clone_value()))),
        "toJson" => Rc::new(move |_| {
            Ok(Value::String(
                crate::any::json::to_json_string(&target).into(),
            ))
        }),
        "toObject" => Rc::new(move |_| {
            let converted = match target.downcast_user::<ScriptTable>() {
                Some(table) => table.to_object(),
                None => target.clone_value(),
            };
            Ok(Value::Foreign(converted))
        }),
        "isFunction" => Rc::new(move |_| Ok(Value::Boolean(target.is_function()))),
        "isNull" => Rc::new(move |_| Ok(Value::Boolean(target.is_null()))),
        "isUndefined" => Rc::new(move |_| Ok(Value::Boolean(target.is_undefined()))),
        "isObject" => Rc::new(move |_| Ok(Value::Boolean(target.is_object()))),
        "isArray" => Rc::new(move |_| Ok(Value::Boolean(target.is_array()))),
        "isString" => Rc::new(move |_| Ok(Value::Boolean(target.is_string()))),
        "isNumber" => Rc::new(move |_| Ok(Value::Boolean(target.is_number()))),
        _ => return None,
    };
    Some(Value::Native(native))
}
