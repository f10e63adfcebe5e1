use lys::any::Any;
use lys::bridge::env::{get_environment, set_environment};
use lys::bridge::session::ScriptVm;

fn object_with(fields: &[(&str, Any)]) -> Any {
    let obj = Any::object();
    for (k, v) in fields {
        obj.set_item(&Any::string(*k), v.clone()).unwrap();
    }
    obj
}

#[test]
fn environment_fields_bind_as_bare_names() {
    let vm = ScriptVm::thread_local().unwrap();
    let env = object_with(&[("greeting", Any::string("hello")), ("count", Any::from(3i64))]);
    let result = vm
        .script_with_env("return greeting .. \" x\" .. count", &env)
        .unwrap();
    assert_eq!(result, Any::string("hello x3"));
}

#[test]
fn two_environments_cannot_observe_each_other() {
    let vm = ScriptVm::thread_local().unwrap();
    let env_a = object_with(&[("secret", Any::string("a"))]);
    let env_b = object_with(&[("other", Any::string("b"))]);

    assert_eq!(
        vm.script_with_env("return secret", &env_a).unwrap(),
        Any::string("a")
    );
    // env B never sees env A's binding
    assert!(vm.script_with_env("return secret", &env_b).unwrap().is_null());
    assert_eq!(
        vm.script_with_env("return other", &env_b).unwrap(),
        Any::string("b")
    );
}

#[test]
fn unresolved_names_fall_through_to_builtins() {
    let vm = ScriptVm::thread_local().unwrap();
    let env = object_with(&[("x", Any::from(5i64))]);
    // `tostring` is not in the environment; the proxy falls back to globals
    let result = vm.script_with_env("return tostring(x)", &env).unwrap();
    assert_eq!(result, Any::string("5"));
}

#[test]
fn global_writes_stay_inside_the_chunk_environment() {
    let vm = ScriptVm::thread_local().unwrap();
    vm.script("leaked = 123 return nil").unwrap();
    // a later load gets a fresh proxy; the write did not reach true globals
    assert!(vm.script("return leaked").unwrap().is_null());
}

#[test]
fn environment_object_is_recoverable_from_a_loaded_chunk() {
    let vm = ScriptVm::thread_local().unwrap();
    let engine = vm.engine();
    let env = object_with(&[("tag", Any::string("recoverable"))]);

    engine.load_source("return tag", "chunk").unwrap();
    let func_idx = engine.top() as isize;
    set_environment(&vm, func_idx, &env).unwrap();

    let recovered = get_environment(&vm, func_idx);
    assert_eq!(recovered.identity(), env.identity());
    engine.pop_n(1);
}

#[test]
fn attaching_to_an_envless_function_is_a_noop() {
    let vm = ScriptVm::thread_local().unwrap();
    let engine = vm.engine();
    // the inner function references no globals, so it has no _ENV upvalue
    engine
        .load_source("return function(a) return a end", "chunk")
        .unwrap();
    engine.call(0).unwrap();
    let func_idx = engine.top() as isize;

    let env = object_with(&[("unused", Any::from(1i64))]);
    set_environment(&vm, func_idx, &env).unwrap();
    assert!(get_environment(&vm, func_idx).is_undefined());
    engine.pop_n(1);
}

#[test]
fn captured_function_carries_its_environment() {
    let vm = ScriptVm::thread_local().unwrap();
    let env = object_with(&[("base", Any::from(10i64))]);
    let func = vm
        .script_with_env("return function(x) return base + x end", &env)
        .unwrap();
    assert_eq!(func.call(&[Any::from(5i64)]).unwrap(), Any::from(15i64));

    // the environment also re-attaches on a foreign-thread restore; keep
    // the object alive since the capture only holds it weakly
    let handle = std::thread::spawn(move || func.call(&[Any::from(7i64)]).unwrap());
    assert_eq!(handle.join().unwrap(), Any::from(17i64));
    drop(env);
}

#[test]
fn reclaimed_environment_reads_as_no_environment() {
    let vm = ScriptVm::thread_local().unwrap();
    let env = object_with(&[("base", Any::from(10i64))]);
    let func = vm
        .script_with_env("return function(x) return base + x end", &env)
        .unwrap();
    drop(env);

    // same-thread calls still hit the live closure, whose proxy keeps the
    // copied bindings alive independently of the host object
    assert_eq!(func.call(&[Any::from(5i64)]).unwrap(), Any::from(15i64));

    // a foreign-thread restore finds the weak reference dead, proceeds
    // without an environment, and `base` reads as nil
    let handle = std::thread::spawn(move || func.call(&[Any::from(5i64)]));
    let err = handle.join().unwrap().unwrap_err();
    assert!(err.contains("arithmetic"), "{}", err);
}

#[test]
fn reattaching_replaces_the_previous_environment() {
    let vm = ScriptVm::thread_local().unwrap();
    let engine = vm.engine();
    engine.load_source("return tag", "chunk").unwrap();
    let func_idx = engine.top() as isize;

    let first = object_with(&[("tag", Any::string("first"))]);
    set_environment(&vm, func_idx, &first).unwrap();
    let second = object_with(&[("tag", Any::string("second"))]);
    set_environment(&vm, func_idx, &second).unwrap();

    assert_eq!(get_environment(&vm, func_idx).identity(), second.identity());
    engine.call(0).unwrap();
    let result = engine.pop_value();
    assert!(matches!(result, lys::engine::value::Value::String(s) if &*s == "second"));
}
