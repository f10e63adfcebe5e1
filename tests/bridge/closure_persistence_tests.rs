use std::sync::mpsc;
use std::thread;

use lys::any::Any;
use lys::bridge::session::ScriptVm;
use lys::bridge::table::ScriptTable;

fn int(v: i64) -> Any {
    Any::from(v)
}

const COUNTER_PAIR: &str = r#"
    local x = 10
    local function get() return x end
    local function set(v) x = v end
    return { get = get, set = set }
"#;

const LIST_DOUBLER: &str = r#"
    local xs = {1, 2, 3}
    return function()
        local out = {}
        local i = 1
        while xs[i] ~= nil do
            out[i] = xs[i] * 2
            i = i + 1
        end
        return out
    end
"#;

fn doubled(result: &Any) -> Vec<i64> {
    let table = result.downcast_user::<ScriptTable>().expect("table result");
    table
        .to_array()
        .array_items()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect()
}

#[test]
fn end_to_end_function_addition() {
    let vm = ScriptVm::thread_local().unwrap();
    let func = vm.script("return function(a,b) return a+b end").unwrap();
    assert!(func.is_function());
    let result = func.call(&[int(3), int(4)]).unwrap();
    assert_eq!(result, int(7));
}

#[test]
fn argument_arity_adjusts_like_a_guest_call() {
    let vm = ScriptVm::thread_local().unwrap();
    let func = vm.script("return function(a,b) return a end").unwrap();
    // extra arguments are dropped
    assert_eq!(func.call(&[int(1), int(2), int(3)]).unwrap(), int(1));
    // missing arguments read as nil -> null
    let func = vm.script("return function(a,b) return b end").unwrap();
    assert!(func.call(&[int(1)]).unwrap().is_null());
}

#[test]
fn same_thread_invocation_observes_live_mutation() {
    let vm = ScriptVm::thread_local().unwrap();
    let pair = vm.script(COUNTER_PAIR).unwrap();
    let table = pair.downcast_user::<ScriptTable>().unwrap();
    let get = table.get_item(&Any::string("get"));
    let set = table.get_item(&Any::string("set"));

    assert_eq!(get.call(&[]).unwrap(), int(10));
    // mutate the upvalue through other guest code, then observe it live
    set.call(&[int(42)]).unwrap();
    assert_eq!(get.call(&[]).unwrap(), int(42));
}

#[test]
fn foreign_thread_invocation_sees_the_captured_value() {
    let vm = ScriptVm::thread_local().unwrap();
    let pair = vm.script(COUNTER_PAIR).unwrap();
    let table = pair.downcast_user::<ScriptTable>().unwrap();
    let get = table.get_item(&Any::string("get"));
    let set = table.get_item(&Any::string("set"));

    // mutation after capture: live path sees it...
    set.call(&[int(99)]).unwrap();
    assert_eq!(get.call(&[]).unwrap(), int(99));

    // ...but a foreign thread restores from bytecode plus the upvalues
    // recorded at conversion time
    let handle = thread::spawn(move || get.call(&[]).unwrap());
    assert_eq!(handle.join().unwrap(), int(10));
}

#[test]
fn cross_thread_result_survives_origin_shutdown() {
    let (func_tx, func_rx) = mpsc::channel::<Any>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let origin = thread::spawn(move || {
        let vm = ScriptVm::thread_local().unwrap();
        let func = vm.script(LIST_DOUBLER).unwrap();
        func_tx.send(func).unwrap();
        // keep the origin session alive until told otherwise
        done_rx.recv().unwrap();
    });

    let func = func_rx.recv().unwrap();

    // origin session alive, but this is a different thread: restore path
    let first = func.call(&[]).unwrap();
    assert_eq!(doubled(&first), vec![2, 4, 6]);

    // tear the origin down entirely, then invoke again
    done_tx.send(()).unwrap();
    origin.join().unwrap();
    let second = func.call(&[]).unwrap();
    assert_eq!(doubled(&second), vec![2, 4, 6]);
}

#[test]
fn rayon_workers_each_restore_in_their_own_session() {
    use rayon::prelude::*;

    let vm = ScriptVm::thread_local().unwrap();
    let adder = vm.script("return function(a,b) return a+b end").unwrap();

    let results: Vec<i64> = (0..16i64)
        .into_par_iter()
        .map(|i| {
            adder
                .call(&[int(i), int(i)])
                .unwrap()
                .as_i64()
                .unwrap()
        })
        .collect();
    let expected: Vec<i64> = (0..16i64).map(|i| i * 2).collect();
    assert_eq!(results, expected);
}

#[test]
fn native_functions_capture_without_bytecode() {
    let vm = ScriptVm::thread_local().unwrap();
    // `tostring` is an engine native: it crosses, but it has no dumpable form
    let func = vm.script("return tostring").unwrap();
    assert!(func.is_function());

    // live same-thread invocation works
    assert_eq!(func.call(&[int(5)]).unwrap(), Any::string("5"));

    // a foreign thread cannot rebuild it and reports the missing bytecode
    let handle = thread::spawn(move || func.call(&[int(5)]));
    let err = handle.join().unwrap().unwrap_err();
    assert!(err.contains("no bytecode") || err.contains("bytecode"), "{}", err);
}

#[test]
fn invocation_after_own_session_shutdown_fails_cleanly() {
    let handle = thread::spawn(|| {
        let vm = ScriptVm::thread_local().unwrap();
        let func = vm.script("return function() return 1 end").unwrap();
        vm.shutdown();
        func.call(&[])
    });
    let err = handle.join().unwrap().unwrap_err();
    assert!(err.contains("shut down"), "{}", err);
}

#[test]
fn guest_runtime_error_surfaces_as_a_host_error() {
    let vm = ScriptVm::thread_local().unwrap();
    let func = vm
        .script("return function(v) return v.field end")
        .unwrap();
    let err = func.call(&[int(3)]).unwrap_err();
    assert!(err.contains("attempt to index"), "{}", err);
}

#[test]
fn nested_captures_round_trip_through_tables() {
    let vm = ScriptVm::thread_local().unwrap();
    let source = r#"
        local factor = 3
        return {
            scale = function(v) return v * factor end,
            label = "scaler",
        }
    "#;
    let result = vm.script(source).unwrap();
    let table = result.downcast_user::<ScriptTable>().unwrap();
    assert_eq!(table.get_item(&Any::string("label")), Any::string("scaler"));
    let scale = table.get_item(&Any::string("scale"));
    assert_eq!(scale.call(&[int(7)]).unwrap(), int(21));

    // and the same function still works from another thread
    let handle = thread::spawn(move || scale.call(&[int(7)]).unwrap());
    assert_eq!(handle.join().unwrap(), int(21));
}
