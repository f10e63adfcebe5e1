use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use lys::any::Any;
use lys::bridge::session::ScriptVm;
use lys::context::bridge_context;
use lys::error::ScriptError;

// the exception handler is process-global; serialize the tests that
// install one so unrelated error assertions cannot race it
static HANDLER_GUARD: Mutex<()> = Mutex::new(());

#[test]
fn end_to_end_scenario_from_text_to_integer_seven() {
    let vm = ScriptVm::thread_local().unwrap();
    let func = vm.script("return function(a,b) return a+b end").unwrap();
    let result = func.call(&[Any::from(3i64), Any::from(4i64)]).unwrap();
    assert_eq!(result, Any::from(7i64));
}

#[test]
fn sessions_on_the_same_thread_are_equal() {
    let a = ScriptVm::thread_local().unwrap();
    let b = ScriptVm::thread_local().unwrap();
    assert!(*a == *b);
}

#[test]
fn sessions_on_different_threads_are_distinct() {
    let here = ScriptVm::thread_local().unwrap().session_id();
    let there = thread::spawn(|| ScriptVm::thread_local().unwrap().session_id())
        .join()
        .unwrap();
    assert_ne!(here, there);
}

#[test]
fn runtime_errors_propagate_without_a_handler() {
    let _guard = HANDLER_GUARD.lock().unwrap();
    let vm = ScriptVm::thread_local().unwrap();
    let err = vm.script("return nil + 1").unwrap_err();
    assert!(matches!(err, ScriptError::Guest(_)));
    assert!(err.to_string().contains("arithmetic"), "{}", err);
}

#[test]
fn load_errors_report_the_parse_failure() {
    let _guard = HANDLER_GUARD.lock().unwrap();
    let vm = ScriptVm::thread_local().unwrap();
    let err = vm.script("return function(").unwrap_err();
    assert!(err.to_string().contains("parse error"), "{}", err);
}

#[test]
fn installed_handler_consumes_failures() {
    let _guard = HANDLER_GUARD.lock().unwrap();
    static SEEN: AtomicUsize = AtomicUsize::new(0);
    bridge_context().set_exception_handler(Some(Any::function("handler", |args| {
        assert!(args[0].is_exception());
        SEEN.fetch_add(1, Ordering::SeqCst);
        Ok(Any::undefined())
    })));

    let vm = ScriptVm::thread_local().unwrap();
    let result = vm.script("return nil + 1").unwrap();
    bridge_context().set_exception_handler(None);

    assert!(result.is_undefined());
    assert_eq!(SEEN.load(Ordering::SeqCst), 1);
}

#[test]
fn non_object_environment_is_a_usage_error() {
    let _guard = HANDLER_GUARD.lock().unwrap();
    let vm = ScriptVm::thread_local().unwrap();
    let err = vm
        .script_with_env("return 1", &Any::from(5i64))
        .unwrap_err();
    assert!(matches!(err, ScriptError::Usage(_)));
}

#[test]
fn shutdown_invalidates_the_session() {
    let outcome = thread::spawn(|| {
        let vm = ScriptVm::thread_local().unwrap();
        assert_eq!(vm.script("return 1").unwrap(), Any::from(1i64));
        vm.shutdown();
        vm.script("return 2")
    })
    .join()
    .unwrap();
    let err = outcome.unwrap_err();
    assert!(matches!(err, ScriptError::Session(_)));
}

#[test]
fn script_reader_hook_overrides_file_access() {
    let _guard = HANDLER_GUARD.lock().unwrap();
    bridge_context().set_script_reader(Some(Any::function("reader", |args| {
        let path = args[0].as_str().unwrap_or_default();
        Ok(Any::string(format!("return \"read:{}\"", path)))
    })));
    let vm = ScriptVm::thread_local().unwrap();
    let result = vm.script_file("virtual/module.lys");
    bridge_context().set_script_reader(None);
    assert_eq!(result.unwrap(), Any::string("read:virtual/module.lys"));
}

#[test]
fn gc_controls_round_trip() {
    let vm = ScriptVm::thread_local().unwrap();

    assert!(vm.gc_is_running());
    vm.gc_stop();
    assert!(!vm.gc_is_running());
    vm.gc_restart();
    assert!(vm.gc_is_running());

    let previous = vm.gc_set_pause(150);
    assert_eq!(vm.gc_set_pause(previous), 150);
    let previous = vm.gc_set_step_mul(300);
    assert_eq!(vm.gc_set_step_mul(previous), 300);

    vm.gc_mode_gen();
    assert!(vm.gc_step(1));
    vm.gc_mode_inc();

    assert!(vm.gc_count_kb() >= 0);
}

#[test]
fn gc_reclaims_dropped_guest_tables() {
    let vm = ScriptVm::thread_local().unwrap();
    // allocate a pile of tables that die as soon as the chunk returns
    vm.script(
        r#"
        local i = 0
        while i < 500 do
            local t = { i, i + 1, i + 2 }
            i = i + 1
        end
        return nil
        "#,
    )
    .unwrap();
    vm.gc();
    let after_collect = vm.gc_count_kb();
    // a second full collection finds nothing new to prune
    vm.gc();
    assert!(vm.gc_count_kb() <= after_collect);
}

#[test]
fn incremental_steps_eventually_complete_a_cycle() {
    let vm = ScriptVm::thread_local().unwrap();
    vm.gc_mode_inc();
    vm.script("local t = {1, 2, 3} return nil").unwrap();
    let mut finished = false;
    for _ in 0..1000 {
        if vm.gc_step(1) {
            finished = true;
            break;
        }
    }
    assert!(finished);
}

#[test]
fn sequential_scripts_share_one_engine() {
    let vm = ScriptVm::thread_local().unwrap();
    let first = vm.script("return 1").unwrap();
    let second = vm.script("return 2").unwrap();
    assert_eq!(first, Any::from(1i64));
    assert_eq!(second, Any::from(2i64));
    // stack balance across calls
    assert_eq!(vm.engine().top(), 0);
}
