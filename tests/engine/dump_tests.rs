use lys::engine::Engine;
use lys::engine::proto::{self, BYTECODE_SIG};
use lys::engine::value::Value;

const SOURCE: &str = r#"
    local base = 5
    return function(n)
        local acc = 0
        for i = 1, n do
            acc = acc + base
        end
        return acc
    end
"#;

fn run_pushed(engine: &Engine, nargs: usize) -> Value {
    engine.call(nargs).unwrap();
    engine.pop_value()
}

#[test]
fn compiled_bytecode_carries_the_signature() {
    let engine = Engine::new();
    let bytecode = engine.compile_source("return 1", "sig", false).unwrap();
    assert_eq!(&bytecode[0..4], &BYTECODE_SIG);
    assert!(proto::looks_like_bytecode(&bytecode));
}

#[test]
fn load_bytecode_executes_like_source() {
    let engine = Engine::new();
    engine.load_source("return 2 + 3", "direct").unwrap();
    let direct = run_pushed(&engine, 0);

    let bytecode = engine.compile_source("return 2 + 3", "direct", false).unwrap();
    engine.load_bytecode(&bytecode).unwrap();
    let loaded = run_pushed(&engine, 0);

    assert!(matches!(direct, Value::Number(n) if n == 5.0));
    assert!(matches!(loaded, Value::Number(n) if n == 5.0));
}

#[test]
fn dump_of_a_pushed_closure_reloads() {
    let engine = Engine::new();
    engine.load_source("return function(a, b) return a * b end", "mul").unwrap();
    engine.call(0).unwrap();
    let dumped = engine.dump_function(-1).unwrap();
    engine.pop_n(1);

    engine.load_bytecode(&dumped).unwrap();
    engine.push_value(Value::Number(6.0));
    engine.push_value(Value::Number(7.0));
    let result = run_pushed(&engine, 2);
    assert!(matches!(result, Value::Number(n) if n == 42.0));
}

#[test]
fn upvalue_order_survives_dump_and_reload() {
    let engine = Engine::new();
    engine.load_source(SOURCE, "chunk").unwrap();
    engine.call(0).unwrap();

    // the returned closure captures `base` and threads `_ENV` through the
    // `for` desugar; record names before the round trip
    let names: Vec<Option<String>> = (0..engine.upvalue_count(-1))
        .map(|i| engine.upvalue_name(-1, i))
        .collect();
    let dumped = engine.dump_function(-1).unwrap();
    engine.pop_n(1);

    engine.load_bytecode(&dumped).unwrap();
    let reloaded: Vec<Option<String>> = (0..engine.upvalue_count(-1))
        .map(|i| engine.upvalue_name(-1, i))
        .collect();
    assert_eq!(names, reloaded);

    // restored upvalue cells start nil; write the captured value back by
    // position and the function behaves as before
    let base_slot = engine.find_upvalue(-1, "base").unwrap();
    assert!(engine.set_upvalue_value(-1, base_slot, Value::Number(5.0)));
    engine.push_value(Value::Number(3.0));
    let result = run_pushed(&engine, 1);
    assert!(matches!(result, Value::Number(n) if n == 15.0));
}

#[test]
fn stripped_dumps_lose_position_info() {
    let engine = Engine::new();
    let source = "return nil + 1";

    let full = engine.compile_source(source, "boom", false).unwrap();
    engine.load_bytecode(&full).unwrap();
    let err = engine.call(0).unwrap_err();
    assert!(err.contains("boom:1"), "{}", err);

    let stripped = engine.compile_source(source, "boom", true).unwrap();
    engine.load_bytecode(&stripped).unwrap();
    let err = engine.call(0).unwrap_err();
    assert!(!err.contains("boom"), "{}", err);
    assert!(err.contains("arithmetic"), "{}", err);
}

#[test]
fn native_functions_have_no_dumpable_form() {
    let engine = Engine::new();
    engine.register_native("noop", |_| Ok(Value::Nil));
    engine.push_value(engine.get_global("noop"));
    assert!(engine.dump_function(-1).is_err());
    engine.pop_n(1);
}

#[test]
fn truncated_bytecode_is_rejected_by_the_engine() {
    let engine = Engine::new();
    let bytecode = engine.compile_source("return 1", "t", false).unwrap();
    assert!(engine.load_bytecode(&bytecode[..bytecode.len() - 3]).is_err());
    assert!(engine.load_bytecode(b"garbage").is_err());
}
