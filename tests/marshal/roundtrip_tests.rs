use lys::any::{Any, AnyType};
use lys::bridge::marshal::{NUMBER_INT_EPS, guest_from_host, host_from_value};
use lys::bridge::session::ScriptVm;
use lys::engine::value::Value;

#[test]
fn scalar_tags_round_trip_under_host_equality() {
    let vm = ScriptVm::thread_local().unwrap();
    let cases = vec![
        Any::from(true),
        Any::from(false),
        Any::from(0i32),
        Any::from(-17i32),
        Any::from(123456i64),
        Any::from(-1i64),
        Any::from(2.5f64),
        Any::from(-0.125f64),
        Any::string(""),
        Any::string("hello world"),
        Any::null(),
        Any::undefined(),
    ];
    for original in cases {
        let guest = guest_from_host(&vm, &original, false).unwrap();
        let back = host_from_value(&vm, &guest).unwrap();
        assert_eq!(back, original, "round trip changed {}", original);
    }
}

#[test]
fn int64_below_boundary_round_trips_exactly() {
    let vm = ScriptVm::thread_local().unwrap();
    let original = Any::from((i32::MAX as i64) - 1);
    let guest = guest_from_host(&vm, &original, false).unwrap();
    let back = host_from_value(&vm, &guest).unwrap();
    assert_eq!(back, original);
    assert_eq!(back.type_tag(), AnyType::Int64);
}

#[test]
fn float_epsilon_disambiguation() {
    let vm = ScriptVm::thread_local().unwrap();

    let five = host_from_value(&vm, &Value::Number(5.0)).unwrap();
    assert_eq!(five.type_tag(), AnyType::Int64);
    assert_eq!(five, Any::from(5i64));

    let five_and_half = host_from_value(&vm, &Value::Number(5.5)).unwrap();
    assert_eq!(five_and_half.type_tag(), AnyType::Double);
    assert_eq!(five_and_half, Any::from(5.5f64));
}

#[test]
fn epsilon_boundary_behavior_is_preserved() {
    let vm = ScriptVm::thread_local().unwrap();
    // just inside the epsilon: silently rounds to the integer
    let inside = host_from_value(&vm, &Value::Number(5.0 + NUMBER_INT_EPS / 2.0)).unwrap();
    assert_eq!(inside, Any::from(5i64));
    // just outside: stays fractional
    let outside = host_from_value(&vm, &Value::Number(5.0 + NUMBER_INT_EPS * 2.0)).unwrap();
    assert_eq!(outside.type_tag(), AnyType::Double);
}

#[test]
fn nullish_mapping() {
    let vm = ScriptVm::thread_local().unwrap();
    // undefined and null both push as guest nil
    assert!(matches!(
        guest_from_host(&vm, &Any::undefined(), false).unwrap(),
        Value::Nil
    ));
    assert!(matches!(
        guest_from_host(&vm, &Any::null(), false).unwrap(),
        Value::Nil
    ));
    // guest nil reads back as null
    assert!(host_from_value(&vm, &Value::Nil).unwrap().is_null());
}

#[test]
fn scalars_survive_a_script_round_trip() {
    let vm = ScriptVm::thread_local().unwrap();
    assert_eq!(vm.script("return 7").unwrap(), Any::from(7i64));
    assert_eq!(vm.script("return 7.25").unwrap(), Any::from(7.25f64));
    assert_eq!(vm.script("return true").unwrap(), Any::from(true));
    assert_eq!(vm.script("return \"abc\"").unwrap(), Any::string("abc"));
    assert!(vm.script("return nil").unwrap().is_null());
    assert!(vm.script("return").unwrap().is_null());
}

#[test]
fn strings_cross_byte_exact() {
    let vm = ScriptVm::thread_local().unwrap();
    let text = "π≈3.14159 — ünïcode\n\ttabs";
    let guest = guest_from_host(&vm, &Any::string(text), false).unwrap();
    let back = host_from_value(&vm, &guest).unwrap();
    assert_eq!(back.as_str(), Some(text));
}

#[test]
fn host_functions_cross_into_the_guest_and_back() {
    let vm = ScriptVm::thread_local().unwrap();
    let double = Any::function("double", |args| {
        let n = args.first().and_then(Any::as_i64).unwrap_or(0);
        Ok(Any::from(n * 2))
    });
    let env = Any::object();
    env.set_item(&Any::string("double"), double).unwrap();
    let result = vm.script_with_env("return double(21)", &env).unwrap();
    assert_eq!(result, Any::from(42i64));
}

#[test]
fn wide_integers_degrade_to_guest_float() {
    let vm = ScriptVm::thread_local().unwrap();
    let big = (i32::MAX as i64) * 1000;
    let guest = guest_from_host(&vm, &Any::from(big), false).unwrap();
    let Value::Number(n) = guest else {
        panic!("expected a guest number");
    };
    assert_eq!(n, big as f64);
}
