use lys::any::Any;
use lys::bridge::session::ScriptVm;
use lys::bridge::table::ScriptTable;

fn int(v: i64) -> Any {
    Any::from(v)
}

fn returned_table(source: &str) -> Any {
    let vm = ScriptVm::thread_local().unwrap();
    let result = vm.script(source).unwrap();
    assert!(
        result.downcast_user::<ScriptTable>().is_some(),
        "script did not return a table"
    );
    result
}

#[test]
fn contiguous_keys_produce_an_ordered_sequence() {
    let result = returned_table("return {\"a\", \"b\", \"c\"}");
    let table = result.downcast_user::<ScriptTable>().unwrap();
    assert!(table.is_array());
    let array = table.to_array();
    assert_eq!(array.size(), 3);
    assert_eq!(array.get_item(&int(0)), Any::string("a"));
    assert_eq!(array.get_item(&int(1)), Any::string("b"));
    assert_eq!(array.get_item(&int(2)), Any::string("c"));
}

#[test]
fn gap_truncates_the_sequence() {
    let source = r#"
        local t = {}
        t[1] = "a"
        t[2] = "b"
        t[4] = "d"
        return t
    "#;
    let result = returned_table(source);
    let table = result.downcast_user::<ScriptTable>().unwrap();
    assert!(table.is_array());
    let array = table.to_array();
    assert_eq!(array.size(), 2);
    assert_eq!(array.get_item(&int(0)), Any::string("a"));
    assert_eq!(array.get_item(&int(1)), Any::string("b"));
}

#[test]
fn non_integer_key_converts_to_object_never_sequence() {
    let source = r#"
        local t = {}
        t[1] = "a"
        t.name = "thing"
        return t
    "#;
    let result = returned_table(source);
    let table = result.downcast_user::<ScriptTable>().unwrap();
    assert!(!table.is_array());
    let converted = table.to_object();
    assert!(converted.is_object());
    assert_eq!(converted.get_item(&Any::string("name")), Any::string("thing"));
}

#[test]
fn insertion_order_is_preserved_on_read() {
    let source = r#"
        local t = {}
        t.z = 1
        t.a = 2
        t.m = 3
        return t
    "#;
    let result = returned_table(source);
    let table = result.downcast_user::<ScriptTable>().unwrap();
    let keys: Vec<String> = table
        .pairs()
        .into_iter()
        .map(|(k, _)| k.as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(keys, vec!["z", "a", "m"]);
}

#[test]
fn nested_tables_convert_recursively() {
    let source = r#"
        return {
            name = "outer",
            inner = { 1, 2, 3 },
        }
    "#;
    let result = returned_table(source);
    let table = result.downcast_user::<ScriptTable>().unwrap();
    let obj = table.to_object();
    let inner = obj.get_item(&Any::string("inner"));
    assert!(inner.is_array());
    assert_eq!(inner.size(), 3);
    assert_eq!(inner.get_item(&int(1)), int(2));
}

#[test]
fn conversion_is_a_snapshot_not_a_live_view() {
    use std::sync::{Arc, Mutex};

    let vm = ScriptVm::thread_local().unwrap();
    let seen: Arc<Mutex<Option<Any>>> = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let capture = Any::function("capture", move |args| {
        *sink.lock().unwrap() = Some(args[0].clone());
        Ok(Any::null())
    });
    let env = Any::object();
    env.set_item(&Any::string("capture"), capture).unwrap();

    let source = r#"
        local t = { x = 1 }
        capture(t)
        t.x = 2
        return t.x
    "#;
    let result = vm.script_with_env(source, &env).unwrap();
    assert_eq!(result, int(2));

    // the snapshot was taken when the table crossed the boundary; the later
    // guest mutation is invisible to it
    let snapshot = seen.lock().unwrap().clone().unwrap();
    let table = snapshot.downcast_user::<ScriptTable>().unwrap();
    assert_eq!(table.get_item(&Any::string("x")), int(1));
}

#[test]
fn host_table_expands_back_into_the_guest() {
    let vm = ScriptVm::thread_local().unwrap();
    let t = ScriptTable::new();
    t.set_item(&int(1), &int(10));
    t.set_item(&int(2), &int(20));
    t.set_item(&int(3), &int(30));
    let env = Any::object();
    env.set_item(&Any::string("data"), t.into_any()).unwrap();

    // the environment binding pushes `data` as an opaque slot; re-entry into
    // a native table goes through the sum helper below
    let sum = Any::function("sum_table", |args| {
        let table = args[0]
            .downcast_user::<ScriptTable>()
            .ok_or("expected a table")?;
        let mut total = 0i64;
        for (_, v) in table.pairs() {
            total += v.as_i64().unwrap_or(0);
        }
        Ok(Any::from(total))
    });
    env.set_item(&Any::string("sum_table"), sum).unwrap();

    let result = vm.script_with_env("return sum_table(data)", &env).unwrap();
    assert_eq!(result, int(60));
}

#[test]
fn guest_can_index_a_bridged_table_slot() {
    let vm = ScriptVm::thread_local().unwrap();
    let t = ScriptTable::new();
    t.set_item(&Any::string("answer"), &int(42));
    let env = Any::object();
    env.set_item(&Any::string("config"), t.into_any()).unwrap();
    // opaque foreign slot: indexing goes through the dispatch seam
    let result = vm
        .script_with_env("return config.answer", &env)
        .unwrap();
    assert_eq!(result, int(42));
}
