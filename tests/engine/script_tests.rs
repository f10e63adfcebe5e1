use insta::assert_snapshot;
use lys::any::Any;
use lys::bridge::session::ScriptVm;
use lys::bridge::table::ScriptTable;

fn run(source: &str) -> Any {
    ScriptVm::thread_local().unwrap().script(source).unwrap()
}

#[test]
fn control_flow_composes() {
    let source = r#"
        local function classify(n)
            if n < 0 then
                return "negative"
            elseif n == 0 then
                return "zero"
            else
                return "positive"
            end
        end
        return classify(-3) .. "/" .. classify(0) .. "/" .. classify(9)
    "#;
    assert_eq!(run(source), Any::string("negative/zero/positive"));
}

#[test]
fn loops_accumulate() {
    let source = r#"
        local total = 0
        for i = 1, 100 do
            total = total + i
        end
        return total
    "#;
    assert_eq!(run(source), Any::from(5050i64));
}

#[test]
fn higher_order_functions_work() {
    let source = r#"
        local function map(t, f)
            local out = {}
            local i = 1
            while t[i] ~= nil do
                out[i] = f(t[i])
                i = i + 1
            end
            return out
        end
        local squares = map({1, 2, 3, 4}, function(x) return x * x end)
        return squares[1] + squares[2] + squares[3] + squares[4]
    "#;
    assert_eq!(run(source), Any::from(30i64));
}

#[test]
fn method_calls_and_string_state() {
    let source = r#"
        local account = { balance = 100 }
        account.deposit = function(self, amount)
            self.balance = self.balance + amount
            return self.balance
        end
        account:deposit(50)
        return account:deposit(25)
    "#;
    assert_eq!(run(source), Any::from(175i64));
}

#[test]
fn logical_operators_select_values() {
    assert_eq!(run("return nil or \"fallback\""), Any::string("fallback"));
    assert_eq!(run("return false or nil or 3"), Any::from(3i64));
    assert_eq!(run("return 1 and 2"), Any::from(2i64));
    assert_eq!(
        run("local t = nil return t and t.field or \"safe\""),
        Any::string("safe")
    );
}

#[test]
fn length_and_concat_operators() {
    assert_eq!(run("return #\"hello\""), Any::from(5i64));
    assert_eq!(run("return #{10, 20, 30}"), Any::from(3i64));
    assert_eq!(
        run("return \"a\" .. 1 == \"a1\" and \"yes\" or \"no\""),
        Any::string("yes")
    );
}

#[test]
fn table_display_renders_in_insertion_order() {
    let result = run(
        r#"
        local t = {}
        t.name = "thing"
        t[1] = 2
        t.flag = true
        return t
        "#,
    );
    let table = result.downcast_user::<ScriptTable>().unwrap();
    assert_snapshot!(table.to_string(), @r#"{["name"]="thing", [1]=2, ["flag"]=true}"#);
}

#[test]
fn table_json_export() {
    let result = run("return {1, 2, 3}");
    let table = result.downcast_user::<ScriptTable>().unwrap();
    assert_snapshot!(table.to_json_string(), @"[1,2,3]");
}

#[test]
fn runtime_error_messages_carry_position() {
    let vm = ScriptVm::thread_local().unwrap();
    let err = vm
        .script("local a = 1\nlocal b = 2\nreturn a + b + nil")
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains(":3:"), "{}", message);
    assert!(message.contains("arithmetic"), "{}", message);
}

#[test]
fn shadowing_and_scoping() {
    let source = r#"
        local x = 1
        do
            local x = 2
            do
                local x = 3
            end
        end
        return x
    "#;
    assert_eq!(run(source), Any::from(1i64));
}

#[test]
fn early_break_with_nested_loops() {
    let source = r#"
        local found = nil
        local i = 1
        while i <= 5 do
            local j = 1
            while j <= 5 do
                if i * j == 12 then
                    found = i * 10 + j
                    break
                end
                j = j + 1
            end
            if found ~= nil then break end
            i = i + 1
        end
        return found
    "#;
    assert_eq!(run(source), Any::from(34i64));
}

#[test]
fn any_namespace_constructors_are_available() {
    let vm = ScriptVm::thread_local().unwrap();
    let source = r#"
        local obj = Any.object()
        obj.name = "built in guest"
        obj.count = 3
        return obj
    "#;
    let result = vm.script(source).unwrap();
    assert!(result.is_object());
    assert_eq!(result.get_item(&Any::string("name")), Any::string("built in guest"));
    assert_eq!(result.get_item(&Any::string("count")), Any::from(3i64));
}

#[test]
fn foreign_slot_reflection_methods() {
    let vm = ScriptVm::thread_local().unwrap();
    let env = Any::object();
    let payload = Any::object();
    payload.set_item(&Any::string("a"), Any::from(1i64)).unwrap();
    payload.set_item(&Any::string("b"), Any::from(2i64)).unwrap();
    env.set_item(&Any::string("payload"), payload).unwrap();

    assert_eq!(
        vm.script_with_env("return payload:typeName()", &env).unwrap(),
        Any::string("object")
    );
    assert_eq!(
        vm.script_with_env("return payload:size()", &env).unwrap(),
        Any::from(2i64)
    );
    assert_eq!(
        vm.script_with_env("return payload:isObject()", &env).unwrap(),
        Any::from(true)
    );
    assert_eq!(
        vm.script_with_env("return #payload", &env).unwrap(),
        Any::from(2i64)
    );
}

#[test]
fn enum_and_class_slots_cross_the_boundary() {
    let vm = ScriptVm::thread_local().unwrap();
    let env = Any::object();
    env.set_item(
        &Any::string("colors"),
        Any::enumeration(
            "Colors",
            vec![("RED".to_string(), 1), ("BLUE".to_string(), 2)],
        ),
    )
    .unwrap();
    let class = Any::class("Greeter", "test fixture");
    class
        .set_item(
            &Any::string("hello"),
            Any::function("hello", |_| Ok(Any::string("hi"))),
        )
        .unwrap();
    env.set_item(&Any::string("Greeter"), class).unwrap();

    assert_eq!(
        vm.script_with_env("return colors.BLUE", &env).unwrap(),
        Any::from(2i64)
    );
    assert_eq!(
        vm.script_with_env("return Greeter.hello()", &env).unwrap(),
        Any::string("hi")
    );
}

#[test]
fn guest_json_parsing() {
    let result = run("local v = Any.parse_json(\"{\\\"n\\\": 7}\") return v.n");
    assert_eq!(result, Any::from(7i64));
}
