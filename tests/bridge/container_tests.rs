use std::fs;

use lys::any::Any;
use lys::bridge::container::{self, CONTAINER_MAGIC};
use lys::bridge::session::ScriptVm;
use lys::context::bridge_context;

const SCRIPT: &str = r#"
    local function fib(n)
        if n < 2 then return n end
        return fib(n - 1) + fib(n - 2)
    end
    return fib(12)
"#;

#[test]
fn compiled_container_executes_like_source() {
    let vm = ScriptVm::thread_local().unwrap();
    let direct = vm.script(SCRIPT).unwrap();
    assert_eq!(direct, Any::from(144i64));

    let bytecode = vm.compile_code(SCRIPT, "fib", false).unwrap();
    let packed = container::wrap(&bytecode, false);
    assert_eq!(&packed[0..4], &CONTAINER_MAGIC);
    assert_eq!(vm.script_buffer(&packed).unwrap(), direct);
}

#[test]
fn compressed_container_round_trips() {
    let vm = ScriptVm::thread_local().unwrap();
    let bytecode = vm.compile_code(SCRIPT, "fib", false).unwrap();
    let packed = container::wrap(&bytecode, true);
    assert_eq!(vm.script_buffer(&packed).unwrap(), Any::from(144i64));
}

#[test]
fn stripped_bytecode_still_executes() {
    let vm = ScriptVm::thread_local().unwrap();
    let stripped = vm.compile_code(SCRIPT, "fib", true).unwrap();
    let full = vm.compile_code(SCRIPT, "fib", false).unwrap();
    assert!(stripped.len() < full.len());
    let packed = container::wrap(&stripped, false);
    assert_eq!(vm.script_buffer(&packed).unwrap(), Any::from(144i64));
}

#[test]
fn plain_text_buffers_load_as_source() {
    let vm = ScriptVm::thread_local().unwrap();
    assert_eq!(
        vm.script_buffer(b"return 1 + 2").unwrap(),
        Any::from(3i64)
    );
}

#[test]
fn binary_garbage_is_rejected() {
    let vm = ScriptVm::thread_local().unwrap();
    let err = vm.script_buffer(&[0x01, 0xFF, 0xFE, 0x00, 0x80]).unwrap_err();
    assert!(err.to_string().contains("neither"), "{}", err);
}

#[test]
fn container_with_corrupt_payload_fails_to_load() {
    let vm = ScriptVm::thread_local().unwrap();
    let packed = container::wrap(b"definitely not bytecode", false);
    assert!(vm.script_buffer(&packed).is_err());
}

#[test]
fn script_file_recognizes_both_forms() {
    let vm = ScriptVm::thread_local().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let source_path = dir.path().join("prog.lys");
    fs::write(&source_path, "return 6 * 7").unwrap();
    assert_eq!(vm.script_file(&source_path).unwrap(), Any::from(42i64));

    let bytecode = vm.compile_file(&source_path, false).unwrap();
    let compiled_path = dir.path().join("prog.lsc");
    fs::write(&compiled_path, container::wrap(&bytecode, true)).unwrap();
    assert_eq!(vm.script_file(&compiled_path).unwrap(), Any::from(42i64));
}

#[test]
fn missing_file_is_a_guest_error() {
    let vm = ScriptVm::thread_local().unwrap();
    let err = vm.script_file("/nonexistent/path/prog.lys").unwrap_err();
    assert!(err.to_string().contains("does not exist"), "{}", err);
}

#[test]
fn compile_file_passes_through_existing_containers() {
    let vm = ScriptVm::thread_local().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let bytecode = vm.compile_code("return 9", "c", false).unwrap();
    let path = dir.path().join("ready.lsc");
    fs::write(&path, container::wrap(&bytecode, false)).unwrap();
    assert_eq!(vm.compile_file(&path, false).unwrap(), bytecode);
}

#[test]
fn module_search_probes_extensions_in_order() {
    let vm = ScriptVm::thread_local().unwrap();
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("mod_a.lys"), "return \"source\"").unwrap();

    let bytecode = vm.compile_code("return \"compiled\"", "mod_b", false).unwrap();
    fs::write(
        dir.path().join("mod_b.lsc"),
        container::wrap(&bytecode, false),
    )
    .unwrap();

    let env = Any::object();
    assert_eq!(
        vm.require_ls_in(dir.path(), "mod_a", &env).unwrap(),
        Any::string("source")
    );
    assert_eq!(
        vm.require_ls_in(dir.path(), "mod_b", &env).unwrap(),
        Any::string("compiled")
    );
    // a miss yields undefined rather than an error
    assert!(vm.require_ls_in(dir.path(), "mod_c", &env).unwrap().is_undefined());
}

// the search-path list is process-global; serialize the tests that set it
static SEARCH_PATH_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[test]
fn module_search_uses_configured_paths() {
    let _guard = SEARCH_PATH_GUARD.lock().unwrap();
    let vm = ScriptVm::thread_local().unwrap();
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("findme.lys"), "return 5").unwrap();

    bridge_context().set_search_paths(vec![dir.path().to_path_buf()]);
    let found = vm.require_ls("findme", &Any::object()).unwrap();
    bridge_context().set_search_paths(Vec::new());
    assert_eq!(found, Any::from(5i64));
}

#[test]
fn modules_receive_their_environment() {
    let vm = ScriptVm::thread_local().unwrap();
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("greeter.lys"), "return \"hi \" .. who").unwrap();

    let env = Any::object();
    env.set_item(&Any::string("who"), Any::string("lys")).unwrap();
    assert_eq!(
        vm.require_ls_in(dir.path(), "greeter", &env).unwrap(),
        Any::string("hi lys")
    );
}

#[test]
fn guest_requirels_loads_sibling_modules() {
    let _guard = SEARCH_PATH_GUARD.lock().unwrap();
    let vm = ScriptVm::thread_local().unwrap();
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("shared.lys"), "return 21").unwrap();

    bridge_context().set_search_paths(vec![dir.path().to_path_buf()]);
    let result = vm.script("return requirels(\"shared\") * 2").unwrap();
    bridge_context().set_search_paths(Vec::new());
    assert_eq!(result, Any::from(42i64));
}
