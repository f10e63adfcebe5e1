use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::any::Any;
use crate::bridge::{container, env, marshal, surface};
use crate::bytes;
use crate::context;
use crate::engine::Engine;
use crate::engine::gc::GcMode;
use crate::engine::value::Value;
use crate::error::ScriptError;

/// File extensions probed by the module search, in order, after the bare
/// name itself.
pub const MODULE_EXTENSIONS: [&str; 2] = [".lsc", ".lys"];

/// Cross-thread shard of a session: the identity, liveness flag, and
/// capture registry that closure captures hold a weak reference to.
///
/// The registry is the only mutable state shared between threads; every
/// access goes through the mutex. A capture dropped on a foreign thread
/// cannot touch the owning thread's keep-alive table directly, so it
/// enqueues its slot here and the owner prunes at its next entry point.
pub struct SessionCore {
    id: u64,
    alive: AtomicBool,
    captures: Mutex<CaptureTable>,
}

#[derive(Default)]
struct CaptureTable {
    next_slot: u64,
    pinned: HashSet<u64>,
    released: Vec<u64>,
}

impl SessionCore {
    fn new(id: u64) -> Self {
        Self {
            id,
            alive: AtomicBool::new(true),
            captures: Mutex::new(CaptureTable {
                next_slot: 1,
                ..CaptureTable::default()
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn allocate_slot(&self) -> u64 {
        let mut table = self.captures.lock().expect("capture registry");
        let slot = table.next_slot;
        table.next_slot += 1;
        table.pinned.insert(slot);
        slot
    }

    /// Called from any thread when a capture is dropped.
    pub(crate) fn release_slot(&self, slot: u64) {
        let mut table = self.captures.lock().expect("capture registry");
        if table.pinned.remove(&slot) {
            table.released.push(slot);
        }
    }

    pub(crate) fn is_pinned(&self, slot: u64) -> bool {
        self.captures
            .lock()
            .expect("capture registry")
            .pinned
            .contains(&slot)
    }

    fn drain_released(&self) -> Vec<u64> {
        std::mem::take(
            &mut self
                .captures
                .lock()
                .expect("capture registry")
                .released,
        )
    }

    /// Marks the session dead and empties the registry. Runs before the
    /// engine itself is invalidated so no capture can race into a
    /// half-destroyed instance.
    fn shut_down(&self) {
        self.alive.store(false, Ordering::Release);
        let mut table = self.captures.lock().expect("capture registry");
        table.pinned.clear();
        table.released.clear();
    }
}

/// One per-thread guest engine session.
///
/// Created lazily on first use via [`ScriptVm::thread_local`] and never
/// migrated between threads. The session owns the engine, the keep-alive
/// table pinning live closures for outstanding captures, and the shared
/// [`SessionCore`]. Session equality is engine-instance identity.
pub struct ScriptVm {
    engine: Engine,
    core: Arc<SessionCore>,
    keepalive: RefCell<HashMap<u64, Value>>,
}

thread_local! {
    static SESSION: Rc<ScriptVm> = ScriptVm::boot();
}

impl ScriptVm {
    fn boot() -> Rc<ScriptVm> {
        let engine = Engine::new();
        let core = Arc::new(SessionCore::new(engine.id()));
        let vm = Rc::new(ScriptVm {
            engine,
            core,
            keepalive: RefCell::new(HashMap::new()),
        });
        surface::install(&vm);
        vm
    }

    /// The calling thread's session, created on first use. Fails only when
    /// the thread-local storage is no longer accessible (thread teardown),
    /// which callers treat as a fatal environment error.
    pub fn thread_local() -> Result<Rc<ScriptVm>, ScriptError> {
        SESSION
            .try_with(Rc::clone)
            .map_err(|_| ScriptError::session("no thread-local script session available"))
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    pub fn session_id(&self) -> u64 {
        self.core.id()
    }

    /// Actively shuts the session down. The registry clears first, then the
    /// engine is invalidated; every capture pointing here falls back to
    /// bytecode reconstruction from now on. Further operations on this
    /// session fail with a session error.
    pub fn shutdown(&self) {
        self.core.shut_down();
        self.keepalive.borrow_mut().clear();
        self.engine.shutdown();
    }

    fn ensure_usable(&self) -> Result<(), ScriptError> {
        if self.engine.is_dead() {
            return Err(ScriptError::session("session has been shut down"));
        }
        Ok(())
    }

    /// Pins a live guest function so the engine keeps it alive while a
    /// capture references it. Returns the registry slot.
    pub(crate) fn pin_closure(&self, value: Value) -> u64 {
        let slot = self.core.allocate_slot();
        self.keepalive.borrow_mut().insert(slot, value);
        slot
    }

    pub(crate) fn pinned_value(&self, slot: u64) -> Option<Value> {
        if !self.core.is_pinned(slot) {
            return None;
        }
        self.keepalive.borrow().get(&slot).cloned()
    }

    /// Drops keep-alive pins whose captures were released, possibly from
    /// other threads. Called at every session entry point.
    pub(crate) fn prune_released(&self) {
        for slot in self.core.drain_released() {
            self.keepalive.borrow_mut().remove(&slot);
        }
    }

    /// Routes a failure through the installed exception handler when one
    /// exists; the call then yields undefined. Without a handler the error
    /// propagates.
    pub(crate) fn deliver(&self, err: ScriptError) -> Result<Any, ScriptError> {
        match context::route_failure(&err.to_string()) {
            Some(result) => Ok(result),
            None => Err(err),
        }
    }

    // ---- script execution ---------------------------------------------

    /// Loads and runs source text with an empty environment object.
    pub fn script(&self, source: &str) -> Result<Any, ScriptError> {
        self.script_with_env(source, &Any::object())
    }

    /// Loads and runs source text. `env` must be an object value; its
    /// fields become bare-name bindings for the chunk.
    pub fn script_with_env(&self, source: &str, environment: &Any) -> Result<Any, ScriptError> {
        let name = chunk_label(source);
        self.run_chunk(environment, |engine| engine.load_source(source, &name))
    }

    /// Loads and runs a script or compiled container from a file.
    pub fn script_file(&self, path: impl AsRef<Path>) -> Result<Any, ScriptError> {
        self.script_file_with_env(path, &Any::object())
    }

    pub fn script_file_with_env(
        &self,
        path: impl AsRef<Path>,
        environment: &Any,
    ) -> Result<Any, ScriptError> {
        let path = path.as_ref();
        let data = match self.read_script(path) {
            Ok(data) => data,
            Err(err) => return self.deliver(err),
        };
        self.script_buffer_with_env(&data, environment)
    }

    /// Loads and runs a byte buffer that is either a bytecode container or
    /// plain source text.
    pub fn script_buffer(&self, buffer: &[u8]) -> Result<Any, ScriptError> {
        self.script_buffer_with_env(buffer, &Any::object())
    }

    pub fn script_buffer_with_env(
        &self,
        buffer: &[u8],
        environment: &Any,
    ) -> Result<Any, ScriptError> {
        if container::is_container(buffer) {
            let payload = match container::unwrap(buffer) {
                Ok(payload) => payload,
                Err(err) => return self.deliver(err),
            };
            self.run_chunk(environment, |engine| engine.load_bytecode(&payload))
        } else {
            let source = match std::str::from_utf8(buffer) {
                Ok(source) => source,
                Err(_) => {
                    return self.deliver(ScriptError::guest(
                        "script buffer is neither a bytecode container nor valid source text",
                    ));
                }
            };
            let name = bytes::digest_name(buffer);
            self.run_chunk(environment, |engine| engine.load_source(source, &name))
        }
    }

    /// Shared load → bind environment → call → marshal pipeline.
    fn run_chunk(
        &self,
        environment: &Any,
        load: impl FnOnce(&Engine) -> Result<(), String>,
    ) -> Result<Any, ScriptError> {
        self.ensure_usable()?;
        if !environment.is_object() {
            return self.deliver(ScriptError::usage(
                "script environment must be an object value",
            ));
        }
        self.prune_released();

        if let Err(msg) = load(&self.engine) {
            return self.deliver(ScriptError::guest(msg));
        }
        let func_idx = self.engine.top() as isize;
        if let Err(err) = env::set_environment(self, func_idx, environment) {
            self.engine.pop_n(1);
            return self.deliver(err);
        }
        if let Err(msg) = self.engine.call(0) {
            return self.deliver(ScriptError::guest(msg));
        }
        let result = marshal::host_from_stack(self, -1);
        self.engine.pop_n(1);
        match result {
            Ok(value) => Ok(value),
            Err(err) => self.deliver(err),
        }
    }

    fn read_script(&self, path: &Path) -> Result<Vec<u8>, ScriptError> {
        if let Some(reader) = context::bridge_context().script_reader() {
            let result = reader
                .call(&[Any::string(path.to_string_lossy().into_owned())])
                .map_err(ScriptError::guest)?;
            return match result.as_str() {
                Some(text) => Ok(text.as_bytes().to_vec()),
                None => Err(ScriptError::usage(format!(
                    "script reader returned a {} value for `{}`, expected a string",
                    result.type_name(),
                    path.display()
                ))),
            };
        }
        if !path.exists() {
            return Err(ScriptError::guest(format!(
                "script file `{}` does not exist",
                path.display()
            )));
        }
        Ok(std::fs::read(path)?)
    }

    // ---- compilation ---------------------------------------------------

    /// Compiles source text to raw engine bytecode. Container framing is a
    /// caller concern; see [`container::wrap`].
    pub fn compile_code(
        &self,
        source: &str,
        chunk_name: &str,
        strip_debug: bool,
    ) -> Result<Vec<u8>, ScriptError> {
        self.ensure_usable()?;
        self.engine
            .compile_source(source, chunk_name, strip_debug)
            .map_err(ScriptError::guest)
    }

    /// Compiles a source file to raw engine bytecode. A file that already
    /// carries the container magic yields its unwrapped payload.
    pub fn compile_file(
        &self,
        path: impl AsRef<Path>,
        strip_debug: bool,
    ) -> Result<Vec<u8>, ScriptError> {
        let path = path.as_ref();
        let data = self.read_script(path)?;
        if container::is_container(&data) {
            return container::unwrap(&data);
        }
        let source = std::str::from_utf8(&data).map_err(|_| {
            ScriptError::guest(format!("`{}` is not valid source text", path.display()))
        })?;
        self.compile_code(source, &path.to_string_lossy(), strip_debug)
    }

    // ---- module search -------------------------------------------------

    /// Searches the configured search paths for `name`, `name.lsc`, or
    /// `name.lys` and runs the first match with the given environment. A
    /// miss is logged and yields undefined.
    pub fn require_ls(&self, name: &str, environment: &Any) -> Result<Any, ScriptError> {
        let paths = context::bridge_context().search_paths();
        for dir in &paths {
            if let Some(found) = find_module(dir, name) {
                return self.script_file_with_env(found, environment);
            }
        }
        surface::emit_log("error", &format!("requirels: {} is not found", name));
        Ok(Any::undefined())
    }

    /// Like [`Self::require_ls`] but searches a single explicit directory.
    pub fn require_ls_in(
        &self,
        dir: impl AsRef<Path>,
        name: &str,
        environment: &Any,
    ) -> Result<Any, ScriptError> {
        let dir = dir.as_ref();
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };
        match find_module(dir, name) {
            Some(found) => self.script_file_with_env(found, environment),
            None => {
                surface::emit_log("error", &format!("requirels: {} is not found", name));
                Ok(Any::undefined())
            }
        }
    }

    // ---- collector controls -------------------------------------------

    /// Full collection pass.
    pub fn gc(&self) {
        self.engine.gc_collect();
    }

    /// Single collection step with a `kb` work budget; returns whether the
    /// step finished a cycle. Only meaningful in incremental mode.
    pub fn gc_step(&self, kb: i32) -> bool {
        self.engine.gc_step(kb)
    }

    /// Sets the step multiplier, returning the previous value.
    pub fn gc_set_step_mul(&self, mul: i32) -> i32 {
        self.engine.gc_set_step_mul(mul)
    }

    /// Sets the collector pause, returning the previous value.
    pub fn gc_set_pause(&self, pause: i32) -> i32 {
        self.engine.gc_set_pause(pause)
    }

    pub fn gc_stop(&self) {
        self.engine.gc_stop();
    }

    pub fn gc_restart(&self) {
        self.engine.gc_restart();
    }

    pub fn gc_is_running(&self) -> bool {
        self.engine.gc_is_running()
    }

    /// Estimated engine memory footprint in kilobytes.
    pub fn gc_count_kb(&self) -> i32 {
        self.engine.gc_count_kb()
    }

    pub fn gc_mode_gen(&self) {
        self.engine.gc_set_mode(GcMode::Generational);
    }

    pub fn gc_mode_inc(&self) {
        self.engine.gc_set_mode(GcMode::Incremental);
    }
}

impl PartialEq for ScriptVm {
    fn eq(&self, other: &Self) -> bool {
        self.engine.id() == other.engine.id()
    }
}

impl Drop for ScriptVm {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn find_module(dir: &Path, name: &str) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    let exact = dir.join(name);
    if exact.is_file() {
        return Some(exact);
    }
    for ext in MODULE_EXTENSIONS {
        let candidate = dir.join(format!("{}{}", name, ext));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Short human-readable chunk name derived from the leading source text.
fn chunk_label(source: &str) -> String {
    let first_line = source.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let trimmed = first_line.trim();
    if trimmed.len() <= 40 && source.lines().count() <= 1 {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(40).collect();
        format!("{}...", head)
    }
}
