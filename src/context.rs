//! Process-wide bridge configuration.
//!
//! The exception handler, the script reader, and the module search paths
//! are deliberately not free-floating globals: they live in one context
//! object with explicit accessors, set once at startup and effectively
//! read-only in steady state. Every thread's session consults the same
//! context.

use std::path::PathBuf;
use std::sync::{OnceLock, RwLock};

use crate::any::Any;

pub struct BridgeContext {
    exception_handler: RwLock<Option<Any>>,
    script_reader: RwLock<Option<Any>>,
    search_paths: RwLock<Vec<PathBuf>>,
}

static CONTEXT: OnceLock<BridgeContext> = OnceLock::new();

/// The process-wide context, created on first access.
pub fn bridge_context() -> &'static BridgeContext {
    CONTEXT.get_or_init(|| BridgeContext {
        exception_handler: RwLock::new(None),
        script_reader: RwLock::new(None),
        search_paths: RwLock::new(Vec::new()),
    })
}

impl BridgeContext {
    /// Installs or clears the exception handler. The handler is a function
    /// value receiving one exception argument; while installed, bridge
    /// failures route through it and the failing call yields undefined.
    pub fn set_exception_handler(&self, handler: Option<Any>) {
        let handler = handler.filter(Any::is_function);
        *self.exception_handler.write().expect("context lock") = handler;
    }

    pub fn exception_handler(&self) -> Option<Any> {
        self.exception_handler
            .read()
            .expect("context lock")
            .clone()
    }

    /// Installs or clears the script reader hook. While installed, file
    /// loads call it with the path and expect source text back instead of
    /// touching the filesystem.
    pub fn set_script_reader(&self, reader: Option<Any>) {
        let reader = reader.filter(Any::is_function);
        *self.script_reader.write().expect("context lock") = reader;
    }

    pub fn script_reader(&self) -> Option<Any> {
        self.script_reader.read().expect("context lock").clone()
    }

    /// Replaces the module search path list used by the name-only
    /// `require_ls` variant.
    pub fn set_search_paths(&self, paths: Vec<PathBuf>) {
        *self.search_paths.write().expect("context lock") = paths;
    }

    pub fn add_search_path(&self, path: PathBuf) {
        self.search_paths.write().expect("context lock").push(path);
    }

    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.search_paths.read().expect("context lock").clone()
    }
}

/// Delivers a failure to the installed handler. `Some(undefined)` means the
/// handler consumed it and the failing call should yield undefined; `None`
/// means no handler is installed and the failure must propagate. A handler
/// that itself fails is ignored.
pub fn route_failure(message: &str) -> Option<Any> {
    let handler = bridge_context().exception_handler()?;
    let _ = handler.call(&[Any::exception(message)]);
    Some(Any::undefined())
}
