use thiserror::Error;

/// Failure taxonomy for the bridge.
///
/// Variants map to where a failure is detected rather than where it is
/// handled: misuse of the host-callable surface (`Usage`), errors raised by
/// the guest engine while loading, compiling, or running a chunk (`Guest`),
/// values that cannot cross the runtime boundary (`Marshal`), and a missing
/// or shut-down thread session (`Session`).
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("{0}")]
    Guest(String),

    #[error("marshal error: {0}")]
    Marshal(String),

    #[error("session error: {0}")]
    Session(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScriptError {
    pub fn usage(msg: impl Into<String>) -> Self {
        ScriptError::Usage(msg.into())
    }

    pub fn guest(msg: impl Into<String>) -> Self {
        ScriptError::Guest(msg.into())
    }

    pub fn marshal(msg: impl Into<String>) -> Self {
        ScriptError::Marshal(msg.into())
    }

    pub fn session(msg: impl Into<String>) -> Self {
        ScriptError::Session(msg.into())
    }
}
