use thiserror::Error;

use crate::engine::EngineError;

/// Everything a session operation can fail with. Guest-reported failure
/// codes are surfaced verbatim; nothing here is retried internally.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to construct reactor session")]
    Construction(#[source] EngineError),
    #[error("missing required export `{0}`")]
    MissingExport(&'static str),
    #[error("reactor startup export failed")]
    Startup(#[source] EngineError),
    #[error("guest allocator returned null ({requested} bytes)")]
    AllocFailed { requested: usize },
    #[error("guest memory write rejected at {addr:#x} ({len} bytes)")]
    WriteFailed { addr: u32, len: usize },
    #[error("session is not initialized")]
    NotInitialized,
    #[error("session is already initialized")]
    AlreadyInitialized,
    #[error("guest init returned {0}")]
    InitFailed(i32),
    #[error("guest eval reported bridge failure ({0})")]
    EvalFailed(i32),
    #[error("guest set-variable returned {0}")]
    SetVarFailed(i32),
    #[error("export `{0}` is not provided by this guest")]
    ExportUnavailable(&'static str),
    #[error("guest call failed")]
    Call(#[from] EngineError),
}
