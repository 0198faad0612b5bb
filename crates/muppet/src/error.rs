use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to open process: {0}")]
    ProcessOpenFailed(String),

    #[error("Failed to read process memory at address {address:#x}: {message}")]
    MemoryReadFailed { address: u64, message: String },

    #[error("Failed to write process memory at address {address:#x}: {message}")]
    MemoryWriteFailed { address: u64, message: String },

    #[error("Failed to allocate {size} bytes in target process: {message}")]
    AllocationFailed { size: usize, message: String },

    #[error("Failed to free block at address {address:#x}: {message}")]
    FreeFailed { address: u64, message: String },

    #[error("Signature scan for '{code}' found {found} matches, required {required}")]
    ScanFailed {
        code: String,
        required: usize,
        found: usize,
    },

    #[error("Invalid signature pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid PE image at {address:#x}: {message}")]
    InvalidImage { address: u64, message: String },

    #[error("Export directory reports negative counts (functions={functions}, names={names})")]
    NegativeExportCounts { functions: i32, names: i32 },

    #[error("Export not found: {0}")]
    ExportNotFound(String),

    #[error("No cached or scanned address for function '{0}'")]
    MissingFunctionOffset(String),

    #[error("Function '{code}' has no trigger named '{trigger}'")]
    MissingTrigger { code: String, trigger: String },

    #[error("Assembly failed on line '{line}': {message}")]
    AssemblyFailed { line: String, message: String },

    #[error("Template references unknown parameter '{0}'")]
    MissingTemplateParam(String),

    #[error("Failed to decode structure at {address:#x}: {message}")]
    DecodeFailed { address: u64, message: String },

    #[error("Remote call did not complete within {timeout_ms} ms (trigger {trigger:#x})")]
    CallTimeout { trigger: u64, timeout_ms: u64 },

    #[error("Engine is already running")]
    AlreadyStarted,

    #[error("Engine has not been started")]
    NotStarted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check whether this error means the target memory was unreachable,
    /// typically because the process exited. Teardown paths treat these
    /// as non-fatal.
    pub fn is_access_error(&self) -> bool {
        matches!(
            self,
            Error::MemoryReadFailed { .. } | Error::MemoryWriteFailed { .. }
        )
    }
}
