//! Error types for the interop bridge

use std::path::PathBuf;
use thiserror::Error;

/// Result type for interop operations
pub type Result<T> = std::result::Result<T, InteropError>;

/// Broad classification of an [`InteropError`], used to pick the boundary
/// reporting channel and the fatal flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Null or empty required argument
    Argument,
    /// Unknown container, unit, type, method, field or handle
    NotFound,
    /// Operation not allowed in the current state
    State,
    /// Value could not be converted across the boundary
    Marshal,
    /// Code unit could not be loaded
    Load,
    /// Failure that aborts the surrounding batch
    Fatal,
}

/// Errors that can occur in the interop bridge
#[derive(Debug, Error)]
pub enum InteropError {
    /// A required argument was null or empty
    #[error("Invalid argument '{name}': {message}")]
    InvalidArgument {
        name: &'static str,
        message: String,
    },

    /// Container not registered
    #[error("Container '{0}' not found")]
    ContainerNotFound(String),

    /// Unit handle does not resolve
    #[error("Unit with id {0} not found")]
    UnitNotFound(i32),

    /// Type handle or name does not resolve
    #[error("Type '{0}' not found")]
    TypeNotFound(String),

    /// Method handle does not resolve
    #[error("Method with id {0} not found")]
    MethodNotFound(i32),

    /// Static field missing on a type
    #[error("Field '{type_name}.{field}' not found")]
    FieldNotFound {
        type_name: String,
        field: String,
    },

    /// Field exists but cannot hold a function pointer
    #[error("Field '{type_name}.{field}' is not a function pointer field")]
    NotFunctionPointerField {
        type_name: String,
        field: String,
    },

    /// Writing to a located field faulted
    #[error("Failed to write field '{type_name}.{field}': {message}")]
    FieldWriteFault {
        type_name: String,
        field: String,
        message: String,
    },

    /// Container cannot be unloaded
    #[error("Container '{0}' is not collectible")]
    NotCollectible(String),

    /// Units did not become unreachable in time
    #[error("Timed out waiting for container '{container}' to drain ({pending} unit(s) still reachable)")]
    UnloadTimeout {
        container: String,
        pending: usize,
    },

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Declared type has no marshalling rule
    #[error("Unsupported marshal type '{0}'")]
    UnsupportedMarshalType(String),

    /// Value shape does not match the declared type
    #[error("Cannot marshal {value} as '{declared}'")]
    ValueMismatch {
        value: &'static str,
        declared: String,
    },

    /// Native cell or struct size mismatch
    #[error("Size mismatch for '{type_name}': expected {expected} bytes, got {actual}")]
    SizeMismatch {
        type_name: String,
        expected: usize,
        actual: usize,
    },

    /// String contains an interior null code unit
    #[error("String contains an interior null terminator")]
    InteriorNul,

    /// Array is pinned and cannot be relocated
    #[error("Array is pinned by {0} native view(s)")]
    Pinned(usize),

    /// Failed to load a code unit
    #[error("Failed to load unit '{path}': {message}")]
    LoadError {
        path: PathBuf,
        message: String,
    },

    /// Library does not contain required symbol
    #[error("Symbol '{symbol}' not found in library '{library}'")]
    SymbolNotFound {
        library: String,
        symbol: String,
    },

    /// Version mismatch
    #[error("Version mismatch: unit API version {unit_version}, expected {expected_version}")]
    VersionMismatch {
        unit_version: u32,
        expected_version: u32,
    },

    /// Type signature could not be parsed
    #[error("Invalid type signature '{0}'")]
    InvalidSignature(String),

    /// Method body failed or is missing
    #[error("Invocation of '{method}' failed: {message}")]
    InvokeFailed {
        method: String,
        message: String,
    },

    /// Bridge used before `initialize`
    #[error("Bridge is not initialized")]
    NotInitialized,

    /// Configuration could not be read
    #[error("Configuration error: {0}")]
    Config(String),

    /// File watcher could not be set up
    #[error("Hot-reload failed: {0}")]
    HotReloadFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl InteropError {
    /// Create an invalid argument error
    pub fn invalid_argument(name: &'static str, message: impl Into<String>) -> Self {
        InteropError::InvalidArgument {
            name,
            message: message.into(),
        }
    }

    /// Create a load error
    pub fn load_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        InteropError::LoadError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a symbol not found error
    pub fn symbol_not_found(library: impl Into<String>, symbol: impl Into<String>) -> Self {
        InteropError::SymbolNotFound {
            library: library.into(),
            symbol: symbol.into(),
        }
    }

    /// Create an invocation failure
    pub fn invoke_failed(method: impl Into<String>, message: impl Into<String>) -> Self {
        InteropError::InvokeFailed {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create a value/declared-type mismatch
    pub fn mismatch(value: &'static str, declared: impl Into<String>) -> Self {
        InteropError::ValueMismatch {
            value,
            declared: declared.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            InteropError::InvalidArgument { .. }
            | InteropError::InvalidSignature(_)
            | InteropError::Config(_) => ErrorKind::Argument,
            InteropError::ContainerNotFound(_)
            | InteropError::UnitNotFound(_)
            | InteropError::TypeNotFound(_)
            | InteropError::MethodNotFound(_)
            | InteropError::FieldNotFound { .. }
            | InteropError::NotFunctionPointerField { .. } => ErrorKind::NotFound,
            InteropError::NotCollectible(_)
            | InteropError::UnloadTimeout { .. }
            | InteropError::InvalidState(_)
            | InteropError::Pinned(_)
            | InteropError::NotInitialized
            | InteropError::HotReloadFailed(_) => ErrorKind::State,
            InteropError::UnsupportedMarshalType(_)
            | InteropError::ValueMismatch { .. }
            | InteropError::SizeMismatch { .. }
            | InteropError::InteriorNul
            | InteropError::InvokeFailed { .. } => ErrorKind::Marshal,
            InteropError::LoadError { .. }
            | InteropError::SymbolNotFound { .. }
            | InteropError::VersionMismatch { .. }
            | InteropError::IoError(_) => ErrorKind::Load,
            InteropError::FieldWriteFault { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether the boundary should flag this error as fatal
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
