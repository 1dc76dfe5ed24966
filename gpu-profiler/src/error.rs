//! Error types used by this crate.

use std::ffi::c_int;
use thiserror::Error;

/// Return code for a successful plugin ABI call
pub const PLUGIN_OK: c_int = 0;
/// A required pointer argument was null
pub const PLUGIN_ERR_NULL_ARGUMENT: c_int = -1;
/// A struct declared a size smaller than this build requires
pub const PLUGIN_ERR_INCOMPATIBLE_VERSION: c_int = -2;
/// A per-last-event call was made before any event was added
pub const PLUGIN_ERR_NO_LAST_EVENT: c_int = -3;
/// The builder no longer owns a trace buffer
pub const PLUGIN_ERR_BUILDER_CLOSED: c_int = -4;
/// A panic was caught at the ABI boundary
pub const PLUGIN_ERR_PANICKED: c_int = -5;
/// The session has no plugin handle
pub const PLUGIN_ERR_NULL_HANDLE: c_int = -6;

/// Validation failures at the plugin ABI boundary
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum AbiError {
    #[error("{0} is null")]
    NullArgument(&'static str),
    #[error("{what} has an incompatible version (declared size {declared}, required {required})")]
    IncompatibleVersion {
        what: &'static str,
        declared: usize,
        required: usize,
    },
    #[error("cannot set {0} as there is no last event")]
    NoLastEvent(&'static str),
    #[error("trace builder no longer owns a buffer")]
    BuilderClosed,
    #[error("panic caught at plugin boundary")]
    Panicked,
}

impl AbiError {
    /// Negative return code reported across the ABI
    pub fn code(&self) -> c_int {
        match self {
            AbiError::NullArgument(_) => PLUGIN_ERR_NULL_ARGUMENT,
            AbiError::IncompatibleVersion { .. } => PLUGIN_ERR_INCOMPATIBLE_VERSION,
            AbiError::NoLastEvent(_) => PLUGIN_ERR_NO_LAST_EVENT,
            AbiError::BuilderClosed => PLUGIN_ERR_BUILDER_CLOSED,
            AbiError::Panicked => PLUGIN_ERR_PANICKED,
        }
    }
}

/// Failures of a profiler session operation
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// The session was never created; every call is a no-op
    #[error("session has no profiler handle")]
    NullHandle,
    /// The backend reported a non-zero code
    #[error("plugin profiler {profiler} failed at {operation}() with error {code}")]
    Failed {
        profiler: String,
        operation: &'static str,
        code: c_int,
    },
}

impl SessionError {
    pub fn code(&self) -> c_int {
        match self {
            SessionError::NullHandle => PLUGIN_ERR_NULL_HANDLE,
            SessionError::Failed { code, .. } => *code,
        }
    }
}

/// Failures of a hardware activity backend
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum BackendError {
    #[error("enable activities: {0}")]
    Enable(String),
    #[error("disable activities: {0}")]
    Disable(String),
}

/// Failures while loading a plugin shared library
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("unable to load plugin library: {0}")]
    Library(#[from] libloading::Error),
    #[error("plugin entry point returned error {0}")]
    EntryPoint(c_int),
}

/// Failures while emitting a finished trace
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("trace sink io: {0}")]
    Io(#[from] std::io::Error),
    #[error("trace sink encode: {0}")]
    Encode(String),
}
