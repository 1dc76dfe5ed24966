//! Error types for the trace engine

use tandem_gpu::{BackendError, SinkError};
use thiserror::Error;

use crate::profiler::RunloopState;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("profiler is busy ({0:?})")]
    Busy(RunloopState),

    #[error("profiler has not been configured")]
    NotConfigured,

    #[error("no trace has been started")]
    NotStarted,

    #[error("invalid trace configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}
