//! Profiler session abstraction
//!
//! A child profiler hands out one [`ProfilerSession`] per trace. Sessions are
//! started and stopped alongside the main collection window and asked to
//! emit their activities when the trace is processed.

use std::collections::BTreeSet;

use tandem_shared::{ActivityKind, HostTraceBuffer, ResourceInfo};

use crate::error::SessionError;
use crate::sink::TraceSink;

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    Ready,
    Recording,
    Processing,
    /// Creation failed; every call is a no-op
    Degraded,
}

/// One trace's worth of collection from a child profiler
pub trait ProfilerSession: Send {
    /// Start collection synchronously
    fn start(&mut self) -> Result<(), SessionError>;

    /// Stop collection synchronously
    fn stop(&mut self) -> Result<(), SessionError>;

    /// Emit collected activities to `sink`
    fn process_trace(&mut self, sink: &mut dyn TraceSink) -> Result<(), SessionError>;

    fn status(&self) -> TraceStatus;

    /// Errors seen during this trace
    fn errors(&self) -> Vec<String> {
        Vec::new()
    }

    /// Execution resources used in this trace
    fn resource_infos(&self) -> Vec<ResourceInfo>;

    /// Release ownership of the collected activities
    fn take_trace_buffer(&mut self) -> Option<HostTraceBuffer>;
}

/// A producer of profiler sessions
pub trait ChildProfiler: Send + Sync {
    fn name(&self) -> &str;

    fn available_activities(&self) -> &BTreeSet<ActivityKind>;

    /// Create a session when any of `kinds` is supported, `None` otherwise
    fn configure(&self, kinds: &BTreeSet<ActivityKind>) -> Option<Box<dyn ProfilerSession>>;
}
