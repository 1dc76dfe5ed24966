//! Trace sink interface
//!
//! A sink consumes a finished trace one item at a time, in the order the
//! engine hands them over. There is no back-pressure contract.

use std::collections::BTreeMap;

use tandem_shared::{Activity, ProcessInfo, ResourceInfo, ThreadInfo, Timestamp, TraceSpan};

use crate::error::SinkError;

pub trait TraceSink: Send {
    /// Called once before anything else, with trace-level metadata
    fn handle_trace_start(&mut self, _metadata: &BTreeMap<String, String>) {}

    fn handle_process_info(&mut self, _info: &ProcessInfo, _time_ns: Timestamp) {}

    fn handle_thread_info(&mut self, _info: &ThreadInfo, _time_ns: Timestamp) {}

    fn handle_resource_info(&mut self, _info: &ResourceInfo, _time_ns: Timestamp) {}

    /// Running-mean cost of a profiler operation, in microseconds
    fn handle_overhead_info(&mut self, _name: &str, _mean_us: i64, _time_ns: Timestamp) {}

    fn handle_trace_span(&mut self, span: &TraceSpan);

    /// Marks the start of an iteration of the tracked net
    fn handle_iteration_start(&mut self, _span: &TraceSpan) {}

    fn handle_activity(&mut self, activity: &Activity);

    /// Called last; the trace is complete
    fn finalize_trace(&mut self, end_ns: Timestamp) -> Result<(), SinkError>;
}
