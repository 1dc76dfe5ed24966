//! In-memory trace sink

use std::collections::BTreeMap;

use tandem_gpu::{SinkError, TraceSink};
use tandem_shared::{Activity, ProcessInfo, ResourceInfo, ThreadInfo, Timestamp, TraceSpan};

use super::{OverheadEntry, TraceDocument};

/// Keeps the whole trace for the caller to inspect
#[derive(Debug, Clone, Default)]
pub struct MemoryTraceSink {
    document: TraceDocument,
    started: bool,
    finalized: bool,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self) -> &TraceDocument {
        &self.document
    }

    pub fn into_document(self) -> TraceDocument {
        self.document
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl TraceSink for MemoryTraceSink {
    fn handle_trace_start(&mut self, metadata: &BTreeMap<String, String>) {
        self.started = true;
        self.document.metadata.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    fn handle_process_info(&mut self, info: &ProcessInfo, _time_ns: Timestamp) {
        self.document.processes.push(info.clone());
    }

    fn handle_thread_info(&mut self, info: &ThreadInfo, _time_ns: Timestamp) {
        self.document.threads.push(info.clone());
    }

    fn handle_resource_info(&mut self, info: &ResourceInfo, _time_ns: Timestamp) {
        self.document.resources.push(info.clone());
    }

    fn handle_overhead_info(&mut self, name: &str, mean_us: i64, _time_ns: Timestamp) {
        self.document.overheads.push(OverheadEntry {
            name: name.to_string(),
            mean_us,
        });
    }

    fn handle_trace_span(&mut self, span: &TraceSpan) {
        self.document.spans.push(span.clone());
    }

    fn handle_iteration_start(&mut self, span: &TraceSpan) {
        self.document.iteration_starts.push(span.clone());
    }

    fn handle_activity(&mut self, activity: &Activity) {
        self.document.activities.push(activity.clone());
    }

    fn finalize_trace(&mut self, end_ns: Timestamp) -> Result<(), SinkError> {
        debug_assert!(self.started, "finalize_trace without handle_trace_start");
        self.document.end_ns = end_ns;
        self.finalized = true;
        Ok(())
    }
}
