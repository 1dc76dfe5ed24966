//! Trace sinks
//!
//! A finished trace is collected into a [`TraceDocument`], either kept in
//! memory or written out as JSON.

pub mod json;
pub mod memory;

pub use json::{write_trace, JsonTraceSink};
pub use memory::MemoryTraceSink;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tandem_shared::{Activity, ProcessInfo, ResourceInfo, ThreadInfo, Timestamp, TraceSpan};

/// Overhead mean reported for one profiler operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverheadEntry {
    pub name: String,
    pub mean_us: i64,
}

/// Everything a sink received for one trace, in arrival order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceDocument {
    pub metadata: BTreeMap<String, String>,
    pub processes: Vec<ProcessInfo>,
    pub threads: Vec<ThreadInfo>,
    pub resources: Vec<ResourceInfo>,
    pub overheads: Vec<OverheadEntry>,
    pub spans: Vec<TraceSpan>,
    pub iteration_starts: Vec<TraceSpan>,
    pub activities: Vec<Activity>,
    pub end_ns: Timestamp,
}

impl TraceDocument {
    /// Activities with the given name, in arrival order
    pub fn activities_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Activity> + 'a {
        self.activities.iter().filter(move |a| a.name == name)
    }

    /// Spans whose display name matches, e.g. `"GPU: net"`
    pub fn span_named(&self, display_name: &str) -> Option<&TraceSpan> {
        self.spans.iter().find(|s| s.display_name() == display_name)
    }
}
