//! JSON output
//!
//! Writes a finished trace as one pretty-printed JSON document

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::info;

use tandem_gpu::{SinkError, TraceSink};
use tandem_shared::{Activity, ProcessInfo, ResourceInfo, ThreadInfo, Timestamp, TraceSpan};

use super::{MemoryTraceSink, TraceDocument};

/// Write `document` to `output_path`
pub fn write_trace(document: &TraceDocument, output_path: &Path) -> Result<()> {
    info!("Writing JSON trace: {}", output_path.display());

    let file = File::create(output_path)
        .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;

    let writer = BufWriter::new(file);

    serde_json::to_writer_pretty(writer, document).context("Failed to serialize trace to JSON")?;

    info!(
        "JSON trace written to {} ({} activities)",
        output_path.display(),
        document.activities.len()
    );

    Ok(())
}

/// Buffers the trace and writes it to a file at finalize
#[derive(Debug)]
pub struct JsonTraceSink {
    path: PathBuf,
    inner: MemoryTraceSink,
}

impl JsonTraceSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: MemoryTraceSink::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceSink for JsonTraceSink {
    fn handle_trace_start(&mut self, metadata: &BTreeMap<String, String>) {
        self.inner.handle_trace_start(metadata);
    }

    fn handle_process_info(&mut self, info: &ProcessInfo, time_ns: Timestamp) {
        self.inner.handle_process_info(info, time_ns);
    }

    fn handle_thread_info(&mut self, info: &ThreadInfo, time_ns: Timestamp) {
        self.inner.handle_thread_info(info, time_ns);
    }

    fn handle_resource_info(&mut self, info: &ResourceInfo, time_ns: Timestamp) {
        self.inner.handle_resource_info(info, time_ns);
    }

    fn handle_overhead_info(&mut self, name: &str, mean_us: i64, time_ns: Timestamp) {
        self.inner.handle_overhead_info(name, mean_us, time_ns);
    }

    fn handle_trace_span(&mut self, span: &TraceSpan) {
        self.inner.handle_trace_span(span);
    }

    fn handle_iteration_start(&mut self, span: &TraceSpan) {
        self.inner.handle_iteration_start(span);
    }

    fn handle_activity(&mut self, activity: &Activity) {
        self.inner.handle_activity(activity);
    }

    fn finalize_trace(&mut self, end_ns: Timestamp) -> Result<(), SinkError> {
        self.inner.finalize_trace(end_ns)?;

        let file = File::create(&self.path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self.inner.document())
            .map_err(|e| SinkError::Encode(e.to_string()))?;

        info!("Trace written to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_shared::ActivityKind;

    #[test]
    fn test_write_trace() {
        let document = TraceDocument::default();

        let temp_dir = tempfile::tempdir().unwrap();
        let output_path = temp_dir.path().join("test.json");

        let result = write_trace(&document, &output_path);
        assert!(result.is_ok());

        // Verify file was created
        assert!(output_path.exists());

        // Verify valid JSON
        let contents = std::fs::read_to_string(output_path).unwrap();
        let parsed: TraceDocument = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed, document);
    }

    #[test]
    fn test_sink_writes_at_finalize() {
        let temp_dir = tempfile::tempdir().unwrap();
        let output_path = temp_dir.path().join("trace.json");

        let mut sink = JsonTraceSink::new(&output_path);
        sink.handle_trace_start(&BTreeMap::new());
        sink.handle_activity(&Activity::new(ActivityKind::CpuOp, "op").with_bounds(1, 2));
        assert!(!output_path.exists());

        sink.finalize_trace(5).unwrap();
        let contents = std::fs::read_to_string(&output_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["activities"][0]["name"], "op");
        assert_eq!(parsed["end_ns"], 5);
    }

    #[test]
    fn test_unwritable_path_fails() {
        let mut sink = JsonTraceSink::new("/nonexistent/dir/trace.json");
        sink.handle_trace_start(&BTreeMap::new());
        assert!(matches!(sink.finalize_trace(0), Err(SinkError::Io(_))));
    }
}
