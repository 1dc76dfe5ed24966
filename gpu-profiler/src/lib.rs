//! Device activity sources for Tandem
//!
//! Hardware activity backends deliver timestamped device records; plugin
//! profilers deliver finished activities through a versioned C ABI. Both
//! sit behind the same session and sink abstractions so the trace engine
//! can drive them interchangeably.

pub mod error;
pub mod plugin;
pub mod record;
pub mod session;
pub mod sink;

pub use error::{AbiError, BackendError, LoadError, SessionError, SinkError};
pub use record::{ApiRecord, CorrelationRecord, DeviceRecord, ExternalCorrelationKind, KernelRecord};
pub use session::{ChildProfiler, ProfilerSession, TraceStatus};
pub use sink::TraceSink;

use std::collections::BTreeSet;
use tandem_shared::ActivityKind;

/// Hardware activity backend interface
///
/// Implementations wrap a vendor activity API. Records may also be pushed
/// asynchronously by the backend's own callback thread; this trait covers the
/// synchronous control surface used by the runloop.
pub trait ActivityBackend: Send {
    /// Backend name, for logs
    fn name(&self) -> &str;

    /// Start recording the given activity kinds
    fn enable_activities(&mut self, kinds: &BTreeSet<ActivityKind>) -> Result<(), BackendError>;

    /// Stop recording the given activity kinds
    fn disable_activities(&mut self, kinds: &BTreeSet<ActivityKind>) -> Result<(), BackendError>;

    /// Discard everything buffered so far
    fn clear_activities(&mut self);

    /// Flush the backend and hand over all buffered records, oldest first
    fn drain_records(&mut self) -> Vec<DeviceRecord>;

    /// Set by the backend when it must stop collecting, e.g. buffer limit hit
    fn stop_requested(&self) -> bool {
        false
    }

    /// Upper bound on buffered records before the backend requests a stop
    fn set_max_buffered_records(&mut self, _max_records: usize) {}
}

/// Backend used when tracing host activity only
#[derive(Debug, Default)]
pub struct NullBackend;

impl ActivityBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn enable_activities(&mut self, _kinds: &BTreeSet<ActivityKind>) -> Result<(), BackendError> {
        Ok(())
    }

    fn disable_activities(&mut self, _kinds: &BTreeSet<ActivityKind>) -> Result<(), BackendError> {
        Ok(())
    }

    fn clear_activities(&mut self) {}

    fn drain_records(&mut self) -> Vec<DeviceRecord> {
        Vec::new()
    }
}
