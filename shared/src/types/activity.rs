//! Activity record definitions
//!
//! An [`Activity`] is one timestamped occurrence on either the host or a
//! device timeline. Host activities come from instrumentation buffers, device
//! activities from a hardware backend or a plugin.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Timestamp in nanoseconds since the UNIX epoch
pub type Timestamp = i64;

/// Device id (GPU ordinal, or the host pid for host activities)
pub type DeviceId = i64;

/// Execution resource id (stream, queue or host thread)
pub type ResourceId = i64;

/// Host-assigned correlation id linking device work back to a host activity
pub type CorrelationId = u64;

/// Kind of activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Host-side operator
    CpuOp,
    /// User annotation on the host timeline
    UserAnnotation,
    /// User annotation projected onto a device stream
    GpuUserAnnotation,
    GpuMemcpy,
    GpuMemset,
    /// Device kernel execution
    ConcurrentKernel,
    ExternalCorrelation,
    /// Runtime API call made by the host
    RuntimeApi,
    /// Driver API call made by the host
    DriverApi,
    CpuInstantEvent,
    PythonFunction,
    /// Profiler overhead marker
    Overhead,
    DeviceSync,
    GpuPmCounter,
    ProfilerRange,
}

impl ActivityKind {
    /// All kinds, in declaration order
    pub const ALL: [ActivityKind; 15] = [
        ActivityKind::CpuOp,
        ActivityKind::UserAnnotation,
        ActivityKind::GpuUserAnnotation,
        ActivityKind::GpuMemcpy,
        ActivityKind::GpuMemset,
        ActivityKind::ConcurrentKernel,
        ActivityKind::ExternalCorrelation,
        ActivityKind::RuntimeApi,
        ActivityKind::DriverApi,
        ActivityKind::CpuInstantEvent,
        ActivityKind::PythonFunction,
        ActivityKind::Overhead,
        ActivityKind::DeviceSync,
        ActivityKind::GpuPmCounter,
        ActivityKind::ProfilerRange,
    ];

    /// Stable lowercase name, as used in configuration files and trace output
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::CpuOp => "cpu_op",
            ActivityKind::UserAnnotation => "user_annotation",
            ActivityKind::GpuUserAnnotation => "gpu_user_annotation",
            ActivityKind::GpuMemcpy => "gpu_memcpy",
            ActivityKind::GpuMemset => "gpu_memset",
            ActivityKind::ConcurrentKernel => "concurrent_kernel",
            ActivityKind::ExternalCorrelation => "external_correlation",
            ActivityKind::RuntimeApi => "runtime_api",
            ActivityKind::DriverApi => "driver_api",
            ActivityKind::CpuInstantEvent => "cpu_instant_event",
            ActivityKind::PythonFunction => "python_function",
            ActivityKind::Overhead => "overhead",
            ActivityKind::DeviceSync => "device_sync",
            ActivityKind::GpuPmCounter => "gpu_pm_counter",
            ActivityKind::ProfilerRange => "profiler_range",
        }
    }

    /// Whether activities of this kind execute on a device timeline
    pub fn is_device(&self) -> bool {
        matches!(
            self,
            ActivityKind::GpuUserAnnotation
                | ActivityKind::GpuMemcpy
                | ActivityKind::GpuMemset
                | ActivityKind::ConcurrentKernel
                | ActivityKind::DeviceSync
                | ActivityKind::GpuPmCounter
        )
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActivityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        ActivityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Invalid activity kind: {}", s))
    }
}

/// Kind of flow link between two activities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// No recognised link type
    #[default]
    Unspecified,
    /// Forward/backward pass pairing
    FwdBwd,
    /// Asynchronous host to device handoff
    AsyncCpuGpu,
}

/// Directional relationship between two activities, used for visualization
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowLink {
    pub id: u32,
    pub kind: LinkKind,
    /// True on the activity where the flow originates
    pub start: bool,
}

/// One timestamped occurrence on the host or a device timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub kind: ActivityKind,

    /// Display name (operator, kernel or API name)
    pub name: String,

    /// Device ordinal for device work, process id for host work
    pub device: DeviceId,

    /// Stream for device work, system thread id for host work
    pub resource: ResourceId,

    /// Host thread that issued the activity
    pub thread_id: i32,

    pub start_ns: Timestamp,
    pub end_ns: Timestamp,

    /// Producer-assigned identity
    pub id: i64,

    /// Correlation id, when the activity takes part in correlation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<CorrelationId>,

    /// Correlation id of the host activity this device activity resolved to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_correlation: Option<CorrelationId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<FlowLink>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Activity {
    /// Create an activity of the given kind with empty bounds
    pub fn new(kind: ActivityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            device: 0,
            resource: 0,
            thread_id: 0,
            start_ns: 0,
            end_ns: 0,
            id: 0,
            correlation: None,
            linked_correlation: None,
            flow: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Set the start and end timestamps
    pub fn with_bounds(mut self, start_ns: Timestamp, end_ns: Timestamp) -> Self {
        self.start_ns = start_ns;
        self.end_ns = end_ns;
        self
    }

    /// Set the device and resource ids
    pub fn on_resource(mut self, device: DeviceId, resource: ResourceId) -> Self {
        self.device = device;
        self.resource = resource;
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationId) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn duration_ns(&self) -> i64 {
        self.end_ns - self.start_ns
    }

    /// Insert a metadata entry, replacing any previous value for `key`
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }
}
