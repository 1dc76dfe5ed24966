//! Device activity records as delivered by a hardware backend
//!
//! Backends translate their vendor record layout into [`DeviceRecord`]s; the
//! trace engine correlates them back to host activities.

use tandem_shared::{Activity, ActivityKind, CorrelationId, DeviceId, ResourceId, Timestamp};

/// Backend-issued correlation id, unique per backend within one pass
pub type DeviceCorrelationId = u32;

/// Namespace of an external correlation record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalCorrelationKind {
    /// Correlates with framework operators (default flow)
    Custom0,
    /// Correlates with user annotations (user flow)
    Custom1,
    /// Any other vendor kind; not used for correlation
    Other(u32),
}

/// Links a backend correlation id to a host-assigned external id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRecord {
    pub correlation_id: DeviceCorrelationId,
    pub external_id: CorrelationId,
    pub kind: ExternalCorrelationKind,
}

/// Runtime or driver API call recorded by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRecord {
    /// [`ActivityKind::RuntimeApi`] or [`ActivityKind::DriverApi`]
    pub kind: ActivityKind,
    pub name: String,
    pub process_id: DeviceId,
    /// Low 32 bits of the calling thread's opaque handle
    pub thread_key: i32,
    pub start_ns: Timestamp,
    pub end_ns: Timestamp,
    pub correlation_id: DeviceCorrelationId,
}

/// Work executed on a device: kernel, memcpy or memset
#[derive(Debug, Clone, PartialEq)]
pub struct KernelRecord {
    pub kind: ActivityKind,
    pub name: String,
    pub device: DeviceId,
    pub stream: ResourceId,
    pub start_ns: Timestamp,
    pub end_ns: Timestamp,
    pub correlation_id: DeviceCorrelationId,
}

/// One record from a hardware backend
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceRecord {
    ExternalCorrelation(CorrelationRecord),
    Api(ApiRecord),
    Device(KernelRecord),
    /// A record kind this build does not handle
    Unsupported { raw_kind: u32 },
}

impl ApiRecord {
    /// Host-timeline activity for this call, running on `sys_tid`
    pub fn to_activity(&self, sys_tid: i32) -> Activity {
        let mut activity = Activity::new(self.kind, self.name.clone())
            .with_bounds(self.start_ns, self.end_ns)
            .on_resource(self.process_id, sys_tid as ResourceId);
        activity.thread_id = sys_tid;
        activity.id = self.correlation_id as i64;
        activity.correlation = Some(self.correlation_id as CorrelationId);
        activity
    }
}

impl KernelRecord {
    /// Device-timeline activity for this record
    pub fn to_activity(&self) -> Activity {
        let mut activity = Activity::new(self.kind, self.name.clone())
            .with_bounds(self.start_ns, self.end_ns)
            .on_resource(self.device, self.stream);
        activity.id = self.correlation_id as i64;
        activity.correlation = Some(self.correlation_id as CorrelationId);
        activity
    }
}

impl DeviceRecord {
    pub fn correlation_id(&self) -> Option<DeviceCorrelationId> {
        match self {
            DeviceRecord::ExternalCorrelation(r) => Some(r.correlation_id),
            DeviceRecord::Api(r) => Some(r.correlation_id),
            DeviceRecord::Device(r) => Some(r.correlation_id),
            DeviceRecord::Unsupported { .. } => None,
        }
    }
}
