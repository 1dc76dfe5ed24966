//! Descriptors for processes, threads and execution resources.
//! Informational only; none of these take part in identity.

use serde::{Deserialize, Serialize};

use super::activity::{DeviceId, ResourceId};

/// Display metadata for a logical execution resource (stream, queue)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub device_id: DeviceId,
    pub resource_id: ResourceId,
    pub sort_index: i64,
    pub name: String,
}

impl ResourceInfo {
    pub fn new(device_id: DeviceId, resource_id: ResourceId, sort_index: i64, name: impl Into<String>) -> Self {
        Self {
            device_id,
            resource_id,
            sort_index,
            name: name.into(),
        }
    }
}

/// Host thread descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    /// System thread id
    pub sys_tid: i32,
    pub name: String,
}

/// Process (or device pseudo-process) descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i64,
    pub name: String,
    /// "CPU" for the host, "GPU <n>" for devices
    pub label: String,
}
