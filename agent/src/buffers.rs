//! Activity ownership arena
//!
//! [`ActivityBuffers`] owns every host trace buffer ingested during one
//! collection pass. Other structures refer to activities through
//! [`ActivityRef`] handles, which carry the pass generation they were issued
//! in. [`ActivityBuffers::clear`] starts a new generation, after which every
//! earlier handle resolves to `None`.

use tandem_shared::{Activity, HostTraceBuffer};

/// Handle to one activity inside an [`ActivityBuffers`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityRef {
    generation: u64,
    buffer: u32,
    index: u32,
}

#[derive(Debug, Default)]
pub struct ActivityBuffers {
    generation: u64,
    host: Vec<HostTraceBuffer>,
}

impl ActivityBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a host buffer; returns its position in the arena
    pub fn push_host(&mut self, buffer: HostTraceBuffer) -> usize {
        self.host.push(buffer);
        self.host.len() - 1
    }

    /// Handle for activity `index` of host buffer `buffer`, if both exist
    pub fn host_ref(&self, buffer: usize, index: usize) -> Option<ActivityRef> {
        let activities = &self.host.get(buffer)?.activities;
        if index >= activities.len() {
            return None;
        }
        Some(ActivityRef {
            generation: self.generation,
            buffer: u32::try_from(buffer).ok()?,
            index: u32::try_from(index).ok()?,
        })
    }

    /// Resolve a handle; stale handles from an earlier pass yield `None`
    pub fn get(&self, handle: ActivityRef) -> Option<&Activity> {
        if handle.generation != self.generation {
            return None;
        }
        self.host
            .get(handle.buffer as usize)?
            .activities
            .get(handle.index as usize)
    }

    pub fn host_buffers(&self) -> &[HostTraceBuffer] {
        &self.host
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drop all buffers and invalidate every handle issued so far
    pub fn clear(&mut self) {
        self.host.clear();
        self.generation += 1;
    }
}
