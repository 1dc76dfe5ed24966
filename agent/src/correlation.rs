//! Device to host correlation
//!
//! Device records carry a backend-issued correlation id. External
//! correlation records map those ids to host-assigned external ids, in one
//! of two namespaces. Host activities are registered under their external
//! id as they are processed, so a device record resolves in two hops.

use std::collections::{HashMap, HashSet};

use tandem_gpu::record::DeviceCorrelationId;
use tandem_shared::CorrelationId;
use tracing::warn;

use crate::buffers::ActivityRef;

/// Emit the out-of-order warning once per this many occurrences
const OUT_OF_ORDER_LOG_INTERVAL: u64 = 100;

/// Correlation namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationFlow {
    /// Framework operators
    Default,
    /// User annotations
    User,
}

#[derive(Debug, Default)]
pub struct CorrelationEngine {
    events: HashMap<CorrelationId, ActivityRef>,
    default_map: HashMap<DeviceCorrelationId, CorrelationId>,
    user_map: HashMap<DeviceCorrelationId, CorrelationId>,
    // External ids looked up before their host activity was registered
    missed: HashSet<CorrelationId>,
    out_of_order: u64,
}

impl CorrelationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, flow: CorrelationFlow) -> &HashMap<DeviceCorrelationId, CorrelationId> {
        match flow {
            CorrelationFlow::Default => &self.default_map,
            CorrelationFlow::User => &self.user_map,
        }
    }

    /// Register that `device_id` belongs to `external_id` in `flow`.
    /// Last write wins.
    pub fn add_correlation(&mut self, external_id: CorrelationId, device_id: DeviceCorrelationId, flow: CorrelationFlow) {
        let map = match flow {
            CorrelationFlow::Default => &mut self.default_map,
            CorrelationFlow::User => &mut self.user_map,
        };
        map.insert(device_id, external_id);
    }

    /// Register a host activity under its external id
    pub fn insert_event(&mut self, external_id: CorrelationId, activity: ActivityRef) {
        if self.events.contains_key(&external_id) || self.missed.remove(&external_id) {
            if self.out_of_order % OUT_OF_ORDER_LOG_INTERVAL == 0 {
                warn!("Events processed out of order - link will be missing");
            }
            self.out_of_order += 1;
        }
        self.events.insert(external_id, activity);
    }

    /// External id registered for `device_id` in `flow`
    pub fn external_id(&self, device_id: DeviceCorrelationId, flow: CorrelationFlow) -> Option<CorrelationId> {
        self.map(flow).get(&device_id).copied()
    }

    /// Resolve a device correlation id to its host activity
    pub fn lookup(&mut self, device_id: DeviceCorrelationId, flow: CorrelationFlow) -> Option<ActivityRef> {
        let external_id = self.external_id(device_id, flow)?;
        let found = self.events.get(&external_id).copied();
        if found.is_none() {
            self.missed.insert(external_id);
        }
        found
    }

    /// Number of out-of-order registrations seen this pass
    pub fn out_of_order_count(&self) -> u64 {
        self.out_of_order
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.default_map.clear();
        self.user_map.clear();
        self.missed.clear();
        self.out_of_order = 0;
    }
}
