//! Net inclusion policy
//!
//! Decides, per completed iteration of a net, whether its activities are
//! kept. Names that fail the name filter or the device op threshold are added
//! to a disabled set; device activity linked to a disabled net is dropped
//! during attribution. Running out of the iteration budget only rejects the
//! iterations past it, so device work of earlier iterations survives. Device
//! activity that cannot be linked to any net is never disabled here.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct IterationFilter {
    name_filters: Vec<String>,
    device_op_count_threshold: i32,
    target: Option<String>,
    target_count: i32,
    cpu_only: bool,
    completed: BTreeMap<String, i32>,
    disabled: HashSet<String>,
    over_budget: HashSet<String>,
}

impl IterationFilter {
    pub fn new(
        name_filters: Vec<String>,
        device_op_count_threshold: i32,
        target: Option<String>,
        target_count: i32,
        cpu_only: bool,
    ) -> Self {
        Self {
            name_filters,
            device_op_count_threshold,
            target: target.filter(|t| !t.is_empty()),
            target_count,
            cpu_only,
            ..Default::default()
        }
    }

    /// True when no filters are set or `name` contains one of them
    pub fn apply_name_filter(&self, name: &str) -> bool {
        self.name_filters.is_empty() || self.name_filters.iter().any(|f| name.contains(f.as_str()))
    }

    /// Unknown (negative) counts always pass
    pub fn passes_device_op_threshold(&self, device_op_count: i32) -> bool {
        self.cpu_only || device_op_count < 0 || device_op_count >= self.device_op_count_threshold
    }

    /// Decide one completed iteration of `name`; returns false when the net
    /// is disabled or this iteration is past the target budget.
    pub fn complete_iteration(&mut self, name: &str, device_op_count: i32) -> bool {
        if !self.apply_name_filter(name) || !self.passes_device_op_threshold(device_op_count) {
            self.disable(name);
        }
        let mut within_budget = true;
        if self.target.as_deref() == Some(name) && self.target_count > 0 {
            let completed = self.completed.entry(name.to_string()).or_insert(0);
            *completed += 1;
            if *completed > self.target_count {
                debug!("Net {} is past its {} iteration budget", name, self.target_count);
                self.over_budget.insert(name.to_string());
                within_budget = false;
            }
        }
        within_budget && !self.is_disabled(name)
    }

    /// Whether iterations of `name` have run past the target budget
    pub fn is_over_budget(&self, name: &str) -> bool {
        self.over_budget.contains(name)
    }

    /// Whether `name` is, or becomes, the tracked iteration target.
    ///
    /// Without a configured target the first net passing the filters is
    /// picked; with one, the first net whose name contains it.
    pub fn target_match(&mut self, name: &str, device_op_count: i32) -> bool {
        if self.target.as_deref() == Some(name) {
            return true;
        }
        if !self.apply_name_filter(name) || !self.passes_device_op_threshold(device_op_count) {
            return false;
        }
        let matched = match &self.target {
            None => true,
            Some(target) => name.contains(target.as_str()),
        };
        if matched {
            info!("Tracking net {} for {} iterations", name, self.target_count);
            self.target = Some(name.to_string());
        }
        matched
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn target_count(&self) -> i32 {
        self.target_count
    }

    pub fn disable(&mut self, name: &str) {
        if !self.disabled.contains(name) {
            self.disabled.insert(name.to_string());
        }
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.contains(name)
    }

    /// Disabled names together with nets that ran past their budget
    pub fn disabled(&self) -> impl Iterator<Item = &str> + '_ {
        self.disabled
            .union(&self.over_budget)
            .map(String::as_str)
    }

    /// Forget per-pass decisions; the configured policy is kept
    pub fn clear(&mut self) {
        self.completed.clear();
        self.disabled.clear();
        self.over_budget.clear();
    }
}
