//! Per-iteration span history
//!
//! Every ingested iteration of a net gets a (host span, device span) pair.
//! Pairs live in an append-only arena so a [`SpanHandle`] stays valid while
//! later iterations are recorded; handles from before [`SpanTracker::clear`]
//! resolve to `None`.

use std::collections::{BTreeMap, HashMap, HashSet};

use tandem_shared::{CorrelationId, Timestamp, TraceSpan};

/// Host span of one iteration and the device span derived from it
#[derive(Debug, Clone, PartialEq)]
pub struct SpanPair {
    pub host: TraceSpan,
    pub device: TraceSpan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanHandle {
    generation: u64,
    index: usize,
}

#[derive(Debug, Default)]
pub struct SpanTracker {
    generation: u64,
    pairs: Vec<SpanPair>,
    history: BTreeMap<String, Vec<usize>>,
    by_correlation: HashMap<CorrelationId, SpanHandle>,
    // Iterations rejected on their own, without disabling the whole net
    disabled: HashSet<usize>,
}

impl SpanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an iteration of `host.name` with an unset device span
    pub fn record_span(&mut self, host: TraceSpan, device_op_count: i32) -> SpanHandle {
        let device = host.device_counterpart(device_op_count);
        let index = self.pairs.len();
        self.history.entry(host.name.clone()).or_default().push(index);
        self.pairs.push(SpanPair { host, device });
        SpanHandle {
            generation: self.generation,
            index,
        }
    }

    /// Remember that host activity `correlation` belongs to `handle`
    pub fn link_correlation(&mut self, correlation: CorrelationId, handle: SpanHandle) {
        self.by_correlation.insert(correlation, handle);
    }

    pub fn span_for(&self, correlation: CorrelationId) -> Option<SpanHandle> {
        let handle = *self.by_correlation.get(&correlation)?;
        self.get(handle).map(|_| handle)
    }

    pub fn get(&self, handle: SpanHandle) -> Option<&SpanPair> {
        if handle.generation != self.generation {
            return None;
        }
        self.pairs.get(handle.index)
    }

    /// Drop device activity of this iteration only
    pub fn disable(&mut self, handle: SpanHandle) {
        if self.get(handle).is_some() {
            self.disabled.insert(handle.index);
        }
    }

    pub fn is_disabled(&self, handle: SpanHandle) -> bool {
        handle.generation == self.generation && self.disabled.contains(&handle.index)
    }

    /// Widen the device span of `handle` to include `[start_ns, end_ns)`
    pub fn update_device_span(&mut self, handle: SpanHandle, start_ns: Timestamp, end_ns: Timestamp) -> bool {
        if handle.generation != self.generation {
            return false;
        }
        match self.pairs.get_mut(handle.index) {
            Some(pair) => {
                pair.device.widen(start_ns, end_ns);
                true
            }
            None => false,
        }
    }

    /// Iterations of `name`, oldest first
    pub fn iterations<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a SpanPair> + 'a {
        self.history
            .get(name)
            .into_iter()
            .flatten()
            .map(move |index| &self.pairs[*index])
    }

    /// All pairs, by net name then iteration order
    pub fn iter(&self) -> impl Iterator<Item = &SpanPair> + '_ {
        self.history
            .values()
            .flatten()
            .map(move |index| &self.pairs[*index])
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
        self.history.clear();
        self.by_correlation.clear();
        self.disabled.clear();
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_survives_growth() {
        let mut tracker = SpanTracker::new();
        let first = tracker.record_span(TraceSpan::new(0, 10, "net"), 2);
        for i in 1..100 {
            tracker.record_span(TraceSpan::new(i * 10, i * 10 + 10, "net"), 2);
        }
        tracker.link_correlation(7, first);

        assert!(tracker.update_device_span(first, 3, 8));
        let pair = tracker.get(tracker.span_for(7).unwrap()).unwrap();
        assert_eq!(pair.host.start_ns, 0);
        assert_eq!((pair.device.start_ns, pair.device.end_ns), (3, 8));
        assert_eq!(pair.device.prefix, "GPU: ");
        assert_eq!(tracker.iterations("net").count(), 100);
    }

    #[test]
    fn test_device_span_only_widens() {
        let mut tracker = SpanTracker::new();
        let handle = tracker.record_span(TraceSpan::new(0, 100, "net"), 1);
        tracker.update_device_span(handle, 20, 40);
        tracker.update_device_span(handle, 25, 30);
        tracker.update_device_span(handle, 10, 35);
        let device = &tracker.get(handle).unwrap().device;
        assert_eq!((device.start_ns, device.end_ns), (10, 40));
    }

    #[test]
    fn test_iter_orders_by_name_then_iteration() {
        let mut tracker = SpanTracker::new();
        tracker.record_span(TraceSpan::new(5, 6, "b"), 0);
        tracker.record_span(TraceSpan::new(1, 2, "a"), 0);
        tracker.record_span(TraceSpan::new(7, 8, "b"), 0);
        let starts: Vec<_> = tracker.iter().map(|p| (p.host.name.as_str(), p.host.start_ns)).collect();
        assert_eq!(starts, vec![("a", 1), ("b", 5), ("b", 7)]);
    }

    #[test]
    fn test_disable_is_per_iteration() {
        let mut tracker = SpanTracker::new();
        let first = tracker.record_span(TraceSpan::new(0, 10, "net"), 1);
        let second = tracker.record_span(TraceSpan::new(10, 20, "net"), 1);
        tracker.disable(second);
        assert!(!tracker.is_disabled(first));
        assert!(tracker.is_disabled(second));

        tracker.clear();
        assert!(!tracker.is_disabled(second));
        let reused = tracker.record_span(TraceSpan::new(0, 10, "net"), 1);
        tracker.record_span(TraceSpan::new(10, 20, "net"), 1);
        assert!(!tracker.is_disabled(reused));
    }

    #[test]
    fn test_clear_invalidates_handles_and_keys() {
        let mut tracker = SpanTracker::new();
        let handle = tracker.record_span(TraceSpan::new(0, 10, "net"), 1);
        tracker.link_correlation(1, handle);

        tracker.clear();
        assert!(tracker.get(handle).is_none());
        assert!(tracker.span_for(1).is_none());
        assert!(!tracker.update_device_span(handle, 0, 1));

        let next = tracker.record_span(TraceSpan::new(0, 10, "other"), 1);
        assert!(tracker.get(handle).is_none());
        assert!(tracker.get(next).is_some());
    }
}
