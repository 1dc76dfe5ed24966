//! Trace spans
//!
//! A [`TraceSpan`] bounds one iteration of a named unit of work ("net"). Each
//! iteration has a host span, known when the host buffer arrives, and a
//! device span that starts unset and widens as correlated device work is
//! folded in.

use serde::{Deserialize, Serialize};

use super::activity::Timestamp;

/// Prefix given to the device-side span of a net
pub const DEVICE_SPAN_PREFIX: &str = "GPU: ";

/// Half-open interval `[start_ns, end_ns)` bounding one iteration of a net
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSpan {
    pub start_ns: Timestamp,
    pub end_ns: Timestamp,

    /// Number of operations attributed to this span
    pub op_count: i32,

    /// Iteration number of the net, starting at 0
    pub iteration: i32,

    /// Net name
    pub name: String,

    /// Display prefix (empty for host spans)
    #[serde(default)]
    pub prefix: String,
}

impl TraceSpan {
    pub fn new(start_ns: Timestamp, end_ns: Timestamp, name: impl Into<String>) -> Self {
        Self {
            start_ns,
            end_ns,
            op_count: 0,
            iteration: 0,
            name: name.into(),
            prefix: String::new(),
        }
    }

    /// Unset device-side counterpart of a host span
    pub fn device_counterpart(&self, op_count: i32) -> Self {
        Self {
            start_ns: 0,
            end_ns: 0,
            op_count,
            iteration: self.iteration,
            name: self.name.clone(),
            prefix: DEVICE_SPAN_PREFIX.to_string(),
        }
    }

    /// True until the first interval has been folded in
    pub fn is_unset(&self) -> bool {
        self.start_ns == 0 && self.end_ns == 0
    }

    /// Widen the span to the union of its bounds and `[start_ns, end_ns)`.
    ///
    /// Never shrinks: the end timestamp is monotonic once observed.
    pub fn widen(&mut self, start_ns: Timestamp, end_ns: Timestamp) {
        if self.is_unset() {
            self.start_ns = start_ns;
            self.end_ns = end_ns;
            return;
        }
        self.start_ns = self.start_ns.min(start_ns);
        self.end_ns = self.end_ns.max(end_ns);
    }

    /// Whether the span intersects the window `[start_ns, end_ns)`
    pub fn overlaps(&self, start_ns: Timestamp, end_ns: Timestamp) -> bool {
        self.start_ns < end_ns && self.end_ns > start_ns
    }

    pub fn duration_ns(&self) -> i64 {
        self.end_ns - self.start_ns
    }

    /// Name including the display prefix
    pub fn display_name(&self) -> String {
        format!("{}{}", self.prefix, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widen_from_unset() {
        let mut span = TraceSpan::default();
        assert!(span.is_unset());
        span.widen(10, 20);
        assert_eq!((span.start_ns, span.end_ns), (10, 20));
    }

    #[test]
    fn test_widen_is_commutative() {
        let mut a = TraceSpan::default();
        a.widen(10, 20);
        a.widen(15, 30);

        let mut b = TraceSpan::default();
        b.widen(15, 30);
        b.widen(10, 20);

        assert_eq!((a.start_ns, a.end_ns), (10, 30));
        assert_eq!((b.start_ns, b.end_ns), (10, 30));
    }

    #[test]
    fn test_widen_never_shrinks() {
        let mut span = TraceSpan::new(100, 200, "net");
        span.widen(120, 150);
        assert_eq!((span.start_ns, span.end_ns), (100, 200));
    }

    #[test]
    fn test_device_counterpart() {
        let mut host = TraceSpan::new(100, 400, "net");
        host.iteration = 3;
        let device = host.device_counterpart(7);
        assert!(device.is_unset());
        assert_eq!(device.iteration, 3);
        assert_eq!(device.op_count, 7);
        assert_eq!(device.display_name(), "GPU: net");
    }

    #[test]
    fn test_overlaps_half_open() {
        let span = TraceSpan::new(100, 200, "net");
        assert!(span.overlaps(150, 250));
        assert!(!span.overlaps(200, 300));
        assert!(!span.overlaps(0, 100));
    }
}
