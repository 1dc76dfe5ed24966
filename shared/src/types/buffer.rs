//! Host instrumentation buffers

use serde::{Deserialize, Serialize};

use super::activity::{Activity, ActivityKind};
use super::span::TraceSpan;

/// All host activities recorded for one iteration of one net.
///
/// Handed to the trace engine exactly once; ownership transfers on that call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostTraceBuffer {
    pub span: TraceSpan,

    /// Number of device operations launched by this iteration.
    /// Negative when the producer does not know.
    pub device_op_count: i32,

    pub activities: Vec<Activity>,
}

impl HostTraceBuffer {
    pub fn new(span: TraceSpan) -> Self {
        Self {
            span,
            device_op_count: -1,
            activities: Vec::new(),
        }
    }

    pub fn with_device_op_count(mut self, count: i32) -> Self {
        self.device_op_count = count;
        self
    }

    /// Append an activity bounded by nothing yet and return it for filling in
    pub fn emplace_activity(&mut self, kind: ActivityKind, name: impl Into<String>) -> &mut Activity {
        self.activities.push(Activity::new(kind, name));
        self.span.op_count += 1;
        let last = self.activities.len() - 1;
        &mut self.activities[last]
    }

    /// Append a fully built activity
    pub fn push(&mut self, activity: Activity) {
        self.activities.push(activity);
        self.span.op_count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emplace_counts_ops() {
        let mut buffer = HostTraceBuffer::new(TraceSpan::new(0, 100, "net"));
        let op = buffer.emplace_activity(ActivityKind::CpuOp, "op1");
        op.start_ns = 10;
        op.end_ns = 20;
        buffer.push(Activity::new(ActivityKind::CpuOp, "op2"));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.span.op_count, 2);
        assert_eq!(buffer.activities[0].start_ns, 10);
        assert_eq!(buffer.device_op_count, -1);
    }
}
