//! Device-side spans of user annotations
//!
//! A user annotation on the host can cover many device operations on one
//! stream. Each (device, stream) pair accumulates, per annotation, a span
//! covering all device work correlated to it through the user flow.

use std::collections::{BTreeMap, HashMap};

use tandem_gpu::TraceSink;
use tandem_shared::{Activity, ActivityKind, CorrelationId, DeviceId, ResourceId};

type StreamKey = (DeviceId, ResourceId);

#[derive(Debug, Default)]
struct StreamSpans {
    spans: Vec<Activity>,
    by_correlation: HashMap<CorrelationId, usize>,
}

#[derive(Debug, Default)]
pub struct GpuUserEventMap {
    streams: BTreeMap<StreamKey, StreamSpans>,
}

impl GpuUserEventMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `device` into the span of `host` on the device's stream.
    ///
    /// The first call for a (stream, annotation) creates a span with the
    /// device activity's bounds; later calls widen it.
    pub fn insert_or_extend(&mut self, host: &Activity, device: &Activity) {
        let Some(correlation) = host.correlation else {
            return;
        };
        let stream = self.streams.entry((device.device, device.resource)).or_default();
        let index = match stream.by_correlation.get(&correlation) {
            Some(index) => *index,
            None => {
                let mut span = Activity::new(ActivityKind::GpuUserAnnotation, host.name.clone())
                    .with_bounds(device.start_ns, device.end_ns)
                    .on_resource(device.device, device.resource);
                span.correlation = Some(correlation);
                span.thread_id = host.thread_id;
                stream.spans.push(span);
                stream.by_correlation.insert(correlation, stream.spans.len() - 1);
                stream.spans.len() - 1
            }
        };

        let span = &mut stream.spans[index];
        if device.start_ns < span.start_ns || span.start_ns == 0 {
            span.start_ns = device.start_ns;
        }
        if device.end_ns > span.end_ns {
            span.end_ns = device.end_ns;
        }
    }

    /// Span for `correlation` on `(device, resource)`, if any
    pub fn get(&self, device: DeviceId, resource: ResourceId, correlation: CorrelationId) -> Option<&Activity> {
        let stream = self.streams.get(&(device, resource))?;
        stream.by_correlation.get(&correlation).map(|i| &stream.spans[*i])
    }

    /// Emit every span, by stream then first-seen order
    pub fn log_events(&self, sink: &mut dyn TraceSink) {
        for stream in self.streams.values() {
            for span in &stream.spans {
                sink.handle_activity(span);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.streams.values().map(|s| s.spans.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }
}
