//! Trace collection runloop
//!
//! [`RunloopController`] owns all per-pass profiler state behind one mutex.
//! The runloop state and the external stop flag are atomics so that
//! [`RunloopController::is_active`] and [`RunloopController::request_stop`]
//! never wait behind a long processing pass.
//!
//! States move `WaitForRequest -> Warmup -> CollectTrace -> ProcessTrace ->
//! WaitForRequest`. Warmup is skipped when the window has already started.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tandem_gpu::{
    ActivityBackend, ApiRecord, ChildProfiler, CorrelationRecord, DeviceRecord, ExternalCorrelationKind,
    KernelRecord, ProfilerSession, SessionError, TraceSink,
};
use tandem_shared::utils::time::{format_timestamp, from_epoch_nanos, to_epoch_nanos};
use tandem_shared::{Activity, ActivityKind, HostTraceBuffer, ProcessInfo, ThreadInfo, Timestamp};
use tracing::{debug, error, info, trace, warn};

use crate::buffers::ActivityBuffers;
use crate::config::{TraceConfig, DEFAULT_TRACE_DURATION};
use crate::correlation::{CorrelationEngine, CorrelationFlow};
use crate::error::TraceError;
use crate::filter::IterationFilter;
use crate::metrics;
use crate::overhead::{OverheadAccounting, OverheadCounter};
use crate::process;
use crate::spans::SpanTracker;
use crate::user_events::GpuUserEventMap;

/// Runtime calls frequent enough to swamp a trace without adding insight
const IGNORED_RUNTIME_CALLS: [&str; 3] = ["cudaGetDevice", "cudaSetDevice", "cudaGetLastError"];

/// Device descriptors emitted per trace unless host-only
const MAX_DEVICE_COUNT: i64 = 8;

/// Starting this much after the window start is reported as late
const LATE_START_TOLERANCE: Duration = Duration::from_millis(10);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunloopState {
    WaitForRequest = 0,
    Warmup = 1,
    CollectTrace = 2,
    ProcessTrace = 3,
}

impl RunloopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunloopState::Warmup,
            2 => RunloopState::CollectTrace,
            3 => RunloopState::ProcessTrace,
            _ => RunloopState::WaitForRequest,
        }
    }
}

/// Everything guarded by the controller lock
struct ProfilerState {
    config: Option<TraceConfig>,
    backend: Box<dyn ActivityBackend>,
    backend_enabled: bool,
    children: Vec<Box<dyn ChildProfiler>>,
    sessions: Vec<Box<dyn ProfilerSession>>,
    sink: Option<Box<dyn TraceSink>>,

    profile_start: SystemTime,
    capture_window_start: Timestamp,
    capture_window_end: Timestamp,

    buffers: ActivityBuffers,
    correlations: CorrelationEngine,
    spans: SpanTracker,
    user_events: GpuUserEventMap,
    filter: IterationFilter,
    overhead: OverheadAccounting,

    // Keyed by the backend's opaque thread key
    thread_info: BTreeMap<i32, ThreadInfo>,
    metadata: BTreeMap<String, String>,
    pending_device: Vec<DeviceRecord>,
    pending_overflow: bool,
    net_iterations: BTreeMap<String, i32>,
}

pub struct RunloopController {
    state: AtomicU8,
    stop_collection: AtomicBool,
    cpu_only: bool,
    inner: Mutex<ProfilerState>,
}

impl RunloopController {
    /// `cpu_only` disables the hardware backend entirely
    pub fn new(backend: Box<dyn ActivityBackend>, cpu_only: bool) -> Self {
        Self {
            state: AtomicU8::new(RunloopState::WaitForRequest as u8),
            stop_collection: AtomicBool::new(false),
            cpu_only,
            inner: Mutex::new(ProfilerState {
                config: None,
                backend,
                backend_enabled: false,
                children: Vec::new(),
                sessions: Vec::new(),
                sink: None,
                profile_start: SystemTime::UNIX_EPOCH,
                capture_window_start: 0,
                capture_window_end: 0,
                buffers: ActivityBuffers::new(),
                correlations: CorrelationEngine::new(),
                spans: SpanTracker::new(),
                user_events: GpuUserEventMap::new(),
                filter: IterationFilter::default(),
                overhead: OverheadAccounting::default(),
                thread_info: BTreeMap::new(),
                metadata: BTreeMap::new(),
                pending_device: Vec::new(),
                pending_overflow: false,
                net_iterations: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProfilerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RunloopState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn state(&self) -> RunloopState {
        RunloopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Lock-free; safe on instrumentation hot paths
    pub fn is_active(&self) -> bool {
        self.state() != RunloopState::WaitForRequest
    }

    pub fn is_cpu_only(&self) -> bool {
        self.cpu_only
    }

    /// Ask the runloop to end collection at its next step. Lock-free.
    pub fn request_stop(&self) {
        self.stop_collection.store(true, Ordering::SeqCst);
    }

    pub fn register_child_profiler(&self, child: Box<dyn ChildProfiler>) {
        info!("Registered child profiler {}", child.name());
        self.lock().children.push(child);
    }

    /// Sink used when the runloop itself processes the trace
    pub fn set_sink(&self, sink: Box<dyn TraceSink>) {
        self.lock().sink = Some(sink);
    }

    pub fn config(&self) -> Option<TraceConfig> {
        self.lock().config.clone()
    }

    /// Store settings for the next trace. Only valid while idle.
    pub fn configure(&self, mut config: TraceConfig) -> Result<(), TraceError> {
        let mut inner = self.lock();
        let state = self.state();
        if state != RunloopState::WaitForRequest {
            error!("Profiler already busy ({:?}), ignoring configuration", state);
            return Err(TraceError::Busy(state));
        }

        if config.duration.is_zero() {
            config.duration = DEFAULT_TRACE_DURATION;
        }
        config
            .validate()
            .map_err(|e| TraceError::Config(format!("{:#}", e)))?;

        inner.filter = IterationFilter::new(
            config.name_filters.clone(),
            config.device_op_count_threshold,
            config.iterations_target.clone(),
            config.iterations_target_count,
            self.cpu_only,
        );
        if inner.filter.target().is_none() && config.iterations_target_count > 0 {
            info!("Target net for iterations not specified - picking first encountered that passes net filter");
        }
        debug!("Configured trace: {:?}", config);
        inner.config = Some(config);
        Ok(())
    }

    /// Begin a trace with the stored settings
    pub fn start_trace(&self, now: SystemTime) -> Result<(), TraceError> {
        let mut inner = self.lock();
        let state = self.state();
        if state != RunloopState::WaitForRequest {
            return Err(TraceError::Busy(state));
        }
        let config = inner.config.clone().ok_or(TraceError::NotConfigured)?;

        self.reset_trace_data(&mut inner);

        if !self.cpu_only {
            info!("Enabling GPU tracing");
            let ProfilerState {
                backend, overhead, ..
            } = &mut *inner;
            backend.set_max_buffered_records(config.max_pending_device_records);
            overhead
                .setup
                .measure(|| backend.enable_activities(&config.activity_kinds))?;
            inner.backend_enabled = true;
        }

        let sessions: Vec<_> = inner
            .children
            .iter()
            .filter_map(|child| child.configure(&config.activity_kinds))
            .collect();
        inner.sessions = sessions;

        let mut profile_start = config
            .request_timestamp
            .map(|requested| requested + config.max_request_age + config.warmup)
            .unwrap_or(now + config.warmup);
        if profile_start < now {
            profile_start = now + config.warmup;
        }
        inner.profile_start = profile_start;
        info!(
            "Tracing starting in {}s",
            profile_start.duration_since(now).unwrap_or_default().as_secs()
        );

        inner.capture_window_start = 0;
        inner.capture_window_end = 0;
        self.stop_collection.store(false, Ordering::SeqCst);

        if now >= profile_start {
            self.begin_collection(&mut inner, now);
        } else {
            self.set_state(RunloopState::Warmup);
            debug!("WaitForRequest -> Warmup");
        }
        Ok(())
    }

    fn begin_collection(&self, inner: &mut ProfilerState, now: SystemTime) {
        inner.capture_window_start = to_epoch_nanos(now);
        for session in inner.sessions.iter_mut() {
            log_session_error("start", session.start());
        }
        self.set_state(RunloopState::CollectTrace);
        debug!("Warmup -> CollectTrace");
    }

    fn stop_trace_internal(&self, inner: &mut ProfilerState, now: SystemTime) {
        if inner.capture_window_end == 0 {
            inner.capture_window_end = to_epoch_nanos(now);
        }
        if !self.cpu_only && inner.backend_enabled {
            if let Some(config) = inner.config.as_ref() {
                let kinds = &config.activity_kinds;
                let backend = &mut inner.backend;
                if let Err(e) = inner.overhead.setup.measure(|| backend.disable_activities(kinds)) {
                    error!("Failed to disable GPU tracing: {}", e);
                }
            }
            inner.backend_enabled = false;
        }
        for session in inner.sessions.iter_mut() {
            log_session_error("stop", session.stop());
        }

        let state = self.state();
        if state == RunloopState::CollectTrace {
            debug!("CollectTrace -> ProcessTrace");
        } else {
            warn!("Called stop_trace with state == {:?}", state);
        }
        self.set_state(RunloopState::ProcessTrace);
    }

    /// End collection now; the next step (or an explicit
    /// [`process_trace`](Self::process_trace)) finalizes. No-op when idle or
    /// already processing.
    pub fn stop_trace(&self, now: SystemTime) {
        let mut inner = self.lock();
        if matches!(self.state(), RunloopState::Warmup | RunloopState::CollectTrace) {
            self.stop_trace_internal(&mut inner, now);
        }
    }

    /// Drop all per-pass data and return to `WaitForRequest`
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.reset_internal(&mut inner);
    }

    fn reset_internal(&self, inner: &mut ProfilerState) {
        self.reset_trace_data(inner);
        inner.sessions.clear();
        inner.sink = None;
        inner.metadata.clear();
        if inner.backend_enabled {
            if let Some(config) = inner.config.as_ref() {
                if let Err(e) = inner.backend.disable_activities(&config.activity_kinds) {
                    error!("Failed to disable GPU tracing: {}", e);
                }
            }
            inner.backend_enabled = false;
        }
        self.stop_collection.store(false, Ordering::SeqCst);
        self.set_state(RunloopState::WaitForRequest);
    }

    fn reset_trace_data(&self, inner: &mut ProfilerState) {
        if !self.cpu_only {
            inner.backend.clear_activities();
        }
        inner.correlations.clear();
        inner.user_events.clear();
        inner.spans.clear();
        inner.buffers.clear();
        inner.filter.clear();
        inner.pending_device.clear();
        inner.pending_overflow = false;
        inner.net_iterations.clear();
    }

    /// Advance the state machine. Returns the time the caller should step
    /// next, never later than `next_wakeup`.
    pub fn step(&self, now: SystemTime, next_wakeup: SystemTime) -> SystemTime {
        let mut new_wakeup = next_wakeup;
        match self.state() {
            RunloopState::WaitForRequest => {}

            RunloopState::Warmup => {
                let mut inner = self.lock();
                if self.state() != RunloopState::Warmup {
                    return new_wakeup;
                }
                // Flushing is slow; avoid it close to the start time
                if !self.cpu_only && next_wakeup < inner.profile_start {
                    inner.backend.clear_activities();
                }

                if !self.cpu_only && inner.backend.stop_requested() {
                    self.stop_trace_internal(&mut inner, now);
                    self.reset_internal(&mut inner);
                    debug!("Warmup -> WaitForRequest");
                } else if self.stop_collection.swap(false, Ordering::SeqCst) {
                    self.stop_trace_internal(&mut inner, now);
                } else if now >= inner.profile_start {
                    let late = now.duration_since(inner.profile_start).unwrap_or_default();
                    if late > LATE_START_TOLERANCE {
                        warn!("Tracing started {}ms late!", late.as_millis());
                    } else {
                        info!("Tracing started");
                    }
                    self.begin_collection(&mut inner, now);
                } else if next_wakeup > inner.profile_start {
                    new_wakeup = inner.profile_start;
                }
            }

            RunloopState::CollectTrace => {
                let mut inner = self.lock();
                if self.state() != RunloopState::CollectTrace {
                    return new_wakeup;
                }
                // The window start moves when the target net starts
                let duration = inner
                    .config
                    .as_ref()
                    .map(|c| c.duration)
                    .unwrap_or(DEFAULT_TRACE_DURATION);
                let profile_end = from_epoch_nanos(inner.capture_window_start) + duration;

                let backend_stop = !self.cpu_only && inner.backend.stop_requested();
                if now >= profile_end || self.stop_collection.swap(false, Ordering::SeqCst) || backend_stop {
                    info!("Tracing complete");
                    self.stop_trace_internal(&mut inner, now);
                    if now >= profile_end {
                        debug!("Reached profile end time");
                    }
                } else if profile_end < next_wakeup {
                    new_wakeup = profile_end;
                }
            }

            RunloopState::ProcessTrace => {
                let mut inner = self.lock();
                if self.state() != RunloopState::ProcessTrace {
                    return new_wakeup;
                }
                // Without a sink the caller processes synchronously
                if let Some(mut sink) = inner.sink.take() {
                    if let Err(e) = self.process_trace_internal(&mut inner, sink.as_mut()) {
                        error!("Failed to process trace: {}", e);
                    }
                    self.reset_internal(&mut inner);
                    debug!("ProcessTrace -> WaitForRequest");
                }
            }
        }
        new_wakeup
    }

    /// Correlate everything collected and hand the trace to `sink`
    pub fn process_trace(&self, sink: &mut dyn TraceSink) -> Result<(), TraceError> {
        let mut inner = self.lock();
        self.process_trace_internal(&mut inner, sink)
    }

    fn process_trace_internal(&self, inner: &mut ProfilerState, sink: &mut dyn TraceSink) -> Result<(), TraceError> {
        debug_assert!(inner.config.is_some(), "process_trace without a configured trace");
        if inner.config.is_none() {
            error!("Cannot process trace: profiler was never configured");
            return Err(TraceError::NotConfigured);
        }
        let state = self.state();
        let started = matches!(state, RunloopState::CollectTrace | RunloopState::ProcessTrace);
        debug_assert!(started, "process_trace called in state {:?}", state);
        if !started {
            error!("Cannot process trace in state {:?}: no trace was started", state);
            return Err(TraceError::NotStarted);
        }

        info!("Processing {} CPU buffers", inner.buffers.len());
        debug!(
            "Profile time range: {} - {}",
            format_timestamp(inner.capture_window_start),
            format_timestamp(inner.capture_window_end)
        );
        sink.handle_trace_start(&inner.metadata);

        for index in 0..inner.buffers.len() {
            Self::process_host_buffer(inner, index, sink);
        }

        if !self.cpu_only {
            let ProfilerState {
                backend, overhead, ..
            } = &mut *inner;
            let mut records = overhead.flush.measure(|| backend.drain_records());
            records.append(&mut inner.pending_device);
            info!("Processing {} GPU records", records.len());
            for record in &records {
                Self::handle_device_record(inner, record, sink);
            }
        }

        for session in inner.sessions.iter_mut() {
            log_session_error("process", session.process_trace(sink));
            // The activities are in the sink now; drop the session's copy
            if let Some(buffer) = session.take_trace_buffer() {
                debug!("Released {} activities of a profiler session", buffer.activities.len());
            }
            for info in session.resource_infos() {
                sink.handle_resource_info(&info, inner.capture_window_start);
            }
        }

        self.finalize_trace(inner, sink)
    }

    fn process_host_buffer(inner: &mut ProfilerState, index: usize, sink: &mut dyn TraceSink) {
        let ProfilerState {
            buffers,
            correlations,
            spans,
            filter,
            capture_window_start,
            capture_window_end,
            ..
        } = inner;
        let Some(buffer) = buffers.host_buffers().get(index) else {
            return;
        };
        let name = buffer.span.name.as_str();
        debug!(
            "Processing CPU buffer for {} ({}) - {} records",
            name,
            buffer.span.iteration,
            buffer.activities.len()
        );
        if buffer.activities.is_empty() {
            warn!("CPU trace is empty!");
            return;
        }

        let passes = filter.complete_iteration(name, buffer.device_op_count);
        let in_window = buffer.span.overlaps(*capture_window_start, *capture_window_end);
        let log_net = passes && in_window;
        debug!("Log net {}: {}", name, if log_net { "Yes" } else { "No" });

        let handle = spans.record_span(buffer.span.clone(), buffer.device_op_count);
        for (i, activity) in buffer.activities.iter().enumerate() {
            trace!("{:?}: OP {}", activity.correlation, activity.name);
            if log_net {
                sink.handle_activity(activity);
                metrics::ACTIVITIES_LOGGED.inc();
            } else {
                metrics::ACTIVITIES_DROPPED.inc();
            }
            if let (Some(correlation), Some(activity_ref)) = (activity.correlation, buffers.host_ref(index, i)) {
                correlations.insert_event(correlation, activity_ref);
                spans.link_correlation(correlation, handle);
            }
        }

        if log_net {
            sink.handle_trace_span(&buffer.span);
            if filter.target() == Some(name) {
                sink.handle_iteration_start(&buffer.span);
            }
        } else if in_window && filter.is_over_budget(name) && !filter.is_disabled(name) {
            // Earlier iterations keep their device work
            spans.disable(handle);
        } else {
            filter.disable(name);
        }
    }

    /// Whether the iteration owning host activity `host`, or its whole net,
    /// has been disabled. Activity with no known net is never disabled.
    fn logging_disabled(inner: &ProfilerState, host: Option<&Activity>) -> bool {
        let Some(handle) = host.and_then(|h| h.correlation).and_then(|c| inner.spans.span_for(c)) else {
            return false;
        };
        inner.spans.is_disabled(handle)
            || inner
                .spans
                .get(handle)
                .map_or(false, |pair| inner.filter.is_disabled(&pair.host.name))
    }

    fn out_of_range(inner: &ProfilerState, activity: &Activity) -> bool {
        let out = activity.start_ns < inner.capture_window_start || activity.end_ns > inner.capture_window_end;
        if out {
            trace!(
                "Activity outside of profiling window: {} ({} < {} or {} > {})",
                activity.name,
                activity.start_ns,
                inner.capture_window_start,
                activity.end_ns,
                inner.capture_window_end
            );
        }
        out
    }

    fn handle_device_record(inner: &mut ProfilerState, record: &DeviceRecord, sink: &mut dyn TraceSink) {
        match record {
            DeviceRecord::ExternalCorrelation(r) => Self::handle_correlation_record(inner, r),
            DeviceRecord::Api(r) => Self::handle_api_record(inner, r, sink),
            DeviceRecord::Device(r) => Self::handle_kernel_record(inner, r, sink),
            DeviceRecord::Unsupported { raw_kind } => {
                warn!("Unexpected activity type: {}", raw_kind);
            }
        }
    }

    fn handle_correlation_record(inner: &mut ProfilerState, record: &CorrelationRecord) {
        let flow = match record.kind {
            ExternalCorrelationKind::Custom0 => CorrelationFlow::Default,
            ExternalCorrelationKind::Custom1 => CorrelationFlow::User,
            ExternalCorrelationKind::Other(kind) => {
                error!("Received correlation activity with undefined kind: {}", kind);
                return;
            }
        };
        trace!("{}: external correlation {}", record.correlation_id, record.external_id);
        inner
            .correlations
            .add_correlation(record.external_id, record.correlation_id, flow);
    }

    fn handle_api_record(inner: &mut ProfilerState, record: &ApiRecord, sink: &mut dyn TraceSink) {
        if record.kind == ActivityKind::RuntimeApi && IGNORED_RUNTIME_CALLS.contains(&record.name.as_str()) {
            return;
        }
        trace!("{}: {} tid={}", record.correlation_id, record.name, record.thread_key);

        let ext = inner
            .correlations
            .lookup(record.correlation_id, CorrelationFlow::Default);
        let sys_tid = inner
            .thread_info
            .get(&record.thread_key)
            .map_or(record.thread_key, |info| info.sys_tid);
        let mut activity = record.to_activity(sys_tid);

        let host = ext.and_then(|r| inner.buffers.get(r));
        match host {
            Some(host) => activity.linked_correlation = host.correlation,
            None => {
                metrics::UNATTRIBUTED_RECORDS.inc();
                if Self::out_of_range(inner, &activity) {
                    metrics::ACTIVITIES_DROPPED.inc();
                    return;
                }
            }
        }

        if Self::logging_disabled(inner, host) {
            metrics::ACTIVITIES_DROPPED.inc();
            return;
        }
        sink.handle_activity(&activity);
        metrics::ACTIVITIES_LOGGED.inc();
    }

    fn timestamps_in_order(host: &Activity, device: &Activity) -> bool {
        if host.start_ns > device.start_ns {
            warn!(
                "GPU op timestamp ({}) < runtime timestamp ({}) by {}ns",
                device.start_ns,
                host.start_ns,
                host.start_ns - device.start_ns
            );
            warn!(
                "Name: {} Device: {} Stream: {}",
                device.name, device.device, device.resource
            );
            return false;
        }
        true
    }

    fn handle_kernel_record(inner: &mut ProfilerState, record: &KernelRecord, sink: &mut dyn TraceSink) {
        let ext = inner
            .correlations
            .lookup(record.correlation_id, CorrelationFlow::Default);
        let user = inner
            .correlations
            .lookup(record.correlation_id, CorrelationFlow::User);
        let mut activity = record.to_activity();

        let host = ext.and_then(|r| inner.buffers.get(r));
        match host {
            Some(host) => {
                // Broken timestamps are occasionally attached to device records
                if !Self::timestamps_in_order(host, &activity) {
                    metrics::ACTIVITIES_DROPPED.inc();
                    return;
                }
                activity.linked_correlation = host.correlation;
            }
            None => {
                metrics::UNATTRIBUTED_RECORDS.inc();
                if Self::out_of_range(inner, &activity) {
                    metrics::ACTIVITIES_DROPPED.inc();
                    return;
                }
            }
        }
        if Self::logging_disabled(inner, host) {
            metrics::ACTIVITIES_DROPPED.inc();
            return;
        }

        trace!("{:?},{}: {}", activity.linked_correlation, record.correlation_id, activity.name);
        sink.handle_activity(&activity);
        metrics::ACTIVITIES_LOGGED.inc();

        if let Some(handle) = activity.linked_correlation.and_then(|c| inner.spans.span_for(c)) {
            inner.spans.update_device_span(handle, activity.start_ns, activity.end_ns);
        }

        let ProfilerState {
            buffers, user_events, ..
        } = &mut *inner;
        if let Some(user_host) = user.and_then(|r| buffers.get(r)) {
            if !Self::timestamps_in_order(user_host, &activity) {
                return;
            }
            trace!("{:?},{} (user): {}", user_host.correlation, record.correlation_id, activity.name);
            user_events.insert_or_extend(user_host, &activity);
        }
    }

    fn finalize_trace(&self, inner: &mut ProfilerState, sink: &mut dyn TraceSink) -> Result<(), TraceError> {
        info!("Recorded nets:");
        for (name, iterations) in &inner.net_iterations {
            info!("{}: {} iterations", name, iterations);
        }
        inner.net_iterations.clear();

        let window_start = inner.capture_window_start;
        let pid = std::process::id();
        let process_name = process::process_name(pid);
        if !process_name.is_empty() {
            sink.handle_process_info(
                &ProcessInfo {
                    pid: pid as i64,
                    name: process_name.clone(),
                    label: "CPU".to_string(),
                },
                window_start,
            );
            if !self.cpu_only {
                for device in 0..MAX_DEVICE_COUNT {
                    sink.handle_process_info(
                        &ProcessInfo {
                            pid: device,
                            name: process_name.clone(),
                            label: format!("GPU {}", device),
                        },
                        window_start,
                    );
                }
            }
        }

        for info in inner.thread_info.values() {
            sink.handle_thread_info(info, window_start);
        }

        for pair in inner.spans.iter() {
            if pair.device.op_count > 0 && !pair.device.is_unset() {
                sink.handle_trace_span(&pair.device);
            }
        }

        inner.user_events.log_events(sink);

        for (name, mean_us) in inner.overhead.entries() {
            sink.handle_overhead_info(name, mean_us, window_start);
        }
        record_overhead_gauges(&inner.overhead.flush, &inner.overhead.setup);

        sink.finalize_trace(inner.capture_window_end)?;
        metrics::TRACES_COMPLETED.inc();
        info!("Trace complete");
        Ok(())
    }

    /// Hand over a finished host buffer for one iteration of a net.
    /// Discarded unless a trace is collecting or processing.
    pub fn transfer_host_trace(&self, mut buffer: HostTraceBuffer) {
        let mut inner = self.lock();
        let state = self.state();
        let name = buffer.span.name.clone();
        if state != RunloopState::CollectTrace && state != RunloopState::ProcessTrace {
            debug!("Trace collection not in progress - discarding trace of net {}", name);
            return;
        }

        let iteration = inner.net_iterations.entry(name.clone()).or_insert(0);
        buffer.span.iteration = *iteration;
        *iteration += 1;

        debug!(
            "Received iteration {} of net {} ({} activities / {} gpu activities)",
            buffer.span.iteration,
            name,
            buffer.activities.len(),
            buffer.device_op_count
        );

        if state == RunloopState::CollectTrace && inner.filter.target_match(&name, buffer.device_op_count) {
            let target_count = inner.filter.target_count();
            if buffer.span.iteration == 0 {
                debug!("Setting profile start time from net to {}", buffer.span.start_ns);
                inner.capture_window_start = buffer.span.start_ns;
            } else if target_count > 0 && 1 + buffer.span.iteration >= target_count {
                debug!("Completed target iteration count for net {}", name);
                self.stop_collection.store(true, Ordering::SeqCst);
                inner.capture_window_end = buffer.span.end_ns;
            }
        }

        inner.buffers.push_host(buffer);
    }

    /// True when `name` passes the configured net name filter
    pub fn apply_name_filter(&self, name: &str) -> bool {
        self.lock().filter.apply_name_filter(name)
    }

    /// Map a backend thread key to a system thread id, once per key
    pub fn record_thread_info(&self, sys_tid: i32, thread_key: i32) {
        self.lock()
            .thread_info
            .entry(thread_key)
            .or_insert_with(|| ThreadInfo {
                sys_tid,
                name: process::thread_name(sys_tid),
            });
    }

    /// Register the calling thread under its own backend key
    pub fn record_current_thread(&self) {
        self.record_thread_info(process::current_thread_id(), process::current_thread_key());
    }

    /// Attach a key/value pair to the next trace
    pub fn add_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().metadata.insert(key.into(), value.into());
    }

    /// Queue device records delivered by a backend callback thread.
    ///
    /// Beyond the configured cap records are dropped and collection is asked
    /// to stop.
    pub fn handle_device_records(&self, records: Vec<DeviceRecord>) {
        let mut inner = self.lock();
        if !matches!(self.state(), RunloopState::CollectTrace | RunloopState::ProcessTrace) {
            return;
        }
        let cap = inner
            .config
            .as_ref()
            .map_or(usize::MAX, |c| c.max_pending_device_records);
        let room = cap.saturating_sub(inner.pending_device.len());
        let dropped = records.len().saturating_sub(room);
        inner.pending_device.extend(records.into_iter().take(room));
        if dropped > 0 {
            metrics::PENDING_RECORDS_DROPPED.inc_by(dropped as f64);
            if !inner.pending_overflow {
                warn!("Device record buffer full - dropping records and stopping collection");
                inner.pending_overflow = true;
            }
            self.stop_collection.store(true, Ordering::SeqCst);
        }
    }

    /// Capture window bounds in epoch nanoseconds (0 when unset)
    pub fn capture_window(&self) -> (Timestamp, Timestamp) {
        let inner = self.lock();
        (inner.capture_window_start, inner.capture_window_end)
    }

    /// Names disabled during the last processed pass
    pub fn disabled_nets(&self) -> BTreeSet<String> {
        self.lock().filter.disabled().map(str::to_string).collect()
    }

    pub fn overhead(&self) -> OverheadAccounting {
        self.lock().overhead
    }
}

/// Returns whether anything was logged. A degraded session reported its
/// creation failure once already, so its no-op calls stay quiet.
fn log_session_error(operation: &str, result: Result<(), SessionError>) -> bool {
    match result {
        Ok(()) | Err(SessionError::NullHandle) => false,
        Err(e) => {
            error!("Failed to {} profiler session: {}", operation, e);
            true
        }
    }
}

fn record_overhead_gauges(flush: &OverheadCounter, setup: &OverheadCounter) {
    metrics::FLUSH_OVERHEAD_US.set(flush.mean_us() as f64);
    metrics::SETUP_OVERHEAD_US.set(setup.mean_us() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemoryTraceSink;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tandem_gpu::{NullBackend, TraceStatus};
    use tandem_shared::{ResourceInfo, TraceSpan};

    fn t(ms: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000) + Duration::from_millis(ms)
    }

    fn ns(ms: u64) -> Timestamp {
        to_epoch_nanos(t(ms))
    }

    fn controller(config: TraceConfig) -> RunloopController {
        let controller = RunloopController::new(Box::new(NullBackend), true);
        controller.configure(config).unwrap();
        controller
    }

    fn host_buffer(name: &str, start: Timestamp, end: Timestamp, ops: &[(&str, u64)]) -> HostTraceBuffer {
        let mut buffer = HostTraceBuffer::new(TraceSpan::new(start, end, name));
        for (op, correlation) in ops {
            let activity = buffer.emplace_activity(ActivityKind::CpuOp, *op);
            activity.start_ns = start;
            activity.end_ns = end;
            activity.correlation = Some(*correlation);
        }
        buffer
    }

    #[derive(Clone, Default)]
    struct SessionCalls {
        started: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    struct StubSession {
        degraded: bool,
        calls: SessionCalls,
        buffer: Option<HostTraceBuffer>,
    }

    impl ProfilerSession for StubSession {
        fn start(&mut self) -> Result<(), SessionError> {
            if self.degraded {
                return Err(SessionError::NullHandle);
            }
            self.calls.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) -> Result<(), SessionError> {
            if self.degraded {
                return Err(SessionError::NullHandle);
            }
            Ok(())
        }

        fn process_trace(&mut self, sink: &mut dyn TraceSink) -> Result<(), SessionError> {
            if self.degraded {
                return Err(SessionError::NullHandle);
            }
            let mut buffer = HostTraceBuffer::new(TraceSpan::new(ns(1), ns(2), "stub"));
            buffer.emplace_activity(ActivityKind::CpuOp, "session_op");
            for activity in &buffer.activities {
                sink.handle_activity(activity);
            }
            self.buffer = Some(buffer);
            Ok(())
        }

        fn status(&self) -> TraceStatus {
            if self.degraded {
                TraceStatus::Degraded
            } else {
                TraceStatus::Ready
            }
        }

        fn resource_infos(&self) -> Vec<ResourceInfo> {
            Vec::new()
        }

        fn take_trace_buffer(&mut self) -> Option<HostTraceBuffer> {
            let buffer = self.buffer.take();
            if buffer.is_some() {
                self.calls.released.fetch_add(1, Ordering::SeqCst);
            }
            buffer
        }
    }

    struct StubChild {
        kinds: BTreeSet<ActivityKind>,
        degraded: bool,
        calls: SessionCalls,
    }

    impl StubChild {
        fn new(degraded: bool, calls: &SessionCalls) -> Box<Self> {
            Box::new(Self {
                kinds: BTreeSet::from([ActivityKind::CpuOp]),
                degraded,
                calls: calls.clone(),
            })
        }
    }

    impl ChildProfiler for StubChild {
        fn name(&self) -> &str {
            "stub"
        }

        fn available_activities(&self) -> &BTreeSet<ActivityKind> {
            &self.kinds
        }

        fn configure(&self, _kinds: &BTreeSet<ActivityKind>) -> Option<Box<dyn ProfilerSession>> {
            Some(Box::new(StubSession {
                degraded: self.degraded,
                calls: self.calls.clone(),
                buffer: None,
            }))
        }
    }

    #[test]
    fn test_warmup_then_collect() {
        let config = TraceConfig {
            warmup: Duration::from_millis(100),
            duration: Duration::from_millis(500),
            ..Default::default()
        };
        let profiler = controller(config);

        profiler.start_trace(t(0)).unwrap();
        assert_eq!(profiler.state(), RunloopState::Warmup);
        assert!(profiler.is_active());

        // Wakeup is pulled in to the window start
        let wakeup = profiler.step(t(10), t(1_000));
        assert_eq!(wakeup, t(100));
        assert_eq!(profiler.state(), RunloopState::Warmup);

        profiler.step(t(100), t(1_000));
        assert_eq!(profiler.state(), RunloopState::CollectTrace);
        assert_eq!(profiler.capture_window().0, ns(100));

        let wakeup = profiler.step(t(200), t(1_000));
        assert_eq!(wakeup, t(600));
        assert_eq!(profiler.state(), RunloopState::CollectTrace);

        profiler.step(t(600), t(1_000));
        assert_eq!(profiler.state(), RunloopState::ProcessTrace);
        assert_eq!(profiler.capture_window().1, ns(600));
    }

    #[test]
    fn test_start_without_warmup_collects_immediately() {
        let profiler = controller(TraceConfig::default());
        profiler.start_trace(t(0)).unwrap();
        assert_eq!(profiler.state(), RunloopState::CollectTrace);
    }

    #[test]
    fn test_stale_request_timestamp_starts_after_warmup() {
        let config = TraceConfig {
            warmup: Duration::from_millis(50),
            request_timestamp: Some(t(0) - Duration::from_secs(60)),
            ..Default::default()
        };
        let profiler = controller(config);
        profiler.start_trace(t(0)).unwrap();
        assert_eq!(profiler.state(), RunloopState::Warmup);
        profiler.step(t(49), t(1_000));
        assert_eq!(profiler.state(), RunloopState::Warmup);
        profiler.step(t(50), t(1_000));
        assert_eq!(profiler.state(), RunloopState::CollectTrace);
    }

    #[test]
    fn test_stop_request_ends_collection_early() {
        let profiler = controller(TraceConfig::default());
        profiler.start_trace(t(0)).unwrap();
        profiler.request_stop();
        profiler.step(t(1), t(1_000));
        assert_eq!(profiler.state(), RunloopState::ProcessTrace);
    }

    #[test]
    fn test_stop_trace_is_idempotent() {
        let profiler = controller(TraceConfig::default());
        profiler.start_trace(t(0)).unwrap();
        profiler.stop_trace(t(5));
        assert_eq!(profiler.state(), RunloopState::ProcessTrace);
        profiler.stop_trace(t(9));
        assert_eq!(profiler.state(), RunloopState::ProcessTrace);
        assert_eq!(profiler.capture_window().1, ns(5));
    }

    #[test]
    fn test_no_step_leaves_wait_for_request() {
        let profiler = controller(TraceConfig::default());
        for ms in [0, 100, 10_000] {
            profiler.step(t(ms), t(ms + 1_000));
            assert_eq!(profiler.state(), RunloopState::WaitForRequest);
        }
        profiler.stop_trace(t(0));
        assert!(!profiler.is_active());
    }

    #[test]
    fn test_reset_when_never_started() {
        let profiler = RunloopController::new(Box::new(NullBackend), true);
        profiler.reset();
        assert_eq!(profiler.state(), RunloopState::WaitForRequest);
    }

    #[test]
    fn test_busy_and_unconfigured() {
        let profiler = RunloopController::new(Box::new(NullBackend), true);
        assert!(matches!(profiler.start_trace(t(0)), Err(TraceError::NotConfigured)));

        profiler.configure(TraceConfig::default()).unwrap();
        profiler.start_trace(t(0)).unwrap();
        assert!(matches!(
            profiler.configure(TraceConfig::default()),
            Err(TraceError::Busy(RunloopState::CollectTrace))
        ));
        assert!(matches!(profiler.start_trace(t(0)), Err(TraceError::Busy(_))));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "process_trace called in state WaitForRequest")]
    fn test_process_without_start_panics_in_debug() {
        let profiler = controller(TraceConfig::default());
        let mut sink = MemoryTraceSink::new();
        let _ = profiler.process_trace(&mut sink);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_process_without_start_is_rejected() {
        let profiler = controller(TraceConfig::default());
        let mut sink = MemoryTraceSink::new();
        assert!(matches!(profiler.process_trace(&mut sink), Err(TraceError::NotStarted)));
        assert!(!sink.is_finalized());
    }

    #[test]
    fn test_zero_duration_uses_default() {
        let profiler = controller(TraceConfig {
            duration: Duration::ZERO,
            ..Default::default()
        });
        assert_eq!(profiler.config().unwrap().duration, DEFAULT_TRACE_DURATION);
    }

    #[test]
    fn test_transfer_discarded_when_idle() {
        let profiler = controller(TraceConfig::default());
        profiler.transfer_host_trace(host_buffer("net", ns(0), ns(10), &[("op", 1)]));
        profiler.start_trace(t(0)).unwrap();
        profiler.stop_trace(t(100));

        let mut sink = MemoryTraceSink::new();
        profiler.process_trace(&mut sink).unwrap();
        assert!(sink.document().activities.is_empty());
    }

    #[test]
    fn test_target_iterations_stop_collection() {
        let config = TraceConfig {
            iterations_target: Some("train".to_string()),
            iterations_target_count: 3,
            duration: Duration::from_secs(60),
            ..Default::default()
        };
        let profiler = controller(config);
        profiler.start_trace(t(0)).unwrap();

        profiler.transfer_host_trace(host_buffer("train_net", ns(10), ns(20), &[("a", 1)]));
        assert_eq!(profiler.capture_window().0, ns(10));
        profiler.transfer_host_trace(host_buffer("train_net", ns(20), ns(30), &[("a", 2)]));
        profiler.step(t(30), t(1_000));
        assert_eq!(profiler.state(), RunloopState::CollectTrace);

        profiler.transfer_host_trace(host_buffer("train_net", ns(30), ns(40), &[("a", 3)]));
        assert_eq!(profiler.capture_window().1, ns(40));
        profiler.step(t(41), t(1_000));
        assert_eq!(profiler.state(), RunloopState::ProcessTrace);
    }

    #[test]
    fn test_process_logs_host_activities_and_finalizes() {
        let profiler = controller(TraceConfig::default());
        profiler.add_metadata("job", "test");
        profiler.start_trace(t(0)).unwrap();
        profiler.transfer_host_trace(host_buffer("net", ns(10), ns(20), &[("op1", 1), ("op2", 2)]));
        profiler.stop_trace(t(100));

        let mut sink = MemoryTraceSink::new();
        profiler.process_trace(&mut sink).unwrap();
        profiler.reset();

        let doc = sink.document();
        assert_eq!(doc.metadata["job"], "test");
        let names: Vec<_> = doc.activities.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["op1", "op2"]);
        assert_eq!(doc.spans.len(), 1);
        assert_eq!(doc.end_ns, ns(100));
        assert!(sink.is_finalized());
        assert_eq!(profiler.state(), RunloopState::WaitForRequest);
    }

    #[test]
    fn test_step_processes_with_sink() {
        let profiler = controller(TraceConfig::default());
        profiler.start_trace(t(0)).unwrap();
        profiler.stop_trace(t(10));

        // No sink: stays put for a synchronous caller
        profiler.step(t(11), t(1_000));
        assert_eq!(profiler.state(), RunloopState::ProcessTrace);

        profiler.set_sink(Box::new(MemoryTraceSink::new()));
        profiler.step(t(12), t(1_000));
        assert_eq!(profiler.state(), RunloopState::WaitForRequest);
    }

    #[test]
    fn test_thread_info_registered_once() {
        let profiler = controller(TraceConfig::default());
        profiler.record_thread_info(100, 7);
        profiler.record_thread_info(200, 7);
        profiler.start_trace(t(0)).unwrap();
        profiler.stop_trace(t(10));

        let mut sink = MemoryTraceSink::new();
        profiler.process_trace(&mut sink).unwrap();
        assert_eq!(sink.document().threads.len(), 1);
        assert_eq!(sink.document().threads[0].sys_tid, 100);
    }

    #[test]
    fn test_pending_device_records_capped() {
        let profiler = controller(TraceConfig {
            max_pending_device_records: 2,
            ..Default::default()
        });
        let record = DeviceRecord::Unsupported { raw_kind: 99 };

        // Ignored while idle
        profiler.handle_device_records(vec![record.clone(); 5]);
        profiler.start_trace(t(0)).unwrap();
        profiler.handle_device_records(vec![record.clone(); 2]);
        profiler.step(t(1), t(1_000));
        assert_eq!(profiler.state(), RunloopState::CollectTrace);

        profiler.handle_device_records(vec![record]);
        profiler.step(t(2), t(1_000));
        assert_eq!(profiler.state(), RunloopState::ProcessTrace);
    }

    #[test]
    fn test_session_buffers_released_after_processing() {
        let profiler = controller(TraceConfig::default());
        let healthy = SessionCalls::default();
        let degraded = SessionCalls::default();
        profiler.register_child_profiler(StubChild::new(false, &healthy));
        profiler.register_child_profiler(StubChild::new(true, &degraded));

        profiler.start_trace(t(0)).unwrap();
        profiler.stop_trace(t(10));
        let mut sink = MemoryTraceSink::new();
        profiler.process_trace(&mut sink).unwrap();

        assert!(sink.is_finalized());
        assert_eq!(sink.document().activities_named("session_op").count(), 1);
        assert_eq!(healthy.started.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.released.load(Ordering::SeqCst), 1);
        assert_eq!(degraded.started.load(Ordering::SeqCst), 0);
        assert_eq!(degraded.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_degraded_session_errors_are_quiet() {
        assert!(!log_session_error("start", Ok(())));
        assert!(!log_session_error("start", Err(SessionError::NullHandle)));
        let failed = SessionError::Failed {
            profiler: "stub".to_string(),
            operation: "profilerStart",
            code: 3,
        };
        assert!(log_session_error("start", Err(failed)));
    }
}
