//! Background runloop driver
//!
//! [`ProfilerController`] owns a tokio task that steps a shared
//! [`RunloopController`]: every second while idle, faster while a trace is
//! active. Asynchronous trace requests are picked up by that task; the
//! synchronous `prepare_trace` / `start_trace` / `stop_trace` calls drive the
//! profiler directly from the caller's thread.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tandem_gpu::TraceSink;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TraceConfig;
use crate::error::TraceError;
use crate::output::{JsonTraceSink, MemoryTraceSink};
use crate::profiler::{RunloopController, RunloopState};

/// Poll interval while no trace is active
pub const IDLE_INTERVAL: Duration = Duration::from_millis(1000);

/// Poll interval while a trace is active
pub const ACTIVE_INTERVAL: Duration = Duration::from_millis(200);

/// Builds the sink for an asynchronous trace request
pub type SinkFactory = dyn Fn(&TraceConfig) -> Box<dyn TraceSink> + Send + Sync;

/// JSON file when `log_file` is set, in-memory otherwise
pub fn default_sink_factory(config: &TraceConfig) -> Box<dyn TraceSink> {
    match &config.log_file {
        Some(path) => Box::new(JsonTraceSink::new(path)),
        None => Box::new(MemoryTraceSink::new()),
    }
}

pub struct ProfilerController {
    profiler: Arc<RunloopController>,
    async_request: Arc<Mutex<Option<TraceConfig>>>,
    sink_factory: Arc<SinkFactory>,
    cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    trace_completed: Arc<Notify>,
}

impl ProfilerController {
    pub fn new(profiler: Arc<RunloopController>) -> Self {
        Self::with_sink_factory(profiler, Arc::new(default_sink_factory))
    }

    pub fn with_sink_factory(profiler: Arc<RunloopController>, sink_factory: Arc<SinkFactory>) -> Self {
        Self {
            profiler,
            async_request: Arc::new(Mutex::new(None)),
            sink_factory,
            cancel: CancellationToken::new(),
            loop_handle: Mutex::new(None),
            trace_completed: Arc::new(Notify::new()),
        }
    }

    pub fn profiler(&self) -> &Arc<RunloopController> {
        &self.profiler
    }

    /// Queue a trace to be started by the background loop.
    ///
    /// Must be called from within a tokio runtime; the loop is spawned on
    /// first use. A request made while another is pending is dropped.
    pub fn schedule_trace(&self, config: TraceConfig) {
        {
            let mut pending = self.async_request.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.is_some() {
                warn!("Trace request already pending - ignoring new request");
                return;
            }
            info!("Received trace request");
            *pending = Some(config);
        }
        self.ensure_loop();
    }

    fn ensure_loop(&self) {
        let mut handle = self.loop_handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return;
        }
        let profiler = self.profiler.clone();
        let request = self.async_request.clone();
        let factory = self.sink_factory.clone();
        let cancel = self.cancel.clone();
        let completed = self.trace_completed.clone();
        *handle = Some(tokio::spawn(async move {
            run_loop(profiler, request, factory, cancel, completed).await;
        }));
        debug!("Started profiler loop");
    }

    /// Configure a synchronous trace, cancelling any trace in progress
    pub fn prepare_trace(&self, config: TraceConfig) -> Result<(), TraceError> {
        if self.profiler.is_active() {
            warn!("Cancelling current trace request in order to start higher priority synchronous request");
            self.profiler.stop_trace(SystemTime::now());
            self.profiler.reset();
        }
        self.profiler.configure(config)
    }

    pub fn start_trace(&self) -> Result<(), TraceError> {
        self.profiler.start_trace(SystemTime::now())
    }

    /// End the synchronous trace and return it
    pub fn stop_trace(&self) -> Result<MemoryTraceSink, TraceError> {
        self.profiler.stop_trace(SystemTime::now());
        if self.profiler.state() != RunloopState::ProcessTrace {
            warn!("No synchronous trace in progress");
            return Err(TraceError::NotStarted);
        }
        let mut sink = MemoryTraceSink::new();
        let result = self.profiler.process_trace(&mut sink);
        self.profiler.reset();
        result.map(|_| sink)
    }

    /// Resolves once the background loop has finished a trace
    pub async fn trace_completed(&self) {
        self.trace_completed.notified().await;
    }

    /// Stop the background loop and wait for it to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.loop_handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(h) = handle {
            if let Err(e) = h.await {
                error!("Profiler loop terminated abnormally: {}", e);
            }
        }
    }
}

impl Drop for ProfilerController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Returns false when the request could not be started
fn start_async_trace(profiler: &RunloopController, config: TraceConfig, factory: &SinkFactory, now: SystemTime) -> bool {
    let sink = factory(&config);
    if let Err(e) = profiler.configure(config) {
        error!("Failed to configure trace: {}", e);
        return false;
    }
    profiler.set_sink(sink);
    if let Err(e) = profiler.start_trace(now) {
        error!("Failed to start trace: {}", e);
        profiler.reset();
        return false;
    }
    true
}

async fn run_loop(
    profiler: Arc<RunloopController>,
    request: Arc<Mutex<Option<TraceConfig>>>,
    factory: Arc<SinkFactory>,
    cancel: CancellationToken,
    completed: Arc<Notify>,
) {
    let mut next_wakeup = SystemTime::now();
    loop {
        if let Ok(wait) = next_wakeup.duration_since(SystemTime::now()) {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => break,
            }
        }
        if cancel.is_cancelled() {
            break;
        }

        let now = SystemTime::now();
        if !profiler.is_active() {
            let pending = request.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(config) = pending {
                if !start_async_trace(&profiler, config, factory.as_ref(), now) {
                    completed.notify_one();
                }
            }
        }

        let interval = if profiler.is_active() { ACTIVE_INTERVAL } else { IDLE_INTERVAL };
        while next_wakeup <= now {
            next_wakeup += interval;
        }

        if profiler.is_active() {
            let step_profiler = profiler.clone();
            let wakeup = next_wakeup;
            match tokio::task::spawn_blocking(move || step_profiler.step(now, wakeup)).await {
                Ok(wakeup) => next_wakeup = wakeup,
                Err(e) => error!("Profiler step failed: {}", e),
            }
            let elapsed = SystemTime::now().duration_since(now).unwrap_or_default();
            debug!("Profiler loop: {}ms", elapsed.as_millis());
            if !profiler.is_active() {
                completed.notify_one();
            }
        }
    }
    debug!("Profiler loop stopped");
}
