//! Plugin profiler and its sessions
//!
//! [`PluginProfiler`] wraps a plugin's function table and hands out one
//! [`PluginProfilerSession`] per trace. A session whose plugin instance could
//! not be created keeps a null handle and turns every later call into a
//! no-op returning [`SessionError::NullHandle`].

use std::collections::BTreeSet;
use std::ffi::{c_char, c_int, CStr};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use libloading::Library;
use tandem_shared::utils::time::system_time_nanos;
use tandem_shared::{ActivityKind, HostTraceBuffer, ResourceInfo, Timestamp, TraceSpan};
use tracing::{debug, error};

use super::abi::*;
use super::builder::PluginTraceBuilder;
use crate::error::{SessionError, PLUGIN_ERR_INCOMPATIBLE_VERSION, PLUGIN_OK};
use crate::session::{ChildProfiler, ProfilerSession, TraceStatus};
use crate::sink::TraceSink;

/// Bytes reserved for the plugin's name, including the NUL
pub const PROFILER_NAME_BUFFER_LEN: usize = 32;

/// Slots offered to the plugin for its supported event types
pub const MAX_SUPPORTED_ACTIVITY_TYPES: usize = 64;

/// Name used when the plugin does not answer the query
pub const UNKNOWN_PROFILER_NAME: &str = "N/A";

/// Function table plus the library it lives in
struct PluginTable {
    interface: ProfilerInterface,
    compatible: bool,
    // Keeps the code behind `interface` mapped while any session is alive.
    _library: Option<Library>,
}

impl PluginTable {
    fn new(interface: ProfilerInterface, library: Option<Library>) -> Self {
        let compatible = interface.unpadded_struct_size >= PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE;
        if !compatible {
            error!(
                "Plugin profiler interface has an incompatible version (declared size {}, required {})",
                interface.unpadded_struct_size, PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE
            );
        }
        Self {
            interface,
            compatible,
            _library: library,
        }
    }

    /// Invoke one table entry; an incompatible table or missing entry fails
    fn call<P>(&self, entry: Option<unsafe extern "C" fn(*mut P) -> c_int>, params: &mut P) -> c_int {
        match entry {
            Some(f) if self.compatible => unsafe { f(params) },
            _ => PLUGIN_ERR_INCOMPATIBLE_VERSION,
        }
    }
}

/// Plugin instance pointer owned by one session
struct ProfilerHandle(NonNull<PluginProfilerHandle>);

// The plugin instance is only touched through its owning session.
unsafe impl Send for ProfilerHandle {}

/// A child profiler backed by a plugin function table
pub struct PluginProfiler {
    table: Arc<PluginTable>,
    name: String,
    supported: BTreeSet<ActivityKind>,
}

impl PluginProfiler {
    /// Wrap a statically linked plugin table
    pub fn new(interface: ProfilerInterface) -> Self {
        Self::with_library(interface, None)
    }

    pub(crate) fn with_library(interface: ProfilerInterface, library: Option<Library>) -> Self {
        let table = Arc::new(PluginTable::new(interface, library));
        let (name, supported) = query(&table);
        debug!("Plugin profiler {} supports {:?}", name, supported);
        Self { table, name, supported }
    }
}

/// Ask the plugin for its name and supported event types
fn query(table: &PluginTable) -> (String, BTreeSet<ActivityKind>) {
    let mut name_buf = [0u8; PROFILER_NAME_BUFFER_LEN];
    let mut types = [PluginEventType::INVALID; MAX_SUPPORTED_ACTIVITY_TYPES];
    let mut params = ProfilerQueryParams {
        unpadded_struct_size: PROFILER_QUERY_PARAMS_UNPADDED_STRUCT_SIZE,
        profiler_handle: ptr::null_mut(),
        profiler_name: name_buf.as_mut_ptr() as *mut c_char,
        profiler_name_max_len: PROFILER_NAME_BUFFER_LEN - 1,
        supported_activity_types: types.as_mut_ptr(),
        supported_activity_types_max_len: MAX_SUPPORTED_ACTIVITY_TYPES,
    };

    let code = table.call(table.interface.profiler_query, &mut params);
    if code != PLUGIN_OK {
        return (UNKNOWN_PROFILER_NAME.to_string(), default_activities());
    }

    name_buf[PROFILER_NAME_BUFFER_LEN - 1] = 0;
    let name = CStr::from_bytes_until_nul(&name_buf)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| UNKNOWN_PROFILER_NAME.to_string());

    let mut supported: BTreeSet<ActivityKind> = types
        .iter()
        .filter(|ty| **ty != PluginEventType::INVALID)
        .map(|ty| ActivityKind::from(*ty))
        .collect();
    if supported.is_empty() {
        supported = default_activities();
    }
    (name, supported)
}

fn default_activities() -> BTreeSet<ActivityKind> {
    BTreeSet::from([ActivityKind::ProfilerRange])
}

impl ChildProfiler for PluginProfiler {
    fn name(&self) -> &str {
        &self.name
    }

    fn available_activities(&self) -> &BTreeSet<ActivityKind> {
        &self.supported
    }

    fn configure(&self, kinds: &BTreeSet<ActivityKind>) -> Option<Box<dyn ProfilerSession>> {
        if kinds.is_disjoint(&self.supported) {
            debug!("Plugin profiler {} supports none of the requested activities", self.name);
            return None;
        }
        Some(Box::new(PluginProfilerSession::create(
            Arc::clone(&self.table),
            self.name.clone(),
        )))
    }
}

/// One trace's worth of collection from a plugin
pub struct PluginProfilerSession {
    table: Arc<PluginTable>,
    name: String,
    handle: Option<ProfilerHandle>,
    status: TraceStatus,
    last_start_ns: Timestamp,
    last_stop_ns: Timestamp,
    trace_buffer: Option<HostTraceBuffer>,
    resource_infos: Vec<ResourceInfo>,
    errors: Vec<String>,
}

impl PluginProfilerSession {
    fn create(table: Arc<PluginTable>, name: String) -> Self {
        let mut params = ProfilerCreateParams {
            unpadded_struct_size: PROFILER_CREATE_PARAMS_UNPADDED_STRUCT_SIZE,
            profiler_handle: ptr::null_mut(),
        };
        let code = table.call(table.interface.profiler_create, &mut params);

        let mut errors = Vec::new();
        let handle = if code == PLUGIN_OK {
            NonNull::new(params.profiler_handle).map(ProfilerHandle)
        } else {
            let err = SessionError::Failed {
                profiler: name.clone(),
                operation: "profilerCreate",
                code,
            };
            error!("{}", err);
            errors.push(err.to_string());
            None
        };

        let status = if handle.is_some() {
            TraceStatus::Ready
        } else {
            TraceStatus::Degraded
        };

        Self {
            table,
            name,
            handle,
            status,
            last_start_ns: 0,
            last_stop_ns: 0,
            trace_buffer: None,
            resource_infos: Vec::new(),
            errors,
        }
    }

    fn raw_handle(&self) -> Result<*mut PluginProfilerHandle, SessionError> {
        self.handle
            .as_ref()
            .map(|handle| handle.0.as_ptr())
            .ok_or(SessionError::NullHandle)
    }

    fn check(&mut self, operation: &'static str, code: c_int) -> Result<(), SessionError> {
        if code == PLUGIN_OK {
            return Ok(());
        }
        let err = SessionError::Failed {
            profiler: self.name.clone(),
            operation,
            code,
        };
        error!("{}", err);
        self.errors.push(err.to_string());
        Err(err)
    }

    /// Host wall-clock bounds of the last start/stop pair
    pub fn window(&self) -> (Timestamp, Timestamp) {
        (self.last_start_ns, self.last_stop_ns)
    }
}

impl ProfilerSession for PluginProfilerSession {
    fn start(&mut self) -> Result<(), SessionError> {
        self.last_start_ns = system_time_nanos();
        let handle = self.raw_handle()?;
        let mut params = ProfilerStartParams {
            unpadded_struct_size: PROFILER_START_PARAMS_UNPADDED_STRUCT_SIZE,
            profiler_handle: handle,
        };
        let code = self.table.call(self.table.interface.profiler_start, &mut params);
        self.check("profilerStart", code)?;
        self.status = TraceStatus::Recording;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SessionError> {
        self.last_stop_ns = system_time_nanos();
        let handle = self.raw_handle()?;
        let mut params = ProfilerStopParams {
            unpadded_struct_size: PROFILER_STOP_PARAMS_UNPADDED_STRUCT_SIZE,
            profiler_handle: handle,
        };
        let code = self.table.call(self.table.interface.profiler_stop, &mut params);
        self.check("profilerStop", code)?;
        self.status = TraceStatus::Processing;
        Ok(())
    }

    fn process_trace(&mut self, sink: &mut dyn TraceSink) -> Result<(), SessionError> {
        let handle = self.raw_handle()?;

        let span = TraceSpan::new(self.last_start_ns, self.last_stop_ns, self.name.clone());
        let mut builder = PluginTraceBuilder::new(span);
        let c_builder = builder.as_c_builder();
        let mut params = ProfilerProcessEventsParams {
            unpadded_struct_size: PROFILER_PROCESS_EVENTS_PARAMS_UNPADDED_STRUCT_SIZE,
            profiler_handle: handle,
            trace_builder: &c_builder,
        };
        let code = self
            .table
            .call(self.table.interface.profiler_process_events, &mut params);
        let result = self.check("profilerProcessEvents", code);

        // Whatever the plugin managed to add before failing is kept.
        self.resource_infos = builder.resource_infos().to_vec();
        self.trace_buffer = builder.take_trace_buffer();
        if let Some(buffer) = &self.trace_buffer {
            for activity in &buffer.activities {
                sink.handle_activity(activity);
            }
        }
        self.status = TraceStatus::Ready;
        result
    }

    fn status(&self) -> TraceStatus {
        self.status
    }

    fn errors(&self) -> Vec<String> {
        self.errors.clone()
    }

    fn resource_infos(&self) -> Vec<ResourceInfo> {
        self.resource_infos.clone()
    }

    fn take_trace_buffer(&mut self) -> Option<HostTraceBuffer> {
        self.trace_buffer.take()
    }
}

impl Drop for PluginProfilerSession {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let mut params = ProfilerDestroyParams {
            unpadded_struct_size: PROFILER_DESTROY_PARAMS_UNPADDED_STRUCT_SIZE,
            profiler_handle: handle.0.as_ptr(),
        };
        let code = self.table.call(self.table.interface.profiler_destroy, &mut params);
        let _ = self.check("profilerDestroy", code);
    }
}
