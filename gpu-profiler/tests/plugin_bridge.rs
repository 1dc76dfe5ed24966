use std::collections::BTreeSet;
use std::ffi::{c_char, c_int, CString};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tandem_gpu::error::{PLUGIN_ERR_INCOMPATIBLE_VERSION, PLUGIN_ERR_NULL_ARGUMENT, PLUGIN_OK};
use tandem_gpu::plugin::abi::*;
use tandem_gpu::plugin::{PluginProfiler, UNKNOWN_PROFILER_NAME};
use tandem_gpu::{ChildProfiler, SessionError, SinkError, TraceSink, TraceStatus};
use tandem_shared::{Activity, ActivityKind, TraceSpan};

const BASE_NS: i64 = 1_000_000_000;
const START_FAILURE: c_int = 7;
const NOT_RUNNING: c_int = 9;

/// Calls seen by the mock plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Calls {
    created: usize,
    destroyed: usize,
    started: usize,
    stopped: usize,
    processed: usize,
}

static CALLS: Mutex<Calls> = Mutex::new(Calls {
    created: 0,
    destroyed: 0,
    started: 0,
    stopped: 0,
    processed: 0,
});

// The mock keeps global counters, so tests in this file run one at a time.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn serialize() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    *calls() = Calls {
        created: 0,
        destroyed: 0,
        started: 0,
        stopped: 0,
        processed: 0,
    };
    guard
}

fn calls() -> MutexGuard<'static, Calls> {
    CALLS.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MockInstance {
    running: bool,
}

unsafe extern "C" fn mock_create(params: *mut ProfilerCreateParams) -> c_int {
    let Some(params) = params.as_mut() else {
        return PLUGIN_ERR_NULL_ARGUMENT;
    };
    if params.unpadded_struct_size < PROFILER_CREATE_PARAMS_UNPADDED_STRUCT_SIZE {
        return PLUGIN_ERR_INCOMPATIBLE_VERSION;
    }
    let instance = Box::new(MockInstance { running: false });
    params.profiler_handle = Box::into_raw(instance) as *mut PluginProfilerHandle;
    calls().created += 1;
    PLUGIN_OK
}

/// A plugin built against a newer ABI that needs a larger create struct
unsafe extern "C" fn strict_create(params: *mut ProfilerCreateParams) -> c_int {
    let Some(params) = params.as_mut() else {
        return PLUGIN_ERR_NULL_ARGUMENT;
    };
    if params.unpadded_struct_size < PROFILER_CREATE_PARAMS_UNPADDED_STRUCT_SIZE + 8 {
        return PLUGIN_ERR_INCOMPATIBLE_VERSION;
    }
    mock_create(params)
}

unsafe extern "C" fn mock_destroy(params: *mut ProfilerDestroyParams) -> c_int {
    let Some(params) = params.as_mut() else {
        return PLUGIN_ERR_NULL_ARGUMENT;
    };
    if params.profiler_handle.is_null() {
        return PLUGIN_ERR_NULL_ARGUMENT;
    }
    drop(Box::from_raw(params.profiler_handle as *mut MockInstance));
    calls().destroyed += 1;
    PLUGIN_OK
}

unsafe extern "C" fn mock_query(params: *mut ProfilerQueryParams) -> c_int {
    let Some(params) = params.as_mut() else {
        return PLUGIN_ERR_NULL_ARGUMENT;
    };
    if params.unpadded_struct_size < PROFILER_QUERY_PARAMS_UNPADDED_STRUCT_SIZE {
        return PLUGIN_ERR_INCOMPATIBLE_VERSION;
    }

    let name = b"MockProfiler";
    let len = name.len().min(params.profiler_name_max_len);
    std::ptr::copy_nonoverlapping(name.as_ptr() as *const c_char, params.profiler_name, len);
    *params.profiler_name.add(len) = 0;

    let supported = [
        PluginEventType::RUNTIME_API,
        PluginEventType::DRIVER_API,
        PluginEventType::CONCURRENT_KERNEL,
        PluginEventType::GPU_MEMCPY,
    ];
    for (i, ty) in supported.iter().take(params.supported_activity_types_max_len).enumerate() {
        *params.supported_activity_types.add(i) = *ty;
    }
    PLUGIN_OK
}

unsafe extern "C" fn mock_start(params: *mut ProfilerStartParams) -> c_int {
    let Some(params) = params.as_mut() else {
        return PLUGIN_ERR_NULL_ARGUMENT;
    };
    let instance = &mut *(params.profiler_handle as *mut MockInstance);
    instance.running = true;
    calls().started += 1;
    PLUGIN_OK
}

unsafe extern "C" fn failing_start(_params: *mut ProfilerStartParams) -> c_int {
    START_FAILURE
}

unsafe extern "C" fn mock_stop(params: *mut ProfilerStopParams) -> c_int {
    let Some(params) = params.as_mut() else {
        return PLUGIN_ERR_NULL_ARGUMENT;
    };
    let instance = &mut *(params.profiler_handle as *mut MockInstance);
    if !instance.running {
        return NOT_RUNNING;
    }
    instance.running = false;
    calls().stopped += 1;
    PLUGIN_OK
}

unsafe fn emit(builder: &TraceBuilder, event_type: PluginEventType, name: &str, start: i64, end: i64, id: i64) {
    let event = ProfileEvent {
        unpadded_struct_size: PROFILE_EVENT_UNPADDED_STRUCT_SIZE,
        event_type,
        start_time_utc_ns: start,
        end_time_utc_ns: end,
        event_id: id,
        device_id: 0,
        resource_id: 123,
        thread_id: 77,
    };
    assert_eq!((builder.add_event)(builder.handle, &event), PLUGIN_OK);
    let name = CString::new(name).unwrap();
    assert_eq!((builder.set_last_event_name)(builder.handle, name.as_ptr()), PLUGIN_OK);
}

unsafe extern "C" fn mock_process_events(params: *mut ProfilerProcessEventsParams) -> c_int {
    let Some(params) = params.as_mut() else {
        return PLUGIN_ERR_NULL_ARGUMENT;
    };
    let Some(builder) = params.trace_builder.as_ref() else {
        return PLUGIN_ERR_NULL_ARGUMENT;
    };
    if builder.unpadded_struct_size < TRACE_BUILDER_UNPADDED_STRUCT_SIZE {
        return PLUGIN_ERR_INCOMPATIBLE_VERSION;
    }

    emit(builder, PluginEventType::RUNTIME_API, "cudaLaunchKernel", BASE_NS, BASE_NS + 5_000, 1);
    emit(builder, PluginEventType::DRIVER_API, "cuLaunchKernel", BASE_NS + 10_000, BASE_NS + 15_000, 2);
    emit(builder, PluginEventType::CONCURRENT_KERNEL, "test_kernel", BASE_NS + 20_000, BASE_NS + 50_000, 3);
    emit(builder, PluginEventType::GPU_MEMCPY, "cudaMemcpyHtoD", BASE_NS + 60_000, BASE_NS + 70_000, 4);

    let stream = CString::new("stream 123").unwrap();
    let info = ProfileResourceInfo {
        unpadded_struct_size: PROFILE_RESOURCE_INFO_UNPADDED_STRUCT_SIZE,
        device_id: 0,
        resource_id: 123,
        display_order: 1,
        name: stream.as_ptr(),
    };
    let rc = (builder.add_resource_info)(builder.handle, &info);

    calls().processed += 1;
    rc
}

fn interface() -> ProfilerInterface {
    ProfilerInterface {
        unpadded_struct_size: PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE,
        profiler_create: Some(mock_create),
        profiler_destroy: Some(mock_destroy),
        profiler_query: Some(mock_query),
        profiler_start: Some(mock_start),
        profiler_stop: Some(mock_stop),
        profiler_process_events: Some(mock_process_events),
    }
}

#[derive(Default)]
struct CollectingSink {
    activities: Vec<Activity>,
}

impl TraceSink for CollectingSink {
    fn handle_trace_span(&mut self, _span: &TraceSpan) {}

    fn handle_activity(&mut self, activity: &Activity) {
        self.activities.push(activity.clone());
    }

    fn finalize_trace(&mut self, _end_ns: i64) -> Result<(), SinkError> {
        Ok(())
    }
}

fn runtime_kinds() -> BTreeSet<ActivityKind> {
    BTreeSet::from([ActivityKind::RuntimeApi])
}

#[test]
fn test_query_reports_name_and_activities() {
    let _guard = serialize();
    let profiler = PluginProfiler::new(interface());
    assert_eq!(profiler.name(), "MockProfiler");
    let expected = BTreeSet::from([
        ActivityKind::RuntimeApi,
        ActivityKind::DriverApi,
        ActivityKind::ConcurrentKernel,
        ActivityKind::GpuMemcpy,
    ]);
    assert_eq!(profiler.available_activities(), &expected);
}

#[test]
fn test_events_cross_the_bridge_unchanged() {
    let _guard = serialize();
    let profiler = PluginProfiler::new(interface());
    let mut session = profiler.configure(&runtime_kinds()).unwrap();
    assert_eq!(session.status(), TraceStatus::Ready);

    session.start().unwrap();
    assert_eq!(session.status(), TraceStatus::Recording);
    session.stop().unwrap();
    assert_eq!(session.status(), TraceStatus::Processing);

    let mut sink = CollectingSink::default();
    session.process_trace(&mut sink).unwrap();
    assert_eq!(session.status(), TraceStatus::Ready);

    let expected = [
        (ActivityKind::RuntimeApi, "cudaLaunchKernel", BASE_NS, BASE_NS + 5_000, 1),
        (ActivityKind::DriverApi, "cuLaunchKernel", BASE_NS + 10_000, BASE_NS + 15_000, 2),
        (ActivityKind::ConcurrentKernel, "test_kernel", BASE_NS + 20_000, BASE_NS + 50_000, 3),
        (ActivityKind::GpuMemcpy, "cudaMemcpyHtoD", BASE_NS + 60_000, BASE_NS + 70_000, 4),
    ];
    assert_eq!(sink.activities.len(), expected.len());
    for (activity, (kind, name, start, end, id)) in sink.activities.iter().zip(expected) {
        assert_eq!(activity.kind, kind);
        assert_eq!(activity.name, name);
        assert_eq!(activity.start_ns, start);
        assert_eq!(activity.end_ns, end);
        assert_eq!(activity.id, id);
        assert_eq!(activity.resource, 123);
        assert_eq!(activity.thread_id, 77);
    }

    let buffer = session.take_trace_buffer().unwrap();
    assert_eq!(buffer.len(), 4);
    assert_eq!(buffer.span.name, "MockProfiler");
    assert!(session.take_trace_buffer().is_none());

    let resources = session.resource_infos();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].resource_id, 123);
    assert_eq!(resources[0].name, "stream 123");
    assert!(session.errors().is_empty());
}

#[test]
fn test_session_lifecycle_creates_and_destroys_once() {
    let _guard = serialize();
    let profiler = PluginProfiler::new(interface());
    {
        let mut session = profiler.configure(&runtime_kinds()).unwrap();
        session.start().unwrap();
        session.stop().unwrap();
        assert_eq!(
            *calls(),
            Calls {
                created: 1,
                destroyed: 0,
                started: 1,
                stopped: 1,
                processed: 0,
            }
        );
    }
    assert_eq!(calls().destroyed, 1);
}

#[test]
fn test_configure_needs_supported_activity() {
    let _guard = serialize();
    let profiler = PluginProfiler::new(interface());
    assert!(profiler
        .configure(&BTreeSet::from([ActivityKind::CpuOp, ActivityKind::UserAnnotation]))
        .is_none());
    assert!(profiler
        .configure(&BTreeSet::from([ActivityKind::CpuOp, ActivityKind::GpuMemcpy]))
        .is_some());
    assert_eq!(calls().created, 1);
}

#[test]
fn test_newer_plugin_rejects_smaller_create_params() {
    let _guard = serialize();
    let profiler = PluginProfiler::new(ProfilerInterface {
        profiler_create: Some(strict_create),
        ..interface()
    });
    let mut session = profiler.configure(&runtime_kinds()).unwrap();
    assert_eq!(session.status(), TraceStatus::Degraded);
    assert_eq!(session.start(), Err(SessionError::NullHandle));

    let mut sink = CollectingSink::default();
    assert_eq!(session.process_trace(&mut sink), Err(SessionError::NullHandle));
    assert!(sink.activities.is_empty());

    let errors = session.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("profilerCreate"));
    assert_eq!(calls().created, 0);
    drop(session);
    assert_eq!(calls().destroyed, 0);
}

#[test]
fn test_older_interface_table_is_refused() {
    let _guard = serialize();
    let profiler = PluginProfiler::new(ProfilerInterface {
        unpadded_struct_size: PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE - 8,
        ..interface()
    });
    assert_eq!(profiler.name(), UNKNOWN_PROFILER_NAME);
    assert_eq!(calls().created, 0);
}

#[test]
fn test_plugin_failure_keeps_its_code() {
    let _guard = serialize();
    let profiler = PluginProfiler::new(ProfilerInterface {
        profiler_start: Some(failing_start),
        ..interface()
    });
    let mut session = profiler.configure(&runtime_kinds()).unwrap();
    let err = session.start().unwrap_err();
    assert_eq!(err.code(), START_FAILURE);
    assert_eq!(session.status(), TraceStatus::Ready);
    assert_eq!(session.errors().len(), 1);
}
