//! C ABI shared with out-of-binary profiler plugins
//!
//! Every struct starts with `unpadded_struct_size`, which the producer sets to
//! the unpadded size of the struct as it was compiled. A receiver reads that
//! field first and refuses the struct when it is smaller than the receiver
//! requires, so fields are only ever appended.

use std::ffi::{c_char, c_int};
use std::mem::{offset_of, size_of};

use tandem_shared::{ActivityKind, LinkKind};

use crate::error::AbiError;

/// Symbol a plugin library exports to hand over its interface table
pub const PLUGIN_ENTRY_POINT: &[u8] = b"tandem_plugin_get_interface\0";

/// Signature of [`PLUGIN_ENTRY_POINT`]
pub type GetInterfaceFn = unsafe extern "C" fn(interface: *mut ProfilerInterface) -> c_int;

/// Size of a struct up to and including its last field, without tail padding
macro_rules! unpadded_size {
    ($ty:ty, $last:ident: $last_ty:ty) => {
        offset_of!($ty, $last) + size_of::<$last_ty>()
    };
}

/// Event type as carried across the ABI
///
/// Values outside the known set are legal input from newer plugins.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginEventType(pub i32);

impl PluginEventType {
    pub const INVALID: Self = Self(0);
    pub const CPU_OP: Self = Self(1);
    pub const USER_ANNOTATION: Self = Self(2);
    pub const GPU_USER_ANNOTATION: Self = Self(3);
    pub const GPU_MEMCPY: Self = Self(4);
    pub const GPU_MEMSET: Self = Self(5);
    pub const CONCURRENT_KERNEL: Self = Self(6);
    pub const EXTERNAL_CORRELATION: Self = Self(7);
    pub const RUNTIME_API: Self = Self(8);
    pub const DRIVER_API: Self = Self(9);
    pub const CPU_INSTANT_EVENT: Self = Self(10);
    pub const PYTHON_FUNCTION: Self = Self(11);
    pub const OVERHEAD: Self = Self(12);
    pub const DEVICE_SYNC: Self = Self(13);
    pub const GPU_PM_COUNTER: Self = Self(14);
}

/// Flow link type as carried across the ABI
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginFlowType(pub i32);

impl PluginFlowType {
    pub const INVALID: Self = Self(0);
    pub const FWD_BWD: Self = Self(1);
    pub const ASYNC_CPU_GPU: Self = Self(2);
}

/// Kind given to events whose type this build does not know
pub const UNKNOWN_EVENT_KIND_FALLBACK: ActivityKind = ActivityKind::ConcurrentKernel;

/// Link kind given to flows whose type this build does not know
pub const UNKNOWN_FLOW_KIND_FALLBACK: LinkKind = LinkKind::Unspecified;

impl From<PluginEventType> for ActivityKind {
    fn from(value: PluginEventType) -> Self {
        match value {
            PluginEventType::CPU_OP => ActivityKind::CpuOp,
            PluginEventType::USER_ANNOTATION => ActivityKind::UserAnnotation,
            PluginEventType::GPU_USER_ANNOTATION => ActivityKind::GpuUserAnnotation,
            PluginEventType::GPU_MEMCPY => ActivityKind::GpuMemcpy,
            PluginEventType::GPU_MEMSET => ActivityKind::GpuMemset,
            PluginEventType::CONCURRENT_KERNEL => ActivityKind::ConcurrentKernel,
            PluginEventType::EXTERNAL_CORRELATION => ActivityKind::ExternalCorrelation,
            PluginEventType::RUNTIME_API => ActivityKind::RuntimeApi,
            PluginEventType::DRIVER_API => ActivityKind::DriverApi,
            PluginEventType::CPU_INSTANT_EVENT => ActivityKind::CpuInstantEvent,
            PluginEventType::PYTHON_FUNCTION => ActivityKind::PythonFunction,
            PluginEventType::OVERHEAD => ActivityKind::Overhead,
            PluginEventType::DEVICE_SYNC => ActivityKind::DeviceSync,
            PluginEventType::GPU_PM_COUNTER => ActivityKind::GpuPmCounter,
            _ => UNKNOWN_EVENT_KIND_FALLBACK,
        }
    }
}

impl From<PluginFlowType> for LinkKind {
    fn from(value: PluginFlowType) -> Self {
        match value {
            PluginFlowType::FWD_BWD => LinkKind::FwdBwd,
            PluginFlowType::ASYNC_CPU_GPU => LinkKind::AsyncCpuGpu,
            _ => UNKNOWN_FLOW_KIND_FALLBACK,
        }
    }
}

/// Opaque plugin-side profiler instance
#[repr(C)]
pub struct PluginProfilerHandle {
    _private: [u8; 0],
}

/// Opaque host-side trace builder
#[repr(C)]
pub struct TraceBuilderHandle {
    _private: [u8; 0],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfileEvent {
    pub unpadded_struct_size: usize,
    pub event_type: PluginEventType,
    pub start_time_utc_ns: i64,
    pub end_time_utc_ns: i64,
    pub event_id: i64,
    pub device_id: i32,
    pub resource_id: i32,
    pub thread_id: i32,
}

pub const PROFILE_EVENT_UNPADDED_STRUCT_SIZE: usize = unpadded_size!(ProfileEvent, thread_id: i32);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfileEventFlow {
    pub unpadded_struct_size: usize,
    pub flow_id: u32,
    pub flow_type: PluginFlowType,
    /// Non-zero on the activity where the flow originates
    pub is_start_point: u8,
}

pub const PROFILE_EVENT_FLOW_UNPADDED_STRUCT_SIZE: usize =
    unpadded_size!(ProfileEventFlow, is_start_point: u8);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProfileResourceInfo {
    pub unpadded_struct_size: usize,
    pub device_id: i64,
    pub resource_id: i64,
    pub display_order: i64,
    /// May be null, in which case the resource id is used as the name
    pub name: *const c_char,
}

pub const PROFILE_RESOURCE_INFO_UNPADDED_STRUCT_SIZE: usize =
    unpadded_size!(ProfileResourceInfo, name: *const c_char);

pub type AddEventFn =
    unsafe extern "C" fn(handle: *mut TraceBuilderHandle, event: *const ProfileEvent) -> c_int;
pub type SetLastEventNameFn =
    unsafe extern "C" fn(handle: *mut TraceBuilderHandle, name: *const c_char) -> c_int;
pub type SetLastEventFlowFn =
    unsafe extern "C" fn(handle: *mut TraceBuilderHandle, flow: *const ProfileEventFlow) -> c_int;
pub type AddLastEventMetadataFn = unsafe extern "C" fn(
    handle: *mut TraceBuilderHandle,
    key: *const c_char,
    value: *const c_char,
) -> c_int;
pub type AddResourceInfoFn =
    unsafe extern "C" fn(handle: *mut TraceBuilderHandle, info: *const ProfileResourceInfo) -> c_int;

/// Callback table the host passes to `process_events`
#[repr(C)]
pub struct TraceBuilder {
    pub unpadded_struct_size: usize,
    pub handle: *mut TraceBuilderHandle,
    pub add_event: AddEventFn,
    pub set_last_event_name: SetLastEventNameFn,
    pub set_last_event_flow: SetLastEventFlowFn,
    pub add_last_event_metadata: AddLastEventMetadataFn,
    pub add_resource_info: AddResourceInfoFn,
}

pub const TRACE_BUILDER_UNPADDED_STRUCT_SIZE: usize =
    unpadded_size!(TraceBuilder, add_resource_info: AddResourceInfoFn);

#[repr(C)]
pub struct ProfilerCreateParams {
    pub unpadded_struct_size: usize,
    /// Out: the new profiler instance
    pub profiler_handle: *mut PluginProfilerHandle,
}

pub const PROFILER_CREATE_PARAMS_UNPADDED_STRUCT_SIZE: usize =
    unpadded_size!(ProfilerCreateParams, profiler_handle: *mut PluginProfilerHandle);

#[repr(C)]
pub struct ProfilerDestroyParams {
    pub unpadded_struct_size: usize,
    pub profiler_handle: *mut PluginProfilerHandle,
}

pub const PROFILER_DESTROY_PARAMS_UNPADDED_STRUCT_SIZE: usize =
    unpadded_size!(ProfilerDestroyParams, profiler_handle: *mut PluginProfilerHandle);

#[repr(C)]
pub struct ProfilerQueryParams {
    pub unpadded_struct_size: usize,
    /// Always null; queries are not tied to an instance
    pub profiler_handle: *mut PluginProfilerHandle,
    /// Out: NUL-terminated name, at most `profiler_name_max_len` bytes before the NUL
    pub profiler_name: *mut c_char,
    pub profiler_name_max_len: usize,
    /// Out: supported event types, unused slots left as `INVALID`
    pub supported_activity_types: *mut PluginEventType,
    pub supported_activity_types_max_len: usize,
}

pub const PROFILER_QUERY_PARAMS_UNPADDED_STRUCT_SIZE: usize =
    unpadded_size!(ProfilerQueryParams, supported_activity_types_max_len: usize);

#[repr(C)]
pub struct ProfilerStartParams {
    pub unpadded_struct_size: usize,
    pub profiler_handle: *mut PluginProfilerHandle,
}

pub const PROFILER_START_PARAMS_UNPADDED_STRUCT_SIZE: usize =
    unpadded_size!(ProfilerStartParams, profiler_handle: *mut PluginProfilerHandle);

#[repr(C)]
pub struct ProfilerStopParams {
    pub unpadded_struct_size: usize,
    pub profiler_handle: *mut PluginProfilerHandle,
}

pub const PROFILER_STOP_PARAMS_UNPADDED_STRUCT_SIZE: usize =
    unpadded_size!(ProfilerStopParams, profiler_handle: *mut PluginProfilerHandle);

#[repr(C)]
pub struct ProfilerProcessEventsParams {
    pub unpadded_struct_size: usize,
    pub profiler_handle: *mut PluginProfilerHandle,
    pub trace_builder: *const TraceBuilder,
}

pub const PROFILER_PROCESS_EVENTS_PARAMS_UNPADDED_STRUCT_SIZE: usize =
    unpadded_size!(ProfilerProcessEventsParams, trace_builder: *const TraceBuilder);

pub type ProfilerCreateFn = unsafe extern "C" fn(params: *mut ProfilerCreateParams) -> c_int;
pub type ProfilerDestroyFn = unsafe extern "C" fn(params: *mut ProfilerDestroyParams) -> c_int;
pub type ProfilerQueryFn = unsafe extern "C" fn(params: *mut ProfilerQueryParams) -> c_int;
pub type ProfilerStartFn = unsafe extern "C" fn(params: *mut ProfilerStartParams) -> c_int;
pub type ProfilerStopFn = unsafe extern "C" fn(params: *mut ProfilerStopParams) -> c_int;
pub type ProfilerProcessEventsFn =
    unsafe extern "C" fn(params: *mut ProfilerProcessEventsParams) -> c_int;

/// Function table a plugin exposes
///
/// Entries are nullable so a partially filled table from a broken plugin
/// cannot be called through.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfilerInterface {
    pub unpadded_struct_size: usize,
    pub profiler_create: Option<ProfilerCreateFn>,
    pub profiler_destroy: Option<ProfilerDestroyFn>,
    pub profiler_query: Option<ProfilerQueryFn>,
    pub profiler_start: Option<ProfilerStartFn>,
    pub profiler_stop: Option<ProfilerStopFn>,
    pub profiler_process_events: Option<ProfilerProcessEventsFn>,
}

pub const PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE: usize =
    unpadded_size!(ProfilerInterface, profiler_process_events: Option<ProfilerProcessEventsFn>);

/// A struct that leads with its declared unpadded size
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with `unpadded_struct_size: usize` as the
/// first field.
pub unsafe trait Versioned {
    /// Name used in logs
    const NAME: &'static str;
    /// Minimum declared size this build accepts
    const REQUIRED_SIZE: usize;
}

macro_rules! versioned {
    ($($ty:ty => $size:expr),* $(,)?) => {
        $(
            unsafe impl Versioned for $ty {
                const NAME: &'static str = stringify!($ty);
                const REQUIRED_SIZE: usize = $size;
            }
        )*
    };
}

versioned! {
    ProfileEvent => PROFILE_EVENT_UNPADDED_STRUCT_SIZE,
    ProfileEventFlow => PROFILE_EVENT_FLOW_UNPADDED_STRUCT_SIZE,
    ProfileResourceInfo => PROFILE_RESOURCE_INFO_UNPADDED_STRUCT_SIZE,
    TraceBuilder => TRACE_BUILDER_UNPADDED_STRUCT_SIZE,
    ProfilerInterface => PROFILER_INTERFACE_UNPADDED_STRUCT_SIZE,
}

/// Check the declared size of `*ptr` and only then borrow the whole struct
///
/// # Safety
///
/// `ptr` must be null or point to readable memory of at least the size the
/// struct declares in its first field, valid for `'a`.
pub unsafe fn checked_ref<'a, T: Versioned>(ptr: *const T) -> Result<&'a T, AbiError> {
    if ptr.is_null() {
        return Err(AbiError::NullArgument(T::NAME));
    }
    // Only the leading size field is read until the size is known to be enough.
    let declared = unsafe { (ptr as *const usize).read_unaligned() };
    if declared < T::REQUIRED_SIZE {
        return Err(AbiError::IncompatibleVersion {
            what: T::NAME,
            declared,
            required: T::REQUIRED_SIZE,
        });
    }
    Ok(unsafe { &*ptr })
}
