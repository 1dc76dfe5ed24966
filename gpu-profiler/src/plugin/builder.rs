//! Host-side trace builder handed to plugins during `process_events`
//!
//! Plugins never see this type. They receive a [`TraceBuilder`] table whose
//! opaque handle points back here, and every entry point validates its input
//! before touching the buffer.

use std::ffi::{c_char, c_int, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};

use tandem_shared::{Activity, ActivityKind, FlowLink, HostTraceBuffer, LinkKind, ResourceInfo, TraceSpan};
use tracing::error;

use super::abi::{
    checked_ref, ProfileEvent, ProfileEventFlow, ProfileResourceInfo, TraceBuilder,
    TraceBuilderHandle, TRACE_BUILDER_UNPADDED_STRUCT_SIZE,
};
use crate::error::{AbiError, PLUGIN_OK};

/// Collects plugin events into a [`HostTraceBuffer`]
#[derive(Debug)]
pub struct PluginTraceBuilder {
    buffer: Option<HostTraceBuffer>,
    resource_infos: Vec<ResourceInfo>,
}

impl PluginTraceBuilder {
    pub fn new(span: TraceSpan) -> Self {
        Self {
            buffer: Some(HostTraceBuffer::new(span)),
            resource_infos: Vec::new(),
        }
    }

    fn buffer_mut(&mut self) -> Result<&mut HostTraceBuffer, AbiError> {
        self.buffer.as_mut().ok_or(AbiError::BuilderClosed)
    }

    fn last_event(&mut self, what: &'static str) -> Result<&mut Activity, AbiError> {
        self.buffer_mut()?
            .activities
            .last_mut()
            .ok_or(AbiError::NoLastEvent(what))
    }

    /// Append an event. Its name is set by a later call.
    pub fn add_event(&mut self, event: &ProfileEvent) -> Result<(), AbiError> {
        let kind = ActivityKind::from(event.event_type);
        let activity = self.buffer_mut()?.emplace_activity(kind, "");
        activity.start_ns = event.start_time_utc_ns;
        activity.end_ns = event.end_time_utc_ns;
        activity.id = event.event_id;
        activity.device = event.device_id as i64;
        activity.resource = event.resource_id as i64;
        activity.thread_id = event.thread_id;
        Ok(())
    }

    pub fn set_last_event_name(&mut self, name: &str) -> Result<(), AbiError> {
        self.last_event("name")?.name = name.to_string();
        Ok(())
    }

    pub fn set_last_event_flow(&mut self, flow: &ProfileEventFlow) -> Result<(), AbiError> {
        self.last_event("flow")?.flow = Some(FlowLink {
            id: flow.flow_id,
            kind: LinkKind::from(flow.flow_type),
            start: flow.is_start_point != 0,
        });
        Ok(())
    }

    pub fn add_last_event_metadata(&mut self, key: &str, value: &str) -> Result<(), AbiError> {
        self.last_event("metadata")?.add_metadata(key, value);
        Ok(())
    }

    /// Record a resource descriptor; a missing name falls back to the resource id
    pub fn add_resource_info(&mut self, info: &ProfileResourceInfo, name: Option<&str>) {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| info.resource_id.to_string());
        self.resource_infos.push(ResourceInfo::new(
            info.device_id,
            info.resource_id,
            info.display_order,
            name,
        ));
    }

    /// Table of C entry points bound to this builder
    ///
    /// The table borrows `self` through a raw handle; it must not be used after
    /// this builder moves or is dropped.
    pub fn as_c_builder(&mut self) -> TraceBuilder {
        TraceBuilder {
            unpadded_struct_size: TRACE_BUILDER_UNPADDED_STRUCT_SIZE,
            handle: self as *mut Self as *mut TraceBuilderHandle,
            add_event: c_add_event,
            set_last_event_name: c_set_last_event_name,
            set_last_event_flow: c_set_last_event_flow,
            add_last_event_metadata: c_add_last_event_metadata,
            add_resource_info: c_add_resource_info,
        }
    }

    /// Release ownership of the collected activities
    pub fn take_trace_buffer(&mut self) -> Option<HostTraceBuffer> {
        self.buffer.take()
    }

    pub fn resource_infos(&self) -> &[ResourceInfo] {
        &self.resource_infos
    }
}

/// Run one entry point, converting errors and panics into return codes
fn guarded<F>(operation: &'static str, f: F) -> c_int
where
    F: FnOnce() -> Result<(), AbiError>,
{
    let result = catch_unwind(AssertUnwindSafe(f)).unwrap_or(Err(AbiError::Panicked));
    match result {
        Ok(()) => PLUGIN_OK,
        Err(e) => {
            error!("Trace builder {} rejected: {}", operation, e);
            e.code()
        }
    }
}

/// # Safety
///
/// `handle` must be null or come from [`PluginTraceBuilder::as_c_builder`]
/// on a builder that is still alive and not otherwise borrowed.
unsafe fn builder_from<'a>(handle: *mut TraceBuilderHandle) -> Result<&'a mut PluginTraceBuilder, AbiError> {
    if handle.is_null() {
        return Err(AbiError::NullArgument("trace builder handle"));
    }
    Ok(unsafe { &mut *(handle as *mut PluginTraceBuilder) })
}

/// # Safety
///
/// `ptr` must be null or a valid NUL-terminated string.
unsafe fn c_str(ptr: *const c_char, what: &'static str) -> Result<String, AbiError> {
    if ptr.is_null() {
        return Err(AbiError::NullArgument(what));
    }
    Ok(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

unsafe extern "C" fn c_add_event(handle: *mut TraceBuilderHandle, event: *const ProfileEvent) -> c_int {
    guarded("add_event", || unsafe {
        let builder = builder_from(handle)?;
        let event = checked_ref(event)?;
        builder.add_event(event)
    })
}

unsafe extern "C" fn c_set_last_event_name(handle: *mut TraceBuilderHandle, name: *const c_char) -> c_int {
    guarded("set_last_event_name", || unsafe {
        let builder = builder_from(handle)?;
        let name = c_str(name, "event name")?;
        builder.set_last_event_name(&name)
    })
}

unsafe extern "C" fn c_set_last_event_flow(
    handle: *mut TraceBuilderHandle,
    flow: *const ProfileEventFlow,
) -> c_int {
    guarded("set_last_event_flow", || unsafe {
        let builder = builder_from(handle)?;
        let flow = checked_ref(flow)?;
        builder.set_last_event_flow(flow)
    })
}

unsafe extern "C" fn c_add_last_event_metadata(
    handle: *mut TraceBuilderHandle,
    key: *const c_char,
    value: *const c_char,
) -> c_int {
    guarded("add_last_event_metadata", || unsafe {
        let builder = builder_from(handle)?;
        let key = c_str(key, "metadata key")?;
        let value = c_str(value, "metadata value")?;
        builder.add_last_event_metadata(&key, &value)
    })
}

unsafe extern "C" fn c_add_resource_info(
    handle: *mut TraceBuilderHandle,
    info: *const ProfileResourceInfo,
) -> c_int {
    guarded("add_resource_info", || unsafe {
        let builder = builder_from(handle)?;
        let info = checked_ref(info)?;
        let name = if info.name.is_null() {
            None
        } else {
            Some(c_str(info.name, "resource name")?)
        };
        builder.add_resource_info(info, name.as_deref());
        Ok(())
    })
}
