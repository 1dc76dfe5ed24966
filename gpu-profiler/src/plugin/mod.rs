//! Plugin profiler bridge
//!
//! Out-of-binary profilers talk to the engine only through the size-versioned
//! structs in [`abi`]. [`PluginProfiler`] adapts a plugin's function table to
//! the [`ChildProfiler`](crate::ChildProfiler) interface so the runloop can
//! drive it like any other session producer.

pub mod abi;
mod builder;
mod loader;
mod profiler;

pub use abi::{
    PluginEventType, PluginFlowType, ProfilerInterface, UNKNOWN_EVENT_KIND_FALLBACK,
    UNKNOWN_FLOW_KIND_FALLBACK,
};
pub use builder::PluginTraceBuilder;
pub use loader::load_plugin;
pub use profiler::{
    PluginProfiler, PluginProfilerSession, MAX_SUPPORTED_ACTIVITY_TYPES, PROFILER_NAME_BUFFER_LEN,
    UNKNOWN_PROFILER_NAME,
};
