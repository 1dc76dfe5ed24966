//! Tandem trace engine
//!
//! Correlates host instrumentation with device activity into one timeline.
//! [`RunloopController`] drives a trace through warmup, collection and
//! processing; [`ProfilerController`] runs it on a background task.

pub mod buffers;
pub mod config;
pub mod controller;
pub mod correlation;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod output;
pub mod overhead;
pub mod process;
pub mod profiler;
pub mod spans;
pub mod user_events;

pub use config::TraceConfig;
pub use controller::{default_sink_factory, ProfilerController, SinkFactory};
pub use error::TraceError;
pub use output::{JsonTraceSink, MemoryTraceSink, TraceDocument};
pub use profiler::{RunloopController, RunloopState};
