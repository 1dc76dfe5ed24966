//! Shared types and utilities for Tandem
//!
//! This crate contains the activity and span data model used by the host-side
//! trace engine, the device backends, and the plugin bridge.

pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{activity::*, buffer::*, resource::*, span::*};
