//! Data model for trace activities

pub mod activity;
pub mod buffer;
pub mod resource;
pub mod span;
