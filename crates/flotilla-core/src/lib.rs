//! Flotilla Core
//!
//! Core domain types, traits, and error handling for Flotilla.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the runner, scheduler, and adapter crates.

pub mod agent;
pub mod error;
pub mod events;
pub mod ids;
pub mod ports;
pub mod task;
pub mod workflow;

pub use error::{Error, Result};
pub use ids::*;
