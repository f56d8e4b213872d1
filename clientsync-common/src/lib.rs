//! # clientsync Common Library
//!
//! Shared code for the clientsync crates:
//! - Error taxonomy
//! - Claim change event types
//! - SSE frame model
//! - Configuration loading
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod events;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
pub use events::{Change, ChangeEvent, ChangeType};
pub use sse::Frame;
