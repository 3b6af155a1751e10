//! Identifiers and errors shared by every pipeline crate.
//!
//! This crate has no IO and no async; it only defines the vocabulary the
//! broker, store and coordinator layers agree on.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{JobId, TraceId};
