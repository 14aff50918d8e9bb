//! Guardian Common - shared types and schemas for the guardian control plane.
//!
//! Pure data: records, bus messages, error taxonomy, and the retry policy
//! applied to every outbound call. No I/O lives in this crate.

pub mod error;
pub mod message;
pub mod records;
pub mod retry;

pub use error::GuardianError;
pub use message::{Message, Priority, Protocol};
pub use records::*;
pub use retry::RetryPolicy;
