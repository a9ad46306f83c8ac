//! PILOT Core Types
//!
//! Identifiers, the shared error taxonomy and content fingerprints.
//! This crate performs no I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod id;

// Re-exports
pub use error::{PilotError, PilotResult};
pub use hash::Fingerprint;
pub use id::{ExecutionId, StepId, WorkflowId};
