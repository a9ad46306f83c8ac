//! PILOT Execution Events
//!
//! Typed lifecycle events for workflow executions and an in-process
//! publish/subscribe emitter. Emission never fails and never blocks the
//! caller on a slow or panicking subscriber.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod emitter;
pub mod event;

pub use emitter::{EventEmitter, Subscription};
pub use event::{EventKind, ExecutionEvent};
