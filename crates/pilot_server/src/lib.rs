//! PILOT Server
//!
//! HTTP API over the compiler, the execution engine, resume, status
//! reporting and hardcode detection.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod error;
pub mod handler;

pub use api::{ApiServer, AppState, ServerConfig};
pub use error::{ApiError, ApiResult};
