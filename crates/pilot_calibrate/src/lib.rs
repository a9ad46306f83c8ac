//! PILOT Calibration
//!
//! Post-failure introspection: finds literals in a step's configuration
//! that should become user inputs, and lists the inputs a step already
//! references.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod detect;
pub mod service;

pub use detect::{referenced_inputs, DetectionReport, HardcodeCategory, HardcodeDetector, HardcodedValue};
pub use service::{CalibrationReport, CalibrationService, DetectRequest};
