//! PILOT Planning
//!
//! Turns a declarative intent document into a validated, normalized step
//! graph:
//!
//! - [`validate`]: rejects procedural IR before compilation
//! - [`compiler`]: deterministic compilation with an assisted fallback
//! - [`normalize`]: canonicalizes the compiled step list
//! - [`graph`]: dependency integrity and ordering
//!
//! Step references use `{{root.path}}` tokens, see [`reference`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compiler;
pub mod condition;
pub mod graph;
pub mod ir;
pub mod normalize;
pub mod reference;
pub mod step;
pub mod validate;

pub use compiler::{
    CompileError, CompileMetadata, CompileOutput, CompileRequest, CompileResponse, Compiler, CompilerConfig, CompilerKind,
    CompilerMode, CompilerStrategy, GraphSynthesizer, PipelineContext, TokenUsage,
};
pub use condition::{Condition, FieldSource, Operator};
pub use graph::{GraphError, StepGraph};
pub use ir::{DataSource, DeclarativeIr, DeliveryRule};
pub use normalize::{NormalizeOutcome, Normalizer};
pub use reference::Reference;
pub use step::{CompiledStep, GatherOp, StepKind, StepParser, TransformOp};
pub use validate::{IrValidator, ValidationReport};
