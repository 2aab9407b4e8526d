//! Core domain model types for agentflow.
//!
//! This module contains the value and result types threaded through a run:
//! - Tagged step values and typed payload conversions
//! - Step results with optional error and follow-up steps
//! - Parallel branch aggregation
//! - Template binding over stored results

mod parallel;
mod result;
mod template;
mod value;

pub use parallel::ParallelResult;
pub use result::StepResult;
pub use template::{bind_fields, bind_template};
pub use value::{ActionPayload, Json, StepPayload, StepValue, ValueKind};
