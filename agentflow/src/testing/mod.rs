//! Testing utilities for agentflow pipelines.
//!
//! This module provides:
//! - Scripted steps and a scripted generation service
//! - A context harness with collecting sinks
//! - Result assertions

mod fixtures;
mod mocks;

pub use fixtures::{assert_failed_with, assert_succeeded, assert_text, TestHarness};
pub use mocks::{MockGenerationService, ScriptedStep, StepOutcome};
