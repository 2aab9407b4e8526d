//! Pipeline builder with validation.

use super::{Pipeline, StepNode};
use crate::errors::PipelineValidationError;
use crate::steps::{SemanticValidator, Step};
use std::collections::HashSet;
use std::sync::Arc;

/// Builder for creating validated pipelines.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    nodes: Vec<StepNode>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(self, step: impl Step + 'static) -> Self {
        self.step_arc(Arc::new(step))
    }

    /// Appends a shared step.
    #[must_use]
    pub fn step_arc(self, step: Arc<dyn Step>) -> Self {
        self.node(StepNode::new(step))
    }

    /// Appends a step checked by a semantic validator.
    #[must_use]
    pub fn step_with_validator(
        self,
        step: impl Step + 'static,
        validator: impl SemanticValidator + 'static,
    ) -> Self {
        self.node(StepNode::new(Arc::new(step)).with_validator(Arc::new(validator)))
    }

    /// Appends a prepared node.
    #[must_use]
    pub fn node(mut self, node: StepNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of scheduled steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.nodes.len()
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if no steps were added, or two top-level steps share
    /// a name (their results would collide at the same path).
    pub fn build(self) -> Result<Pipeline, PipelineValidationError> {
        if self.nodes.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        let duplicates: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !seen.insert(n.name().to_string()))
            .map(|n| n.name().to_string())
            .collect();
        if !duplicates.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' has duplicate step names: {}",
                self.name,
                duplicates.join(", ")
            ))
            .with_steps(duplicates));
        }

        Ok(Pipeline::new(self.name, self.nodes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::{FnValidator, NoOpStep, Validation};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_preserves_order() {
        let pipeline = PipelineBuilder::new("chat")
            .step(NoOpStep::new("a"))
            .step_with_validator(NoOpStep::new("b"), FnValidator::new("ok", |_| Validation::Valid))
            .step_arc(Arc::new(NoOpStep::new("c")))
            .build()
            .unwrap();

        assert_eq!(pipeline.name(), "chat");
        assert_eq!(pipeline.step_names(), vec!["a", "b", "c"]);
        assert!(pipeline.nodes()[1].validator.is_some());
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = PipelineBuilder::new("empty").build().unwrap_err();
        assert!(err.message.contains("no steps"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = PipelineBuilder::new("dup")
            .step(NoOpStep::new("a"))
            .step(NoOpStep::new("b"))
            .step(NoOpStep::new("a"))
            .build()
            .unwrap_err();

        assert_eq!(err.steps, vec!["a".to_string()]);
    }
}
