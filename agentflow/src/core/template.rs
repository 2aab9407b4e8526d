//! Template binding against results stored in an execution context.
//!
//! Placeholders take the form `{path.field}` where `path` is a result path
//! (`group/step1`) and `field` one of the names returned by
//! [`StepResult::to_fields`](super::StepResult::to_fields). Unresolved
//! placeholders are left untouched.

use crate::context::ExecutionContext;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

#[allow(clippy::expect_used)]
fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z0-9_\-/]+)\.([A-Za-z0-9_\-]+)\}").expect("valid placeholder pattern")
    })
}

#[allow(clippy::expect_used)]
fn field_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_\-]+)\}").expect("valid field pattern"))
}

fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replaces `{path.field}` placeholders with fields of stored results.
#[must_use]
pub fn bind_template(template: &str, ctx: &ExecutionContext) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &Captures<'_>| {
            ctx.result(&caps[1])
                .and_then(|result| result.to_fields().get(&caps[2]).map(render))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Replaces `{field}` placeholders from a flat field map.
#[must_use]
pub fn bind_fields(template: &str, fields: &HashMap<String, serde_json::Value>) -> String {
    field_pattern()
        .replace_all(template, |caps: &Captures<'_>| {
            fields
                .get(&caps[1])
                .map_or_else(|| caps[0].to_string(), render)
        })
        .into_owned()
}
