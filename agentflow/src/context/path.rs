//! Hierarchical result paths.

/// Separator between path segments.
pub const PATH_SEPARATOR: &str = "/";

/// A stack of path segments, e.g. `["group", "step1"]` → `"group/step1"`.
///
/// Popping an empty stack is not an error; the path simply stays at the
/// root (`""`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathStack {
    segments: Vec<String>,
}

impl PathStack {
    /// Creates an empty (root) path.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a nested scope.
    pub fn push(&mut self, segment: impl Into<String>) {
        self.segments.push(segment.into());
    }

    /// Leaves the innermost scope, returning its segment.
    pub fn pop(&mut self) -> Option<String> {
        self.segments.pop()
    }

    /// The current path.
    #[must_use]
    pub fn current(&self) -> String {
        self.segments.join(PATH_SEPARATOR)
    }

    /// The path a child segment would have, without entering it.
    #[must_use]
    pub fn child(&self, segment: &str) -> String {
        if self.segments.is_empty() {
            segment.to_string()
        } else {
            format!("{}{PATH_SEPARATOR}{segment}", self.current())
        }
    }

    /// Nesting depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Returns true at the root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}
