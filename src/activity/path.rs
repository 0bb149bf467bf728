//! Deterministic node identity within a job's activity graph.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a node inside an activity graph.
///
/// The path is the sequence of child indices walked from the root. It is the
/// persistence key for per-node status: identity is derived purely from the
/// graph shape, so a rehydrated job resumes at the exact same node. Fragments
/// spliced by dynamic expansion live at `parent.child(0)`.
///
/// Encoded form: `"$"` for the root, `"$.0.2"` for the third child of the
/// first child of the root.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct NodePath(Vec<u32>);

impl NodePath {
    /// The root of the graph.
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Identity of the `index`-th child of this node.
    #[must_use]
    pub fn child(&self, index: u32) -> Self {
        let mut segments = self.0.clone();
        segments.push(index);
        Self(segments)
    }

    /// Identity of the enclosing node, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `other` lies inside the subtree rooted at this path.
    #[must_use]
    pub fn contains(&self, other: &NodePath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    /// Encode into the persisted string form.
    #[must_use]
    pub fn encode(&self) -> String {
        if self.0.is_empty() {
            return "$".to_string();
        }
        let mut out = String::from("$");
        for seg in &self.0 {
            out.push('.');
            out.push_str(&seg.to_string());
        }
        out
    }

    /// Decode the persisted string form. Unparseable segments yield `None`.
    pub fn decode(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        if parts.next() != Some("$") {
            return None;
        }
        let mut segments = Vec::new();
        for part in parts {
            segments.push(part.parse().ok()?);
        }
        Some(Self(segments))
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}
