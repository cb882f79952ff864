use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identity of a source artifact version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    pub revision: String,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: revision.into(),
        }
    }
}

/// One node of an artifact's layout tree
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutNode {
    pub kind: String,
    /// Names of the state keys this node binds
    #[serde(default)]
    pub state_keys: Vec<String>,
    /// Literal content; not part of the structure
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub properties: Value,
    #[serde(default)]
    pub children: Vec<LayoutNode>,
}

impl LayoutNode {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_state_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    pub fn with_child(mut self, child: LayoutNode) -> Self {
        self.children.push(child);
        self
    }

    /// Every state key bound anywhere in this subtree
    pub fn all_state_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.state_keys.iter().map(String::as_str).collect();
        for child in &self.children {
            keys.extend(child.all_state_keys());
        }
        keys
    }
}

/// What an update was built from: its descriptor plus its layout tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceArtifact {
    #[serde(flatten)]
    pub descriptor: SourceDescriptor,
    pub root: LayoutNode,
}

impl SourceArtifact {
    pub fn new(descriptor: SourceDescriptor, root: LayoutNode) -> Self {
        Self { descriptor, root }
    }
}
