use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-group data that prompt properties can draw from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInput {
    /// The group's main content, appended for the `content` property.
    #[serde(default)]
    pub content: Option<String>,
    /// Additional named fields.
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl NodeInput {
    /// Creates an input with content.
    #[must_use]
    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            fields: HashMap::new(),
        }
    }

    /// Adds a named field.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// One prompt to evaluate within a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    /// The group (item) the node belongs to.
    pub group: String,
    /// Name, unique within the group.
    pub name: String,
    /// Prompt template placed before any appended properties.
    pub template: String,
    /// Name of the node whose output this one needs, within the same group.
    #[serde(default)]
    pub depends_on: Option<String>,
    /// Evaluate against the group's remote file.
    #[serde(default)]
    pub multimodal: bool,
    /// Properties appended to the prompt, in order.
    #[serde(default)]
    pub append: Vec<String>,
    /// Group data the properties are resolved from.
    #[serde(default)]
    pub input: NodeInput,
}

impl DependencyNode {
    /// Creates a node with no dependency.
    #[must_use]
    pub fn new(group: impl Into<String>, name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            template: template.into(),
            depends_on: None,
            multimodal: false,
            append: Vec::new(),
            input: NodeInput::default(),
        }
    }

    /// Declares the node this one depends on and appends its output.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.append.contains(&name) {
            self.append.push(name.clone());
        }
        self.depends_on = Some(name);
        self
    }

    /// Appends a property to the prompt.
    #[must_use]
    pub fn append(mut self, property: impl Into<String>) -> Self {
        self.append.push(property.into());
        self
    }

    /// Marks the node as multimodal.
    #[must_use]
    pub fn multimodal(mut self) -> Self {
        self.multimodal = true;
        self
    }

    /// Sets the group data.
    #[must_use]
    pub fn with_input(mut self, input: NodeInput) -> Self {
        self.input = input;
        self
    }

    /// Returns `group/name`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }
}
