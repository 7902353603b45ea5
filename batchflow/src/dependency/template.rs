//! Prompt rendering.
//!
//! A prompt is the node's template followed by one block per appended
//! property:
//!
//! ```text
//! <template>
//! ---
//! <Display Name>:
//! <value>
//! ```

use super::DependencyNode;
use crate::errors::StageError;
use tracing::warn;

/// Property name that resolves to the group's main content.
pub const CONTENT_PROPERTY: &str = "content";

/// Renders a node's prompt.
///
/// `dependency_output` is the output of the node's dependency, if it has one
/// and it completed. A missing or blank dependency output yields a
/// `DataNotReady` error. Properties that resolve to nothing are skipped.
pub fn render_prompt(
    node: &DependencyNode,
    dependency_output: Option<&str>,
) -> Result<String, StageError> {
    let mut parts = vec![node.template.trim().to_string()];

    for property in &node.append {
        let resolved = if node.depends_on.as_deref() == Some(property.as_str()) {
            match dependency_output.map(str::trim).filter(|s| !s.is_empty()) {
                Some(output) => Some((format!("Output from '{property}'"), output.to_string())),
                None => {
                    return Err(StageError::data_not_ready(format!(
                        "output of '{property}' is not available for '{}'",
                        node.key()
                    )))
                }
            }
        } else if property == CONTENT_PROPERTY {
            node.input
                .content
                .as_deref()
                .map(|c| ("Content".to_string(), c.trim().to_string()))
        } else if let Some(value) = node.input.fields.get(property) {
            Some((display_name(property), value.trim().to_string()))
        } else {
            warn!(node = %node.key(), property = %property, "property is unresolvable, not appending");
            None
        };

        if let Some((label, value)) = resolved {
            parts.push(format!("---\n{label}:\n{value}"));
        }
    }

    Ok(parts.join("\n"))
}

/// Turns `snake_case` keys into title-cased labels.
#[must_use]
pub fn display_name(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::NodeInput;
    use crate::errors::FailureClass;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("lesson_title"), "Lesson Title");
        assert_eq!(display_name("LEVEL"), "Level");
        assert_eq!(display_name("__x__y"), "X Y");
    }

    #[test]
    fn test_render_with_content_and_fields() {
        let node = DependencyNode::new("slide-1", "summary", "  Summarise the slide.  ")
            .append("content")
            .append("lesson_title")
            .append("unknown")
            .with_input(NodeInput::with_content("Cells divide.\n").field("lesson_title", "Biology"));

        let prompt = render_prompt(&node, None).unwrap();
        assert_eq!(
            prompt,
            "Summarise the slide.\n---\nContent:\nCells divide.\n---\nLesson Title:\nBiology"
        );
    }

    #[test]
    fn test_render_with_dependency_output() {
        let node = DependencyNode::new("slide-1", "quiz", "Write a quiz.").depends_on("summary");
        let prompt = render_prompt(&node, Some(" Mitosis. ")).unwrap();
        assert_eq!(prompt, "Write a quiz.\n---\nOutput from 'summary':\nMitosis.");
    }

    #[test]
    fn test_missing_dependency_output_is_not_ready() {
        let node = DependencyNode::new("slide-1", "quiz", "Write a quiz.").depends_on("summary");
        for output in [None, Some(""), Some("   ")] {
            let err = render_prompt(&node, output).unwrap_err();
            assert_eq!(err.class, FailureClass::DataNotReady);
        }
    }
}
