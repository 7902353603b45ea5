use super::collaborators::{GenerativeService, RemoteFileRef};
use crate::dependency::{DependencyNode, NodeEvaluator};
use crate::errors::StageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Evaluates dependency nodes with the generative service.
///
/// Multimodal nodes are grounded in their group's remote file when one is
/// attached; every other node is text-only.
pub struct GenerativeEvaluator {
    service: Arc<dyn GenerativeService>,
    files: HashMap<String, RemoteFileRef>,
}

impl GenerativeEvaluator {
    /// Creates an evaluator with no group files.
    #[must_use]
    pub fn new(service: Arc<dyn GenerativeService>) -> Self {
        Self {
            service,
            files: HashMap::new(),
        }
    }

    /// Attaches remote files by group.
    #[must_use]
    pub fn with_files(mut self, files: HashMap<String, RemoteFileRef>) -> Self {
        self.files = files;
        self
    }

    /// Returns the file a node is evaluated against, if any.
    #[must_use]
    pub fn file_for(&self, node: &DependencyNode) -> Option<&RemoteFileRef> {
        if node.multimodal {
            self.files.get(&node.group)
        } else {
            None
        }
    }
}

#[async_trait]
impl NodeEvaluator for GenerativeEvaluator {
    async fn evaluate(&self, node: &DependencyNode, prompt: &str) -> Result<String, StageError> {
        let file = self.file_for(node);
        if node.multimodal && file.is_none() {
            debug!(node = %node.key(), "no remote file attached to group, evaluating as text");
        }

        let output = self.service.generate(file, prompt).await?;
        if output.is_empty() {
            return Err(StageError::fatal(format!(
                "empty response for '{}'",
                node.key()
            )));
        }
        Ok(output.into_text())
    }
}

impl std::fmt::Debug for GenerativeEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerativeEvaluator")
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureClass;
    use crate::orchestrator::GenerationOutput;
    use crate::testing::FakeGenerativeService;

    #[tokio::test]
    async fn test_multimodal_node_uses_group_file() {
        let service = Arc::new(FakeGenerativeService::new());
        let files: HashMap<_, _> = [("doc-1".to_string(), RemoteFileRef::new("files/doc-1"))].into();
        let evaluator = GenerativeEvaluator::new(service.clone()).with_files(files);

        let node = DependencyNode::new("doc-1", "summary", "Summarise.").multimodal();
        evaluator.evaluate(&node, "Summarise.").await.unwrap();
        let text_node = DependencyNode::new("doc-1", "title", "Title?");
        evaluator.evaluate(&text_node, "Title?").await.unwrap();

        let calls = service.generate_calls();
        assert_eq!(calls[0].0.as_deref(), Some("files/doc-1"));
        assert_eq!(calls[1].0, None);
    }

    #[tokio::test]
    async fn test_empty_response_is_fatal() {
        let service = Arc::new(FakeGenerativeService::new());
        service.respond_with("Q", GenerationOutput::Text("   ".into()));
        let evaluator = GenerativeEvaluator::new(service);

        let err = evaluator
            .evaluate(&DependencyNode::new("g", "q", "Q"), "Q")
            .await
            .unwrap_err();
        assert_eq!(err.class, FailureClass::Fatal);
    }
}
