//! Services the orchestrator drives but does not implement.

use crate::errors::StageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHandle {
    /// Store-assigned identifier.
    pub id: String,
    /// Name the blob was stored under.
    pub name: String,
}

/// A file held by the generative service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteFileRef {
    /// Service-assigned name, used for lookup and deletion.
    pub name: String,
    /// Name shown to humans.
    #[serde(default)]
    pub display_name: Option<String>,
}

impl RemoteFileRef {
    /// Creates a reference by name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// What a generation call returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GenerationOutput {
    /// Plain text.
    Text(String),
    /// Structured output.
    Json(Value),
}

impl GenerationOutput {
    /// Returns the output as text, serialising JSON compactly.
    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Json(value) => value.to_string(),
        }
    }

    /// Returns true when there is nothing usable in the output.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Json(value) => value.is_null(),
        }
    }
}

/// A named page range of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRange {
    /// Section title.
    pub name: String,
    /// Page range as written, e.g. `"3-7"`.
    pub pages: String,
}

impl SectionRange {
    /// Creates a range.
    #[must_use]
    pub fn new(name: impl Into<String>, pages: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pages: pages.into(),
        }
    }
}

/// One section cut out of a source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSection {
    /// The range it was cut from.
    pub range: SectionRange,
    /// Section bytes.
    pub bytes: Vec<u8>,
}

/// Blob storage holding source documents.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetches a blob's bytes.
    async fn download(&self, id: &str) -> Result<Vec<u8>, StageError>;

    /// Stores bytes under `name`.
    async fn upload(&self, bytes: Vec<u8>, name: &str) -> Result<BlobHandle, StageError>;
}

/// The remote generative service.
///
/// Implementations report throttling as `RateLimited` and transient remote
/// errors as `UpstreamFailure`.
#[async_trait]
pub trait GenerativeService: Send + Sync {
    /// Uploads a file for later generation calls.
    async fn upload_file(&self, bytes: Vec<u8>, name: &str) -> Result<RemoteFileRef, StageError>;

    /// Deletes a previously uploaded file.
    async fn delete_file(&self, file: &RemoteFileRef) -> Result<(), StageError>;

    /// Lists files currently held by the service.
    async fn list_files(&self) -> Result<Vec<RemoteFileRef>, StageError>;

    /// Generates output for `instructions`, optionally grounded in `file`.
    async fn generate(
        &self,
        file: Option<&RemoteFileRef>,
        instructions: &str,
    ) -> Result<GenerationOutput, StageError>;
}

/// Cuts a document into sections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentSplitter: Send + Sync {
    /// Returns one section per range, in range order. Ranges that cannot be
    /// cut are left out.
    async fn split_by_ranges(
        &self,
        bytes: &[u8],
        ranges: &[SectionRange],
    ) -> Result<Vec<SplitSection>, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generation_output_text() {
        assert_eq!(GenerationOutput::Text("hi".into()).into_text(), "hi");
        assert_eq!(
            GenerationOutput::Json(json!({"a": 1})).into_text(),
            r#"{"a":1}"#
        );
        assert!(GenerationOutput::Text("  \n".into()).is_empty());
        assert!(GenerationOutput::Json(Value::Null).is_empty());
    }

    #[test]
    fn test_generation_output_serde_tagging() {
        let encoded = serde_json::to_value(GenerationOutput::Text("x".into())).unwrap();
        assert_eq!(encoded, json!({"kind": "text", "value": "x"}));
    }
}
