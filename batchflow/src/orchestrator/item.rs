use super::collaborators::{RemoteFileRef, SectionRange, SplitSection};
use crate::batch::BatchItem;
use crate::cancellation::CancellationToken;
use crate::core::FailureRecord;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, OnceLock};

/// How an item's document reaches the generative service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum PipelineShape {
    /// Split the document and upload each section as its own file.
    #[default]
    PerItemUpload,
    /// Evaluate every section against one remote copy of the whole document,
    /// reused across items.
    SharedRemoteFile {
        /// Remote name to look up before uploading. Derived from the source id
        /// when absent.
        #[serde(default)]
        remote_name: Option<String>,
    },
}

/// One document to run through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineItem {
    /// Identity used in results.
    pub id: String,
    /// Blob id of the source document.
    pub source_id: String,
    /// Sections to evaluate.
    pub sections: Vec<SectionRange>,
    /// Instructions applied to every section.
    pub instructions: String,
    /// Upload shape.
    #[serde(default)]
    pub shape: PipelineShape,
}

impl PipelineItem {
    /// Creates a per-item-upload item.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            sections: Vec::new(),
            instructions: instructions.into(),
            shape: PipelineShape::PerItemUpload,
        }
    }

    /// Adds a section.
    #[must_use]
    pub fn section(mut self, name: impl Into<String>, pages: impl Into<String>) -> Self {
        self.sections.push(SectionRange::new(name, pages));
        self
    }

    /// Sets the upload shape.
    #[must_use]
    pub fn with_shape(mut self, shape: PipelineShape) -> Self {
        self.shape = shape;
        self
    }

    /// Remote name of the shared file for this item's source.
    #[must_use]
    pub fn shared_remote_name(&self) -> Option<String> {
        match &self.shape {
            PipelineShape::PerItemUpload => None,
            PipelineShape::SharedRemoteFile {
                remote_name: Some(name),
            } => Some(name.clone()),
            PipelineShape::SharedRemoteFile { remote_name: None } => {
                Some(format!("shared-{}", short_digest(self.source_id.as_bytes())))
            }
        }
    }
}

impl BatchItem for PipelineItem {
    fn item_id(&self) -> String {
        self.id.clone()
    }
}

/// Outcome of one section: generated text, or the failure that stopped it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionOutput {
    /// Section title.
    pub name: String,
    /// Page range.
    pub pages: String,
    /// Generated text, when the section succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Why the section failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureRecord>,
}

impl SectionOutput {
    /// A section that produced `output`.
    #[must_use]
    pub fn done(range: SectionRange, output: String) -> Self {
        Self {
            name: range.name,
            pages: range.pages,
            output: Some(output),
            error: None,
        }
    }

    /// A section that failed.
    #[must_use]
    pub fn failed(range: SectionRange, error: FailureRecord) -> Self {
        Self {
            name: range.name,
            pages: range.pages,
            output: None,
            error: Some(error),
        }
    }

    /// Returns true if the section produced output.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.output.is_some()
    }
}

/// Per-item transient state, owned by the item's run.
///
/// Buffers are dropped by [`PipelineContext::release`] before the item
/// reports its result.
#[derive(Debug)]
pub struct PipelineContext {
    /// Item identity.
    pub item_id: String,
    /// Cancellation scope of the run.
    pub cancellation: Arc<CancellationToken>,
    /// Downloaded source bytes.
    pub source: Option<Vec<u8>>,
    /// Sections cut from the source.
    pub sections: Vec<SplitSection>,
    /// Files uploaded for this item, paired with their section.
    pub uploaded: Vec<(SectionRange, RemoteFileRef)>,
    /// The shared remote file, when the item uses one.
    pub shared_file: Option<RemoteFileRef>,
}

impl PipelineContext {
    /// Creates a context with a fresh cancellation token.
    #[must_use]
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            cancellation: CancellationToken::new(),
            source: None,
            sections: Vec::new(),
            uploaded: Vec::new(),
            shared_file: None,
        }
    }

    /// Buffered bytes currently held.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.source.as_ref().map_or(0, Vec::len)
            + self.sections.iter().map(|s| s.bytes.len()).sum::<usize>()
    }

    /// Drops every buffer and handle.
    pub fn release(&mut self) {
        self.source = None;
        self.sections.clear();
        self.uploaded.clear();
        self.shared_file = None;
    }
}

/// Builds the instructions sent for one section.
#[must_use]
pub fn section_instructions(section: &SectionRange, instructions: &str) -> String {
    let mut text = format!(
        "Focus on the section '{}' when extracting information.\nThis extraction applies to pages: {}\n",
        section.name, section.pages
    );
    if let Some(number) = section_number(&section.name) {
        text.push_str(&format!("Section number: {number}.\n"));
    }
    text.push('\n');
    text.push_str(instructions.trim());
    text.push_str(&format!(
        "\n\nEnsure the output is ONLY the requested information for this specific section (pages {}).",
        section.pages
    ));
    text
}

/// First run of digits in a section name.
#[must_use]
pub fn section_number(name: &str) -> Option<&str> {
    digits_pattern()
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[allow(clippy::expect_used)]
fn digits_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)").expect("valid regex"))
}

/// Remote file name for an uploaded section.
#[must_use]
pub fn section_file_name(item_id: &str, index: usize, bytes: &[u8]) -> String {
    format!("{item_id}-{index}-{}", short_digest(bytes))
}

fn short_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_section_number() {
        assert_eq!(section_number("Chapter 12: Results"), Some("12"));
        assert_eq!(section_number("Appendix"), None);
    }

    #[test]
    fn test_section_instructions() {
        let text = section_instructions(&SectionRange::new("Part 3", "10-14"), "  List the figures. ");
        assert_eq!(
            text,
            "Focus on the section 'Part 3' when extracting information.\n\
             This extraction applies to pages: 10-14\n\
             Section number: 3.\n\
             \n\
             List the figures.\n\
             \n\
             Ensure the output is ONLY the requested information for this specific section (pages 10-14)."
        );
    }

    #[test]
    fn test_section_instructions_without_number() {
        let text = section_instructions(&SectionRange::new("Summary", "1"), "Summarise.");
        assert!(!text.contains("Section number"));
    }

    #[test]
    fn test_file_names_are_content_addressed() {
        let a = section_file_name("doc", 0, b"alpha");
        assert_eq!(a, section_file_name("doc", 0, b"alpha"));
        assert_ne!(a, section_file_name("doc", 0, b"beta"));
        assert!(a.starts_with("doc-0-"));
        assert_eq!(a.len(), "doc-0-".len() + 16);
    }

    #[test]
    fn test_shared_remote_name() {
        let item = PipelineItem::new("a", "blob-1", "x");
        assert_eq!(item.shared_remote_name(), None);

        let named = item.clone().with_shape(PipelineShape::SharedRemoteFile {
            remote_name: Some("files/abc".into()),
        });
        assert_eq!(named.shared_remote_name().as_deref(), Some("files/abc"));

        let derived = item.with_shape(PipelineShape::SharedRemoteFile { remote_name: None });
        assert!(derived.shared_remote_name().unwrap().starts_with("shared-"));
    }

    #[test]
    fn test_context_release() {
        let mut ctx = PipelineContext::new("a");
        ctx.source = Some(vec![0; 10]);
        ctx.sections.push(SplitSection {
            range: SectionRange::new("s", "1"),
            bytes: vec![0; 5],
        });
        assert_eq!(ctx.buffered_bytes(), 15);
        ctx.release();
        assert_eq!(ctx.buffered_bytes(), 0);
    }
}
