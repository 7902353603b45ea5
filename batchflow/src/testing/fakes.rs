use crate::errors::StageError;
use crate::orchestrator::{
    BlobHandle, BlobStore, DocumentSplitter, GenerationOutput, GenerativeService, RemoteFileRef,
    SectionRange, SplitSection,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Blob storage backed by a map.
#[derive(Debug, Default)]
pub struct FakeBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    downloads: AtomicUsize,
}

impl FakeBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` under `id`.
    pub fn insert(&self, id: impl Into<String>, bytes: Vec<u8>) {
        self.blobs.lock().insert(id.into(), bytes);
    }

    /// Number of downloads served or refused.
    #[must_use]
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn download(&self, id: &str) -> Result<Vec<u8>, StageError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StageError::fatal(format!("blob '{id}' not found")))
    }

    async fn upload(&self, bytes: Vec<u8>, name: &str) -> Result<BlobHandle, StageError> {
        let id = Uuid::new_v4().to_string();
        self.blobs.lock().insert(id.clone(), bytes);
        Ok(BlobHandle {
            id,
            name: name.to_string(),
        })
    }
}

/// Splits a document into equal byte chunks, one per range.
///
/// Ranges with a blank page spec are left out.
#[derive(Debug, Default)]
pub struct FakeSplitter;

impl FakeSplitter {
    /// Creates a splitter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DocumentSplitter for FakeSplitter {
    async fn split_by_ranges(
        &self,
        bytes: &[u8],
        ranges: &[SectionRange],
    ) -> Result<Vec<SplitSection>, StageError> {
        if bytes.is_empty() {
            return Err(StageError::fatal("source document is empty"));
        }
        let chunk = (bytes.len() / ranges.len().max(1)).max(1);
        Ok(ranges
            .iter()
            .enumerate()
            .filter(|(_, range)| !range.pages.trim().is_empty())
            .map(|(i, range)| {
                let start = (i * chunk).min(bytes.len());
                let end = ((i + 1) * chunk).min(bytes.len());
                SplitSection {
                    range: range.clone(),
                    bytes: bytes[start..end].to_vec(),
                }
            })
            .collect())
    }
}

/// A generative service that echoes its instructions.
///
/// `generate` returns `"generated[<file>]: <instructions>"` unless a scripted
/// response or failure matches the instructions.
#[derive(Debug, Default)]
pub struct FakeGenerativeService {
    files: Mutex<Vec<RemoteFileRef>>,
    uploaded: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    generate_calls: Mutex<Vec<(Option<String>, String)>>,
    responses: Mutex<Vec<(String, GenerationOutput)>>,
    failures: Mutex<Vec<(String, StageError, usize)>>,
    upload_failures: Mutex<Vec<(String, StageError, usize)>>,
    fail_deletes: AtomicBool,
    generate_delay: Mutex<Option<Duration>>,
    upload_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeGenerativeService {
    /// Creates a service holding no files.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `output` for instructions containing `needle`.
    pub fn respond_with(&self, needle: impl Into<String>, output: GenerationOutput) {
        self.responses.lock().push((needle.into(), output));
    }

    /// Fails the next `times` generations whose instructions contain `needle`.
    pub fn fail_generate_times(&self, needle: impl Into<String>, error: StageError, times: usize) {
        self.failures.lock().push((needle.into(), error, times));
    }

    /// Fails the next `times` uploads whose file name contains `needle`.
    pub fn fail_upload_times(&self, needle: impl Into<String>, error: StageError, times: usize) {
        self.upload_failures.lock().push((needle.into(), error, times));
    }

    /// Makes every delete fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Makes every generation take `delay`.
    pub fn set_generate_delay(&self, delay: Duration) {
        *self.generate_delay.lock() = Some(delay);
    }

    /// Makes every upload take `delay`.
    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock() = Some(delay);
    }

    /// Adds a file as if uploaded earlier.
    pub fn add_remote_file(&self, file: RemoteFileRef) {
        self.files.lock().push(file);
    }

    /// Files currently held.
    #[must_use]
    pub fn remote_files(&self) -> Vec<RemoteFileRef> {
        self.files.lock().clone()
    }

    /// Names passed to `upload_file`, in call order.
    #[must_use]
    pub fn uploaded_names(&self) -> Vec<String> {
        self.uploaded.lock().clone()
    }

    /// Names passed to `delete_file`, in call order.
    #[must_use]
    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// File name and instructions of every generation, in call order.
    #[must_use]
    pub fn generate_calls(&self) -> Vec<(Option<String>, String)> {
        self.generate_calls.lock().clone()
    }

    /// Most generations seen running at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, instructions: &str) -> Option<StageError> {
        take_scripted(&mut self.failures.lock(), instructions)
    }
}

fn take_scripted(failures: &mut [(String, StageError, usize)], haystack: &str) -> Option<StageError> {
    failures
        .iter_mut()
        .find(|(needle, _, remaining)| *remaining > 0 && haystack.contains(needle.as_str()))
        .map(|(_, error, remaining)| {
            *remaining -= 1;
            error.clone()
        })
}

#[async_trait]
impl GenerativeService for FakeGenerativeService {
    async fn upload_file(&self, bytes: Vec<u8>, name: &str) -> Result<RemoteFileRef, StageError> {
        let delay = *self.upload_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = take_scripted(&mut self.upload_failures.lock(), name);
        if let Some(error) = scripted {
            return Err(error);
        }
        self.uploaded.lock().push(name.to_string());
        let file = RemoteFileRef::new(name).with_display_name(format!("{name} ({} bytes)", bytes.len()));
        self.files.lock().push(file.clone());
        Ok(file)
    }

    async fn delete_file(&self, file: &RemoteFileRef) -> Result<(), StageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StageError::upstream(format!("could not delete '{}'", file.name)));
        }
        self.deleted.lock().push(file.name.clone());
        self.files.lock().retain(|f| f.name != file.name);
        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<RemoteFileRef>, StageError> {
        Ok(self.files.lock().clone())
    }

    async fn generate(
        &self,
        file: Option<&RemoteFileRef>,
        instructions: &str,
    ) -> Result<GenerationOutput, StageError> {
        self.generate_calls
            .lock()
            .push((file.map(|f| f.name.clone()), instructions.to_string()));

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.generate_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.scripted_failure(instructions) {
            return Err(error);
        }

        let scripted = self
            .responses
            .lock()
            .iter()
            .find(|(needle, _)| instructions.contains(needle.as_str()))
            .map(|(_, output)| output.clone());
        Ok(scripted.unwrap_or_else(|| {
            GenerationOutput::Text(format!(
                "generated[{}]: {instructions}",
                file.map_or("-", |f| f.name.as_str())
            ))
        }))
    }
}
