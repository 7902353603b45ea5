//! In-memory collaborators for tests and local runs.
//!
//! Every fake records what it was asked to do and can be scripted to fail,
//! so timing and failure properties can be checked under a paused clock.

mod evaluator;
mod fakes;

pub use evaluator::ScriptedEvaluator;
pub use fakes::{FakeBlobStore, FakeGenerativeService, FakeSplitter};
