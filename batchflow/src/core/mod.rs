//! Core domain model types for batchflow.
//!
//! This module contains the types shared by every scheduler:
//! - Stage kind and node status enums
//! - Per-item and per-node result types
//! - Failure records used in summaries

mod result;
mod status;

pub use result::{FailureRecord, ItemResult, NodeResult};
pub use status::{NodeStatus, StageKind};
