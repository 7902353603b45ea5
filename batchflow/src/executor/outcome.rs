use crate::core::{FailureRecord, StageKind};
use crate::errors::StageError;
use std::time::Duration;
use thiserror::Error;

/// A stage that produced its value.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome<T> {
    /// The stage's value.
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Wall-clock time across all attempts and retry waits.
    pub duration: Duration,
}

impl<T> StageOutcome<T> {
    /// Maps the value, keeping the bookkeeping.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageOutcome<U> {
        StageOutcome {
            value: f(self.value),
            attempts: self.attempts,
            duration: self.duration,
        }
    }
}

/// A stage that failed terminally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct StageFailure {
    /// The last error, tagged with its stage.
    pub error: StageError,
    /// Attempts made.
    pub attempts: u32,
    /// Wall-clock time across all attempts and retry waits.
    pub duration: Duration,
}

impl StageFailure {
    /// Returns the stage that failed.
    #[must_use]
    pub fn stage(&self) -> Option<StageKind> {
        self.error.stage
    }

    /// Builds the failure record for `subject`.
    #[must_use]
    pub fn to_record(&self, subject: impl Into<String>) -> FailureRecord {
        FailureRecord::new(subject, &self.error).with_attempts(self.attempts)
    }

    /// Returns the underlying error.
    #[must_use]
    pub fn into_error(self) -> StageError {
        self.error
    }
}
