//! Per-item cancellation and guaranteed cleanup.
//!
//! - [`CancellationToken`] is tied one-to-one with an item's run and lets the
//!   executor abandon an item between or during attempts.
//! - [`CleanupScope`] collects async release actions (remote file deletes)
//!   and runs them in LIFO order, even if the owning future is dropped.

mod scope;
mod token;

pub use scope::{CleanupReport, CleanupScope};
pub use token::CancellationToken;
