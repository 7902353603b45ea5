//! Observability utilities: subscriber set-up and span timing.

mod subscriber;
mod timer;

pub use subscriber::{init_tracing, LogFormat};
pub use timer::SpanTimer;
