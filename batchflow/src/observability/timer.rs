use std::time::Duration;
use tokio::time::Instant;

/// Measures how long a named unit of work takes.
///
/// Built on the tokio clock so durations follow a paused test clock.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the timer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the timer, logs the duration at debug, and returns it.
    pub fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        tracing::debug!(span = %self.name, duration_ms = elapsed.as_millis() as u64, "span finished");
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_span_timer_follows_tokio_clock() {
        let timer = SpanTimer::start("split");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(timer.name(), "split");
        assert!(timer.elapsed_ms() >= 250.0);
        assert!(timer.finish() >= Duration::from_millis(250));
    }
}
