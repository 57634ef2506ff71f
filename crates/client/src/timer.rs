//! Timer seam for reconnect backoff and session renewal

use std::time::Duration;

use async_trait::async_trait;

/// Source of delays. Production code sleeps on the tokio clock; tests swap in
/// timers that record the requested delays instead of waiting them out.
#[async_trait]
pub trait Timer: Send + Sync + 'static {
    async fn sleep(&self, duration: Duration);
}

/// Timer backed by `tokio::time`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_waits_on_tokio_clock() {
        let start = tokio::time::Instant::now();
        TokioTimer.sleep(Duration::from_secs(240)).await;
        assert!(start.elapsed() >= Duration::from_secs(240));
    }
}
