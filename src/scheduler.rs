use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A periodic background job with cooperative shutdown.
///
/// The first run happens one full `period` after spawning. Job failures are
/// logged and the schedule keeps going.
pub struct ScheduledTask {
    name: &'static str,
    period: Duration,
    shutdown_token: CancellationToken,
}

impl ScheduledTask {
    /// Creates a new `ScheduledTask`.
    ///
    /// # Arguments
    ///
    /// * `name` - Name used in log lines.
    /// * `period` - Delay between two runs.
    /// * `shutdown_token` - Cancelling this token stops the task.
    pub fn new(name: &'static str, period: Duration, shutdown_token: CancellationToken) -> Self {
        Self {
            name,
            period,
            shutdown_token,
        }
    }

    /// Spawns the loop running `job` on every tick.
    ///
    /// The job reports how many items it processed.
    pub fn start<F, Fut>(self, mut job: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<usize>> + Send + 'static,
    {
        tokio::spawn(async move {
            tracing::info!(
                task = self.name,
                period_secs = self.period.as_secs(),
                "⏱️ Scheduled task started"
            );

            let mut tick = interval(self.period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately once
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match job().await {
                            Ok(processed) => {
                                tracing::debug!(task = self.name, processed, "✅ Scheduled task cycle completed");
                            }
                            Err(e) => {
                                tracing::error!(task = self.name, "❌ Scheduled task cycle failed: {}", e);
                            }
                        }
                    }
                    _ = self.shutdown_token.cancelled() => {
                        tracing::info!(task = self.name, "🛑 Shutdown signal received, stopping scheduled task");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn runs_on_every_period_until_cancelled() {
        let token = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let handle = ScheduledTask::new("test", Duration::from_secs(10), token.clone()).start(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        token.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_does_not_stop_schedule() {
        let token = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let handle = ScheduledTask::new("failing", Duration::from_secs(5), token.clone()).start(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::Internal("boom".to_string()))
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        token.cancel();
        handle.await.unwrap();
    }
}
