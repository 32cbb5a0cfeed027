//! Polling Fallback - REST Polling for a Rejected Stream
//!
//! Activated once per provider when its connector parks in
//! `FallbackActive` (or at boot when the stream is disabled). Polls the
//! provider's snapshot endpoint immediately and then at a fixed
//! interval, writing into the same cache the stream used to feed.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::price_cache::PriceCache;
use crate::domain::{FeedError, Provider};
use crate::ports::{FeedTelemetry, SnapshotSource};

/// Fixed poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Failures logged at `warn` before the poller goes quiet.
const LOGGED_FAILURES: u32 = 3;

/// REST poller for one provider.
pub struct PollingFallback {
    source: Arc<dyn SnapshotSource>,
    cache: Arc<PriceCache>,
    interval: Duration,
    /// Set by the first `start()`; later calls are no-ops.
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    consecutive_failures: AtomicU32,
    successful_polls: AtomicU64,
    telemetry: Option<Arc<dyn FeedTelemetry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PollingFallback {
    pub fn new(source: Arc<dyn SnapshotSource>, cache: Arc<PriceCache>) -> Self {
        Self {
            source,
            cache,
            interval: DEFAULT_POLL_INTERVAL,
            started: AtomicBool::new(false),
            task: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            successful_polls: AtomicU64::new(0),
            telemetry: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn FeedTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn provider(&self) -> Provider {
        self.source.provider()
    }

    /// Start polling. Only the first call has any effect, even after `stop()`.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(provider = %self.provider(), "Fallback already started");
            return;
        }

        info!(
            provider = %self.provider(),
            interval_ms = self.interval.as_millis() as u64,
            "Starting REST fallback polling"
        );
        let this = Arc::clone(self);
        *lock(&self.task) = Some(tokio::spawn(async move { this.run().await }));
    }

    /// Abort the poll loop. Idempotent.
    pub async fn stop(&self) {
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!(provider = %self.provider(), "REST fallback polling stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn successful_polls(&self) -> u64 {
        self.successful_polls.load(Ordering::Relaxed)
    }

    #[instrument(skip_all, fields(provider = %self.provider()))]
    async fn run(self: Arc<Self>) {
        // First tick fires immediately.
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let _ = self.poll_once().await;
        }
    }

    /// One poll. Returns how many quotes were applied.
    pub async fn poll_once(&self) -> Result<usize, FeedError> {
        let provider = self.provider();

        match self.source.fetch_snapshot().await {
            Ok(quotes) => {
                let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
                if previous > 0 {
                    info!(provider = %provider, failures = previous, "REST fallback recovered");
                }

                let mut applied = 0;
                for snapshot in quotes {
                    if self
                        .cache
                        .upsert_quote(snapshot.quote, snapshot.change_percent)
                        .await
                    {
                        applied += 1;
                    }
                }

                self.successful_polls.fetch_add(1, Ordering::Relaxed);
                if let Some(telemetry) = &self.telemetry {
                    telemetry.quotes_applied(provider, "rest", applied as u64);
                }
                debug!(provider = %provider, applied, "REST fallback poll applied");
                Ok(applied)
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(telemetry) = &self.telemetry {
                    telemetry.poll_failed(provider, e.kind());
                }
                self.log_failure(provider, failures, &e);
                Err(e)
            }
        }
    }

    fn log_failure(&self, provider: Provider, failures: u32, error: &FeedError) {
        if failures > LOGGED_FAILURES + 1 {
            debug!(provider = %provider, failures, error = %error, "REST fallback poll failed");
            return;
        }
        if failures == LOGGED_FAILURES + 1 {
            warn!(
                provider = %provider,
                failures,
                "REST fallback still failing, suppressing further logs"
            );
            return;
        }

        if error.is_circuit_open() {
            warn!(
                provider = %provider,
                failures,
                circuit = %provider.rest_circuit(),
                "REST circuit open, provider has no live source; an operator may retry the stream"
            );
        } else {
            warn!(provider = %provider, failures, error = %error, "REST fallback poll failed");
        }
    }
}
