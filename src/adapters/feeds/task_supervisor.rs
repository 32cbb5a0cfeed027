//! Feed Task Supervisor - Lifecycle Management for Provider Feeds
//!
//! Owns every provider's connector, REST fallback and cache. Listens
//! for fallback requests from connectors and starts the matching poller
//! exactly once. Provides health status aggregation for `/ready` and
//! `/prices/status`, and stops everything on shutdown.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use super::connector::{ConnectorStats, FeedConnector};
use crate::domain::{ConnectionState, Provider};
use crate::usecases::{PollingFallback, PriceCache};

/// Everything running on behalf of one provider.
pub struct ProviderRuntime {
    /// Streaming connector; also the owner of the fallback notification.
    pub connector: Arc<FeedConnector>,
    /// REST poller, when the provider has a snapshot endpoint.
    pub fallback: Option<Arc<PollingFallback>>,
    /// When `false` the stream is skipped and polling starts at boot.
    pub stream_enabled: bool,
}

impl ProviderRuntime {
    pub fn provider(&self) -> Provider {
        self.connector.provider()
    }

    pub fn cache(&self) -> &Arc<PriceCache> {
        self.connector.cache()
    }
}

/// Point-in-time view of one provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub provider: Provider,
    pub state: ConnectionState,
    pub cached_symbols: usize,
    pub fallback_started: bool,
    pub fallback_failures: u32,
    pub stream: ConnectorStats,
}

/// Supervises all provider feed tasks.
pub struct FeedSupervisor {
    runtimes: Vec<ProviderRuntime>,
    /// Handed to connectors; they report permanent rejection here.
    fallback_tx: mpsc::UnboundedSender<Provider>,
    fallback_rx: Mutex<Option<mpsc::UnboundedReceiver<Provider>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for FeedSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedSupervisor {
    pub fn new() -> Self {
        let (fallback_tx, fallback_rx) = mpsc::unbounded_channel();
        Self {
            runtimes: Vec::new(),
            fallback_tx,
            fallback_rx: Mutex::new(Some(fallback_rx)),
            listener: Mutex::new(None),
        }
    }

    /// Sender to wire into each connector via `with_fallback_notifier`.
    pub fn fallback_notifier(&self) -> mpsc::UnboundedSender<Provider> {
        self.fallback_tx.clone()
    }

    pub fn with_provider(mut self, runtime: ProviderRuntime) -> Self {
        self.runtimes.push(runtime);
        self
    }

    pub fn runtimes(&self) -> &[ProviderRuntime] {
        &self.runtimes
    }

    pub fn runtime(&self, provider: Provider) -> Option<&ProviderRuntime> {
        self.runtimes.iter().find(|r| r.provider() == provider)
    }

    /// Spawn the fallback listener and start every provider.
    #[instrument(skip(self))]
    pub fn start(&self) {
        if let Some(mut rx) = lock(&self.fallback_rx).take() {
            let fallbacks: Vec<(Provider, Option<Arc<PollingFallback>>)> = self
                .runtimes
                .iter()
                .map(|r| (r.provider(), r.fallback.clone()))
                .collect();

            *lock(&self.listener) = Some(tokio::spawn(async move {
                while let Some(provider) = rx.recv().await {
                    match fallbacks.iter().find(|(p, _)| *p == provider) {
                        Some((_, Some(fallback))) => fallback.start(),
                        _ => warn!(provider = %provider, "No REST fallback configured, provider is dark"),
                    }
                }
            }));
        }

        for runtime in &self.runtimes {
            if runtime.stream_enabled {
                runtime.connector.start();
            } else {
                runtime
                    .connector
                    .force_fallback("stream disabled by configuration");
            }
        }

        info!(providers = self.runtimes.len(), "Feed tasks started");
    }

    /// Stop connectors, pollers and the listener. Idempotent.
    pub async fn stop(&self) {
        for runtime in &self.runtimes {
            runtime.connector.stop().await;
            if let Some(fallback) = &runtime.fallback {
                fallback.stop().await;
            }
        }

        let listener = lock(&self.listener).take();
        if let Some(handle) = listener {
            handle.abort();
            let _ = handle.await;
        }
        info!("Feed tasks stopped");
    }

    pub async fn status(&self) -> Vec<ProviderStatus> {
        let mut out = Vec::with_capacity(self.runtimes.len());
        for runtime in &self.runtimes {
            out.push(ProviderStatus {
                provider: runtime.provider(),
                state: runtime.connector.state(),
                cached_symbols: runtime.cache().len().await,
                fallback_started: runtime.fallback.as_ref().is_some_and(|f| f.is_started()),
                fallback_failures: runtime
                    .fallback
                    .as_ref()
                    .map(|f| f.consecutive_failures())
                    .unwrap_or(0),
                stream: runtime.connector.stats(),
            });
        }
        out
    }

    /// Ready once any provider has prices or has moved to REST polling.
    pub async fn is_ready(&self) -> bool {
        for runtime in &self.runtimes {
            if runtime.connector.state() == ConnectionState::FallbackActive || !runtime.cache().is_empty().await {
                return true;
            }
        }
        false
    }

    /// Live tasks across every provider plus the listener.
    pub fn outstanding_tasks(&self) -> usize {
        let listener = lock(&self.listener).as_ref().is_some_and(|h| !h.is_finished()) as usize;
        self.runtimes
            .iter()
            .map(|r| {
                r.connector.outstanding_tasks()
                    + r.fallback.as_ref().is_some_and(|f| f.is_running()) as usize
            })
            .sum::<usize>()
            + listener
    }
}
