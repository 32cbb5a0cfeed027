//! Per-provider price cache.
//!
//! One cache per provider, written only by that provider's connector
//! and REST poller, read by the aggregator. Entries are swapped whole
//! (`Arc<CacheEntry>`), so readers never see half of an update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::{CanonicalSymbol, Provider, Quote};

/// Cached state for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub quote: Quote,
    /// Reference price of the first quote seen this session.
    pub session_open: f64,
    /// Daily change reported by the provider, when it publishes one.
    pub reported_change: Option<f64>,
}

impl CacheEntry {
    /// Provider-reported change, else change since the session open.
    pub fn change_percent(&self) -> f64 {
        if let Some(reported) = self.reported_change {
            return reported;
        }
        if self.session_open > 0.0 {
            (self.quote.reference_price() - self.session_open) / self.session_open * 100.0
        } else {
            0.0
        }
    }
}

/// Consecutive agreeing ticks that turn a rejected jump into the new level.
pub const JUMP_CONFIRMATIONS: u32 = 3;

/// A level the jump filter has rejected but keeps seeing.
#[derive(Debug, Clone, Copy)]
struct JumpCandidate {
    level: f64,
    seen: u32,
}

/// Symbol → latest quote for a single provider. Last write wins.
pub struct PriceCache {
    provider: Provider,
    entries: RwLock<HashMap<CanonicalSymbol, Arc<CacheEntry>>>,
    /// Max fractional move between consecutive ticks; `None` disables.
    max_jump: Option<f64>,
    /// Only touched while `entries` is write-locked.
    candidates: Mutex<HashMap<CanonicalSymbol, JumpCandidate>>,
    rejected_jumps: AtomicU64,
}

fn relative_move(from: f64, to: f64) -> f64 {
    ((to - from) / from).abs()
}

impl PriceCache {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            entries: RwLock::new(HashMap::new()),
            max_jump: None,
            candidates: Mutex::new(HashMap::new()),
            rejected_jumps: AtomicU64::new(0),
        }
    }

    /// Reject ticks whose reference price moves more than `fraction`
    /// (e.g. `0.2` = 20%) away from the previous one. A new level is
    /// accepted once [`JUMP_CONFIRMATIONS`] consecutive ticks agree on it.
    pub fn with_jump_filter(mut self, fraction: f64) -> Self {
        self.max_jump = Some(fraction);
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Store a tick. Returns `false` when the tick was rejected.
    pub async fn upsert(&self, symbol: CanonicalSymbol, bid: f64, ask: f64, timestamp_ms: u64) -> bool {
        self.upsert_quote(Quote::new(symbol, bid, ask, timestamp_ms), None)
            .await
    }

    /// Store a full quote with an optional provider-reported change.
    pub async fn upsert_quote(&self, quote: Quote, reported_change: Option<f64>) -> bool {
        if !quote.is_valid() {
            return false;
        }

        let mut entries = self.entries.write().await;
        let previous = entries.get(&quote.symbol);

        if let (Some(limit), Some(prev)) = (self.max_jump, previous) {
            let price = quote.reference_price();
            let jump = relative_move(prev.quote.reference_price(), price);
            let mut candidates = self.candidates.lock().unwrap_or_else(|p| p.into_inner());
            if jump > limit {
                let seen = match candidates.get(&quote.symbol) {
                    Some(c) if relative_move(c.level, price) <= limit => c.seen + 1,
                    _ => 1,
                };
                if seen < JUMP_CONFIRMATIONS {
                    candidates.insert(quote.symbol.clone(), JumpCandidate { level: price, seen });
                    self.rejected_jumps.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        provider = %self.provider,
                        symbol = %quote.symbol,
                        jump_pct = jump * 100.0,
                        seen,
                        "Rejected price jump"
                    );
                    return false;
                }
                info!(
                    provider = %self.provider,
                    symbol = %quote.symbol,
                    jump_pct = jump * 100.0,
                    "Price level shift confirmed"
                );
            }
            candidates.remove(&quote.symbol);
        }

        let session_open = previous
            .map(|p| p.session_open)
            .unwrap_or_else(|| quote.reference_price());

        entries.insert(
            quote.symbol.clone(),
            Arc::new(CacheEntry {
                quote,
                session_open,
                reported_change,
            }),
        );
        true
    }

    pub async fn get(&self, symbol: &CanonicalSymbol) -> Option<Quote> {
        self.entry(symbol).await.map(|e| e.quote.clone())
    }

    pub async fn entry(&self, symbol: &CanonicalSymbol) -> Option<Arc<CacheEntry>> {
        self.entries.read().await.get(symbol).cloned()
    }

    /// All entries, in no particular order.
    pub async fn snapshot(&self) -> Vec<Arc<CacheEntry>> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Administrative wipe. The aggregator's cache-clear does not call this.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
        self.candidates.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Ticks dropped by the jump filter.
    pub fn rejected_jumps(&self) -> u64 {
        self.rejected_jumps.load(Ordering::Relaxed)
    }
}
