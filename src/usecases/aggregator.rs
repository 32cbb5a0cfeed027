//! Aggregator - One Canonical Quote Table Over Every Provider
//!
//! Lookup order for a single symbol:
//! 1. Live provider caches (crypto only while its stream is subscribed;
//!    forex by provider priority, then a cross derived from USD legs).
//! 2. The aggregator's own TTL cache of REST results.
//! 3. A single-flight REST refresh for the symbol's category. When it
//!    fails, the last good value is served, however old. Symbols no
//!    provider lists never trigger a refresh, and a category batch that
//!    succeeded within the TTL is not fetched again.
//!
//! Public methods never return errors: a symbol is either priced or
//! absent.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::price_cache::{CacheEntry, PriceCache};
use crate::domain::cross_rate::{self, Leg};
use crate::domain::{
    AggregatedQuoteRecord, AllPrices, CanonicalSymbol, Category, ConnectionState, FeedError, Provider, Quote,
    SymbolMap,
};
use crate::ports::{FeedTelemetry, SnapshotQuote, SnapshotSource};

const CRYPTO_BATCH: &str = "crypto-batch";
const FOREX_BATCH: &str = "forex-batch";

/// `source` value for synthesized cross rates.
pub const DERIVED_SOURCE: &str = "derived";

type BatchResult = Result<Arc<Vec<SnapshotQuote>>, FeedError>;
type SharedBatch = Shared<BoxFuture<'static, BatchResult>>;
type TtlMap = HashMap<CanonicalSymbol, TtlEntry>;
type RecentBatch = (Instant, Arc<Vec<SnapshotQuote>>);

/// Aggregator tuning and the instruments it reports.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Freshness window of REST results.
    pub ttl: Duration,
    /// Absolute spread added to derived or ask-less forex quotes.
    pub cross_spread: f64,
    /// Relative spread (basis points) for ask-less crypto quotes.
    pub crypto_spread_bps: f64,
    /// Forex pairs reported by `get_all_prices`, crosses included.
    pub forex_pairs: Vec<CanonicalSymbol>,
    /// Crypto pairs reported by `get_all_prices`.
    pub crypto_pairs: Vec<CanonicalSymbol>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3),
            cross_spread: 0.0002,
            crypto_spread_bps: 5.0,
            forex_pairs: SymbolMap::for_provider(Provider::Polygon)
                .canonical_symbols()
                .to_vec(),
            crypto_pairs: SymbolMap::for_provider(Provider::Binance)
                .canonical_symbols()
                .to_vec(),
        }
    }
}

/// A provider cache plus the state of the connector feeding it.
#[derive(Clone)]
pub struct ProviderFeed {
    pub provider: Provider,
    pub cache: Arc<PriceCache>,
    pub state: watch::Receiver<ConnectionState>,
}

impl ProviderFeed {
    pub fn new(cache: Arc<PriceCache>, state: watch::Receiver<ConnectionState>) -> Self {
        Self {
            provider: cache.provider(),
            cache,
            state,
        }
    }

    fn is_subscribed(&self) -> bool {
        *self.state.borrow() == ConnectionState::Subscribed
    }
}

#[derive(Debug, Clone)]
struct TtlEntry {
    snapshot: SnapshotQuote,
    provider: Provider,
    stored_at: Instant,
}

/// A quote on its way to becoming a consumer record.
struct Priced {
    quote: Quote,
    change_percent: f64,
    source: String,
}

/// Merges provider caches into consumer-facing quotes.
pub struct Aggregator {
    config: AggregatorConfig,
    crypto_feed: Option<ProviderFeed>,
    /// Priority order.
    forex_feeds: Vec<ProviderFeed>,
    crypto_rest: Vec<Arc<dyn SnapshotSource>>,
    forex_rest: Vec<Arc<dyn SnapshotSource>>,
    ttl_cache: Arc<RwLock<TtlMap>>,
    /// Pairs, plus every symbol a provider table lists.
    known: HashSet<CanonicalSymbol>,
    /// Single-flight guard: one in-flight batch per category key.
    in_flight: Mutex<HashMap<&'static str, SharedBatch>>,
    /// Last successful batch per category key.
    recent: Mutex<HashMap<&'static str, RecentBatch>>,
    batches_started: Arc<AtomicU64>,
    telemetry: Option<Arc<dyn FeedTelemetry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn leg_of(quote: &Quote, change_percent: f64) -> Leg {
    Leg {
        price: quote.reference_price(),
        change_percent,
        timestamp_ms: quote.timestamp_ms,
    }
}

fn batch_key(category: Category) -> &'static str {
    match category {
        Category::Crypto => CRYPTO_BATCH,
        Category::Forex => FOREX_BATCH,
    }
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let known = config
            .forex_pairs
            .iter()
            .chain(&config.crypto_pairs)
            .cloned()
            .collect();
        Self {
            config,
            known,
            crypto_feed: None,
            forex_feeds: Vec::new(),
            crypto_rest: Vec::new(),
            forex_rest: Vec::new(),
            ttl_cache: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
            batches_started: Arc::new(AtomicU64::new(0)),
            telemetry: None,
        }
    }

    pub fn with_crypto_feed(mut self, feed: ProviderFeed) -> Self {
        self.crypto_feed = Some(feed);
        self
    }

    /// Add a forex feed. Call order sets priority.
    pub fn with_forex_feed(mut self, feed: ProviderFeed) -> Self {
        self.forex_feeds.push(feed);
        self
    }

    pub fn with_crypto_rest(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.crypto_rest.push(source);
        self
    }

    /// Add a forex REST source. Call order sets priority.
    pub fn with_forex_rest(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.forex_rest.push(source);
        self
    }

    /// Treat every symbol of a provider table as priceable.
    pub fn with_symbols(mut self, symbols: &SymbolMap) -> Self {
        self.known.extend(symbols.canonical_symbols().iter().cloned());
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn FeedTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Upstream batch fetches started so far.
    pub fn batches_started(&self) -> u64 {
        self.batches_started.load(Ordering::Relaxed)
    }

    pub fn category_of(&self, symbol: &CanonicalSymbol) -> Category {
        if self.config.crypto_pairs.contains(symbol) {
            Category::Crypto
        } else {
            Category::Forex
        }
    }

    /// Listed by a provider, or a forex cross over two listed USD legs.
    pub fn is_known(&self, symbol: &CanonicalSymbol) -> bool {
        if self.known.contains(symbol) {
            return true;
        }
        if self.category_of(symbol) == Category::Crypto {
            return false;
        }
        let has_usd_leg = |ccy: &str| {
            ccy == "USD"
                || self.known.contains(&CanonicalSymbol::new(ccy, "USD"))
                || self.known.contains(&CanonicalSymbol::new("USD", ccy))
        };
        has_usd_leg(symbol.base()) && has_usd_leg(symbol.quote())
    }

    // ────────────────────────────────────────────
    // Public surface
    // ────────────────────────────────────────────

    /// Best current quote for `symbol`, or `None` when nothing is known.
    pub async fn get_price(&self, symbol: &CanonicalSymbol) -> Option<Quote> {
        let category = self.category_of(symbol);

        if let Some(priced) = self.live_price(symbol, category).await {
            return Some(self.finish(priced.quote, category));
        }
        if let Some(priced) = self.ttl_price(symbol, true).await {
            return Some(self.finish(priced.quote, category));
        }

        if !self.is_known(symbol) {
            debug!(symbol = %symbol, "No provider lists symbol, skipping refresh");
        } else if let Err(e) = self.refresh(category).await {
            debug!(symbol = %symbol, error = %e, "Refresh failed, serving last good value");
        }

        self.stale_price(symbol, category)
            .await
            .map(|priced| self.finish(priced.quote, category))
    }

    /// Every configured instrument that can be priced right now.
    pub async fn get_all_prices(&self) -> AllPrices {
        for category in [Category::Forex, Category::Crypto] {
            if self.needs_cold_refresh(category).await {
                if let Err(e) = self.refresh(category).await {
                    debug!(key = batch_key(category), error = %e, "Cold-start refresh failed");
                }
            }
        }

        let direct = self.forex_entries().await;
        let direct_legs: HashMap<CanonicalSymbol, Leg> = direct
            .iter()
            .map(|(symbol, (entry, _))| (symbol.clone(), leg_of(&entry.quote, entry.change_percent())))
            .collect();
        let ttl = self.ttl_snapshot().await;
        let ttl_legs: HashMap<CanonicalSymbol, Leg> = ttl
            .iter()
            .map(|(symbol, e)| {
                let leg = leg_of(&e.snapshot.quote, e.snapshot.change_percent.unwrap_or(0.0));
                (symbol.clone(), leg)
            })
            .collect();

        let mut prices = AllPrices::default();

        for pair in &self.config.forex_pairs {
            let priced = match direct.get(pair) {
                Some((entry, provider)) => Some(Priced {
                    quote: entry.quote.clone(),
                    change_percent: entry.change_percent(),
                    source: provider.to_string(),
                }),
                None => self
                    .derive(pair, &direct_legs)
                    .or_else(|| ttl.get(pair).map(ttl_priced))
                    .or_else(|| self.derive(pair, &ttl_legs)),
            };
            if let Some(priced) = priced {
                prices.forex.push(self.record(priced, Category::Forex));
            }
        }

        let crypto_cache = match &self.crypto_feed {
            Some(feed) => feed.cache.snapshot().await,
            None => Vec::new(),
        };
        let crypto_provider = self.crypto_feed.as_ref().map(|f| f.provider);
        for pair in &self.config.crypto_pairs {
            let priced = crypto_cache
                .iter()
                .find(|e| &e.quote.symbol == pair)
                .map(|entry| Priced {
                    quote: entry.quote.clone(),
                    change_percent: entry.change_percent(),
                    source: crypto_provider.map(|p| p.to_string()).unwrap_or_default(),
                })
                .or_else(|| ttl.get(pair).map(ttl_priced));
            if let Some(priced) = priced {
                prices.crypto.push(self.record(priced, Category::Crypto));
            }
        }

        prices
    }

    /// Mid price of `symbol`, or `None` on a miss.
    pub async fn get_symbol_price(&self, symbol: &CanonicalSymbol) -> Option<f64> {
        for feed in &self.forex_feeds {
            if let Some(quote) = feed.cache.get(symbol).await {
                return Some(mid(&self.finish(quote, Category::Forex)));
            }
        }
        if let Some(feed) = &self.crypto_feed {
            if let Some(quote) = feed.cache.get(symbol).await {
                return Some(mid(&self.finish(quote, Category::Crypto)));
            }
        }

        let all = self.get_all_prices().await;
        all.find(symbol).map(|r| (r.bid + r.ask) / 2.0)
    }

    /// Drop REST results (fresh and last-good). Provider caches survive.
    pub async fn clear_cache(&self) {
        let mut ttl = self.ttl_cache.write().await;
        let dropped = ttl.len();
        ttl.clear();
        lock(&self.recent).clear();
        info!(dropped, "Aggregator cache cleared");
    }

    // ────────────────────────────────────────────
    // Lookup tiers
    // ────────────────────────────────────────────

    async fn live_price(&self, symbol: &CanonicalSymbol, category: Category) -> Option<Priced> {
        match category {
            Category::Crypto => {
                let feed = self.crypto_feed.as_ref()?;
                if !feed.is_subscribed() || feed.cache.is_empty().await {
                    return None;
                }
                let entry = feed.cache.entry(symbol).await?;
                Some(entry_priced(&entry, feed.provider))
            }
            Category::Forex => {
                for feed in &self.forex_feeds {
                    if let Some(entry) = feed.cache.entry(symbol).await {
                        return Some(entry_priced(&entry, feed.provider));
                    }
                }
                let legs: HashMap<CanonicalSymbol, Leg> = self
                    .forex_entries()
                    .await
                    .into_iter()
                    .map(|(s, (entry, _))| (s, leg_of(&entry.quote, entry.change_percent())))
                    .collect();
                self.derive(symbol, &legs)
            }
        }
    }

    async fn ttl_price(&self, symbol: &CanonicalSymbol, fresh_only: bool) -> Option<Priced> {
        let ttl = self.ttl_cache.read().await;
        let entry = ttl.get(symbol)?;
        if fresh_only && entry.stored_at.elapsed() > self.config.ttl {
            return None;
        }
        Some(ttl_priced(entry))
    }

    /// Anything at all: last good REST value, a cross over it, or the
    /// provider cache regardless of connector state.
    async fn stale_price(&self, symbol: &CanonicalSymbol, category: Category) -> Option<Priced> {
        if let Some(priced) = self.ttl_price(symbol, false).await {
            return Some(priced);
        }
        match category {
            Category::Forex => {
                let ttl_legs: HashMap<CanonicalSymbol, Leg> = self
                    .ttl_snapshot()
                    .await
                    .iter()
                    .map(|(s, e)| {
                        (s.clone(), leg_of(&e.snapshot.quote, e.snapshot.change_percent.unwrap_or(0.0)))
                    })
                    .collect();
                self.derive(symbol, &ttl_legs)
            }
            Category::Crypto => {
                let feed = self.crypto_feed.as_ref()?;
                let entry = feed.cache.entry(symbol).await?;
                Some(entry_priced(&entry, feed.provider))
            }
        }
    }

    fn derive(&self, pair: &CanonicalSymbol, legs: &HashMap<CanonicalSymbol, Leg>) -> Option<Priced> {
        let cross = cross_rate::derive(pair, self.config.cross_spread, |s| legs.get(s).copied())?;
        Some(Priced {
            quote: Quote::new(pair.clone(), cross.bid, cross.ask, cross.timestamp_ms),
            change_percent: cross.change_percent,
            source: DERIVED_SOURCE.to_string(),
        })
    }

    /// Direct forex quotes, first provider in priority order wins.
    async fn forex_entries(&self) -> HashMap<CanonicalSymbol, (Arc<CacheEntry>, Provider)> {
        let mut merged = HashMap::new();
        for feed in &self.forex_feeds {
            for entry in feed.cache.snapshot().await {
                merged
                    .entry(entry.quote.symbol.clone())
                    .or_insert_with(|| (Arc::clone(&entry), feed.provider));
            }
        }
        merged
    }

    async fn ttl_snapshot(&self) -> TtlMap {
        self.ttl_cache.read().await.clone()
    }

    async fn needs_cold_refresh(&self, category: Category) -> bool {
        let sources = self.sources_for(category);
        if sources.is_empty() {
            return false;
        }

        let caches_empty = match category {
            Category::Crypto => match &self.crypto_feed {
                Some(feed) => feed.cache.is_empty().await,
                None => true,
            },
            Category::Forex => {
                let mut empty = true;
                for feed in &self.forex_feeds {
                    empty &= feed.cache.is_empty().await;
                }
                empty
            }
        };
        if !caches_empty {
            return false;
        }

        let ttl = self.ttl_cache.read().await;
        let providers: Vec<Provider> = sources.iter().map(|s| s.provider()).collect();
        !ttl.values()
            .any(|e| providers.contains(&e.provider) && e.stored_at.elapsed() <= self.config.ttl)
    }

    // ────────────────────────────────────────────
    // Single-flight refresh
    // ────────────────────────────────────────────

    fn sources_for(&self, category: Category) -> &[Arc<dyn SnapshotSource>] {
        match category {
            Category::Crypto => &self.crypto_rest,
            Category::Forex => &self.forex_rest,
        }
    }

    /// Fetch the category batch, sharing one upstream request between
    /// every concurrent caller. Results land in the TTL cache before the
    /// guard is released. A batch that succeeded within the TTL is
    /// returned as is.
    async fn refresh(&self, category: Category) -> BatchResult {
        let key = batch_key(category);

        if let Some((fetched_at, quotes)) = lock(&self.recent).get(key) {
            if fetched_at.elapsed() <= self.config.ttl {
                debug!(key, "Batch still fresh, skipping refresh");
                return Ok(Arc::clone(quotes));
            }
        }

        let shared = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(key) {
                Some(existing) => {
                    if let Some(telemetry) = &self.telemetry {
                        telemetry.singleflight_joined(key);
                    }
                    debug!(key, "Joining in-flight refresh");
                    existing.clone()
                }
                None => {
                    let fetch = fetch_batch(
                        key,
                        self.sources_for(category).to_vec(),
                        Arc::clone(&self.ttl_cache),
                        Arc::clone(&self.batches_started),
                    )
                    .boxed()
                    .shared();
                    in_flight.insert(key, fetch.clone());
                    fetch
                }
            }
        };

        let result = shared.clone().await;

        let mut in_flight = lock(&self.in_flight);
        if in_flight.get(key).is_some_and(|current| current.ptr_eq(&shared)) {
            in_flight.remove(key);
            if let Ok(quotes) = &result {
                lock(&self.recent).insert(key, (Instant::now(), Arc::clone(quotes)));
            }
        }
        result
    }

    // ────────────────────────────────────────────
    // Presentation
    // ────────────────────────────────────────────

    /// Give ask-less quotes a synthetic ask.
    fn finish(&self, mut quote: Quote, category: Category) -> Quote {
        if !quote.has_real_ask() {
            quote.ask = match category {
                Category::Crypto => quote.bid * (1.0 + self.config.crypto_spread_bps / 10_000.0),
                Category::Forex => quote.bid + self.config.cross_spread,
            };
        }
        quote
    }

    fn record(&self, priced: Priced, category: Category) -> AggregatedQuoteRecord {
        let quote = self.finish(priced.quote, category);
        AggregatedQuoteRecord {
            spread: quote.spread(),
            symbol: quote.symbol,
            category,
            bid: quote.bid,
            ask: quote.ask,
            change_percent: priced.change_percent,
            source: priced.source,
            timestamp: quote.timestamp_ms,
        }
    }
}

fn mid(quote: &Quote) -> f64 {
    (quote.bid + quote.ask) / 2.0
}

fn entry_priced(entry: &CacheEntry, provider: Provider) -> Priced {
    Priced {
        quote: entry.quote.clone(),
        change_percent: entry.change_percent(),
        source: provider.to_string(),
    }
}

fn ttl_priced(entry: &TtlEntry) -> Priced {
    Priced {
        quote: entry.snapshot.quote.clone(),
        change_percent: entry.snapshot.change_percent.unwrap_or(0.0),
        source: entry.provider.to_string(),
    }
}

/// Try each source in priority order; store the first success.
async fn fetch_batch(
    key: &'static str,
    sources: Vec<Arc<dyn SnapshotSource>>,
    ttl_cache: Arc<RwLock<TtlMap>>,
    batches_started: Arc<AtomicU64>,
) -> BatchResult {
    if sources.is_empty() {
        return Err(FeedError::Transport(format!("no REST source for {key}")));
    }
    batches_started.fetch_add(1, Ordering::Relaxed);

    let mut last_error = None;
    for source in sources {
        let provider = source.provider();
        match source.fetch_snapshot().await {
            Ok(quotes) => {
                let stored_at = Instant::now();
                let mut ttl = ttl_cache.write().await;
                for snapshot in &quotes {
                    ttl.insert(
                        snapshot.quote.symbol.clone(),
                        TtlEntry {
                            snapshot: snapshot.clone(),
                            provider,
                            stored_at,
                        },
                    );
                }
                debug!(key, provider = %provider, quotes = quotes.len(), "Refresh stored");
                return Ok(Arc::new(quotes));
            }
            Err(e) => {
                warn!(key, provider = %provider, error = %e, "Refresh source failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| FeedError::Transport(format!("no REST source for {key}"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eur_usd() -> CanonicalSymbol {
        CanonicalSymbol::new("EUR", "USD")
    }

    fn gbp_usd() -> CanonicalSymbol {
        CanonicalSymbol::new("GBP", "USD")
    }

    fn forex_feed(provider: Provider) -> (ProviderFeed, watch::Sender<ConnectionState>) {
        let (tx, rx) = watch::channel(ConnectionState::Subscribed);
        (ProviderFeed::new(Arc::new(PriceCache::new(provider)), rx), tx)
    }

    #[tokio::test]
    async fn test_forex_priority_order() {
        let (polygon, _p) = forex_feed(Provider::Polygon);
        let (twelve, _t) = forex_feed(Provider::TwelveData);
        polygon.cache.upsert(eur_usd(), 1.0850, 1.0852, 1).await;
        twelve.cache.upsert(eur_usd(), 1.0900, 1.0902, 2).await;
        twelve.cache.upsert(gbp_usd(), 1.2650, 1.2652, 2).await;

        let agg = Aggregator::new(AggregatorConfig::default())
            .with_forex_feed(polygon)
            .with_forex_feed(twelve);

        assert_eq!(agg.get_price(&eur_usd()).await.unwrap().bid, 1.0850);
        assert_eq!(agg.get_price(&gbp_usd()).await.unwrap().bid, 1.2650);
    }

    #[tokio::test]
    async fn test_cross_rate_from_usd_legs() {
        let (polygon, _p) = forex_feed(Provider::Polygon);
        polygon.cache.upsert(eur_usd(), 1.0850, 1.0850, 1).await;
        polygon.cache.upsert(gbp_usd(), 1.2650, 1.2650, 1).await;
        let agg = Aggregator::new(AggregatorConfig::default()).with_forex_feed(polygon);

        let eur_gbp = CanonicalSymbol::new("EUR", "GBP");
        let quote = agg.get_price(&eur_gbp).await.unwrap();
        assert!((quote.bid - 1.0850 / 1.2650).abs() < 1e-12);
        assert!((quote.ask - (quote.bid + 0.0002)).abs() < 1e-12);

        let all = agg.get_all_prices().await;
        assert_eq!(all.find(&eur_gbp).unwrap().source, DERIVED_SOURCE);
    }

    #[tokio::test]
    async fn test_cross_record_carries_oldest_leg_time() {
        let (polygon, _p) = forex_feed(Provider::Polygon);
        polygon.cache.upsert(eur_usd(), 1.0850, 1.0852, 5_000).await;
        polygon.cache.upsert(gbp_usd(), 1.2650, 1.2652, 9_000).await;
        let agg = Aggregator::new(AggregatorConfig::default()).with_forex_feed(polygon);

        let all = agg.get_all_prices().await;
        let cross = all.find(&CanonicalSymbol::new("EUR", "GBP")).unwrap();
        assert_eq!(cross.timestamp, 5_000);
        assert_eq!(all.find(&gbp_usd()).unwrap().timestamp, 9_000);
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_absent() {
        let agg = Aggregator::new(AggregatorConfig::default());
        let xyz = CanonicalSymbol::new("XYZ", "ABC");
        assert!(agg.get_price(&xyz).await.is_none());
        assert!(agg.get_symbol_price(&xyz).await.is_none());
    }

    #[tokio::test]
    async fn test_synthetic_ask_for_forex_without_ask() {
        let (twelve, _t) = forex_feed(Provider::TwelveData);
        twelve.cache.upsert(eur_usd(), 1.0850, 1.0850, 1).await;
        let agg = Aggregator::new(AggregatorConfig::default()).with_forex_feed(twelve);

        let quote = agg.get_price(&eur_usd()).await.unwrap();
        assert!((quote.ask - 1.0852).abs() < 1e-12);
        let mid = agg.get_symbol_price(&eur_usd()).await.unwrap();
        assert!((mid - 1.0851).abs() < 1e-12);
    }
}
