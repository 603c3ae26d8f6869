use super::{Bar, ChainRow, OptionQuote, QuoteCache, StockQuote, UpstreamSource, UpstreamStats};
use crate::{
    bus::{QuoteBus, UpstreamEvent},
    error::UpstreamError,
    instrument::{Expiration, InstrumentKey, OptionContract, OptionRight},
};
use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, Utc, Weekday};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::debug;

/// Number of weekly expirations listed per symbol.
const EXPIRATION_COUNT: usize = 6;

/// Strikes either side of spot in a chain snapshot.
const CHAIN_HALF_WIDTH: i64 = 10;

/// Default spot price for symbols without an explicit seed.
const DEFAULT_SPOT: Decimal = Decimal::from_parts(45_000, 0, 0, false, 2);

/// Upstream calls observed by a [`SimulatedUpstream`].
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CallCounts {
    pub expirations: usize,
    pub options_chain: usize,
    pub stock_quote: usize,
    pub historical_bars: usize,
    pub subscribe: usize,
    pub unsubscribe: usize,
}

/// In-process upstream with random walk prices, call accounting and failure injection.
///
/// Used by the server when no market data terminal is available and by tests asserting how
/// often the scarce upstream was touched.
#[derive(Debug)]
pub struct SimulatedUpstream {
    bus: QuoteBus,
    cache: QuoteCache,
    spots: Mutex<FnvHashMap<SmolStr, Decimal>>,
    subscribe_calls: Mutex<FnvHashMap<InstrumentKey, usize>>,
    unsubscribe_calls: Mutex<FnvHashMap<InstrumentKey, usize>>,
    expirations_calls: AtomicUsize,
    chain_calls: AtomicUsize,
    stock_calls: AtomicUsize,
    history_calls: AtomicUsize,
    fail_fetches: AtomicBool,
    fail_subscribe: AtomicBool,
    fetch_latency: Mutex<Duration>,
    history_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl SimulatedUpstream {
    pub fn new(bus: QuoteBus) -> Self {
        Self {
            bus,
            cache: QuoteCache::default(),
            spots: Mutex::new(FnvHashMap::default()),
            subscribe_calls: Mutex::new(FnvHashMap::default()),
            unsubscribe_calls: Mutex::new(FnvHashMap::default()),
            expirations_calls: AtomicUsize::new(0),
            chain_calls: AtomicUsize::new(0),
            stock_calls: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
            fail_fetches: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fetch_latency: Mutex::new(Duration::ZERO),
            history_gate: Mutex::new(None),
        }
    }

    /// Seed the spot price the random walk starts from.
    pub fn with_spot(self, symbol: &str, price: Decimal) -> Self {
        self.spots.lock().insert(SmolStr::new(symbol), price);
        self
    }

    /// Delay every snapshot fetch by `latency`.
    pub fn with_fetch_latency(self, latency: Duration) -> Self {
        *self.fetch_latency.lock() = latency;
        self
    }

    /// Make every historical fetch wait for one permit of `gate`.
    pub fn with_history_gate(self, gate: Arc<Semaphore>) -> Self {
        *self.history_gate.lock() = Some(gate);
        self
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn subscribe_calls(&self, key: &InstrumentKey) -> usize {
        self.subscribe_calls.lock().get(key).copied().unwrap_or(0)
    }

    pub fn unsubscribe_calls(&self, key: &InstrumentKey) -> usize {
        self.unsubscribe_calls.lock().get(key).copied().unwrap_or(0)
    }

    pub fn call_counts(&self) -> CallCounts {
        CallCounts {
            expirations: self.expirations_calls.load(Ordering::SeqCst),
            options_chain: self.chain_calls.load(Ordering::SeqCst),
            stock_quote: self.stock_calls.load(Ordering::SeqCst),
            historical_bars: self.history_calls.load(Ordering::SeqCst),
            subscribe: self.subscribe_calls.lock().values().sum(),
            unsubscribe: self.unsubscribe_calls.lock().values().sum(),
        }
    }

    /// Publish a quote as if it arrived on the stream.
    pub fn publish(&self, event: UpstreamEvent) {
        self.cache.apply(&event);
        self.bus.publish(event);
    }

    /// Advance every tracked instrument by one random step and publish the result.
    pub fn tick(&self) {
        for key in self.cache.tracked() {
            let event = match key {
                InstrumentKey::Option(contract) => {
                    let spot = self.walk(&contract.root);
                    let quote = simulated_option_quote(&contract, spot);
                    UpstreamEvent::OptionQuote { contract, quote }
                }
                InstrumentKey::Underlying(ticker) => {
                    let spot = self.walk(&ticker);
                    UpstreamEvent::StockQuote {
                        quote: simulated_stock_quote(spot),
                        ticker,
                    }
                }
            };
            self.publish(event);
        }
    }

    /// Run [`SimulatedUpstream::tick`] every `period`.
    pub fn spawn_feed(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let upstream = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                upstream.tick();
            }
        })
    }

    fn spot(&self, symbol: &str) -> Decimal {
        *self
            .spots
            .lock()
            .entry(SmolStr::new(symbol))
            .or_insert(DEFAULT_SPOT)
    }

    fn walk(&self, symbol: &str) -> Decimal {
        let step = Decimal::new(rand::rng().random_range(-25..=25), 2);
        let mut spots = self.spots.lock();
        let spot = spots.entry(SmolStr::new(symbol)).or_insert(DEFAULT_SPOT);
        *spot = (*spot + step).max(Decimal::ONE);
        *spot
    }

    async fn fetch_guard(&self, counter: &AtomicUsize) -> Result<(), UpstreamError> {
        counter.fetch_add(1, Ordering::SeqCst);

        let latency = *self.fetch_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.fail_fetches.load(Ordering::SeqCst) {
            Err(UpstreamError::Http("simulated fetch failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl UpstreamSource for SimulatedUpstream {
    async fn expirations(&self, _symbol: &str) -> Result<Vec<Expiration>, UpstreamError> {
        self.fetch_guard(&self.expirations_calls).await?;

        let today = Utc::now().date_naive();
        let days_to_friday =
            (Weekday::Fri.num_days_from_monday() + 7 - today.weekday().num_days_from_monday()) % 7;
        let first = today + ChronoDuration::days(i64::from(days_to_friday));

        Ok((0..EXPIRATION_COUNT)
            .map(|week| Expiration(first + ChronoDuration::weeks(week as i64)))
            .collect())
    }

    async fn options_chain(
        &self,
        symbol: &str,
        expiration: Expiration,
    ) -> Result<Vec<ChainRow>, UpstreamError> {
        self.fetch_guard(&self.chain_calls).await?;

        let spot = self.spot(symbol);
        let atm = spot.round();
        let root = SmolStr::new(symbol);

        let rows = (-CHAIN_HALF_WIDTH..=CHAIN_HALF_WIDTH)
            .flat_map(|offset| {
                let strike = atm + Decimal::from(offset);
                let root = root.clone();
                [OptionRight::Call, OptionRight::Put]
                    .into_iter()
                    .filter_map(move |right| {
                        OptionContract::new(root.clone(), expiration, strike, right).ok()
                    })
            })
            .map(|contract| {
                let quote = simulated_option_quote(&contract, spot);
                ChainRow {
                    root: contract.root,
                    expiration: contract.expiration,
                    strike: contract.strike,
                    right: contract.right,
                    bid: quote.bid,
                    ask: quote.ask,
                    bid_size: quote.bid_size,
                    ask_size: quote.ask_size,
                    mid: quote.mid,
                    spread: quote.spread,
                    open_interest: 1_000,
                    delta: None,
                    theta: None,
                    vega: None,
                    iv: None,
                }
            })
            .collect();

        Ok(rows)
    }

    async fn stock_quote(&self, symbol: &str) -> Result<StockQuote, UpstreamError> {
        self.fetch_guard(&self.stock_calls).await?;
        Ok(simulated_stock_quote(self.spot(symbol)))
    }

    async fn historical_bars(
        &self,
        symbol: &str,
        window: Duration,
    ) -> Result<Vec<Bar>, UpstreamError> {
        let gate = self.history_gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| UpstreamError::Unavailable)?
                .forget();
        }

        self.fetch_guard(&self.history_calls).await?;

        let minutes = (window.as_secs() / 60).max(1) as i64;
        let now = Utc::now();
        let mut price = self.spot(symbol);
        let mut rng = rand::rng();

        // Walk backwards from the current spot so the newest bar closes at spot
        let mut bars = (0..minutes)
            .map(|back| {
                let close = price;
                let open = (close - Decimal::new(rng.random_range(-20..=20), 2)).max(Decimal::ONE);
                price = open;
                Bar {
                    time: now - ChronoDuration::minutes(back),
                    open,
                    high: open.max(close),
                    low: open.min(close),
                    close,
                    volume: rng.random_range(1_000..=5_000),
                }
            })
            .collect::<Vec<_>>();
        bars.reverse();

        Ok(bars)
    }

    async fn subscribe_instrument(&self, key: &InstrumentKey) -> Result<(), UpstreamError> {
        *self.subscribe_calls.lock().entry(key.clone()).or_default() += 1;

        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(UpstreamError::Stream("simulated subscribe failure".to_string()));
        }

        debug!(instrument = %key, "simulated upstream subscribed");
        self.cache.track(key.clone());
        Ok(())
    }

    async fn unsubscribe_instrument(&self, key: &InstrumentKey) -> Result<(), UpstreamError> {
        *self.unsubscribe_calls.lock().entry(key.clone()).or_default() += 1;

        debug!(instrument = %key, "simulated upstream unsubscribed");
        self.cache.untrack(key);
        Ok(())
    }

    fn current_quote(&self, contract: &OptionContract) -> Option<OptionQuote> {
        self.cache.option_quote(contract)
    }

    fn current_stock_quote(&self, ticker: &str) -> Option<StockQuote> {
        self.cache.stock_quote(ticker)
    }

    fn quotes_for_root(&self, root: &str) -> Vec<(OptionContract, OptionQuote)> {
        self.cache.quotes_for_root(root)
    }

    fn stats(&self) -> UpstreamStats {
        self.cache.stats(true, self.bus.receiver_count())
    }
}

fn simulated_option_quote(contract: &OptionContract, spot: Decimal) -> OptionQuote {
    let intrinsic = match contract.right {
        OptionRight::Call => (spot - contract.strike).max(Decimal::ZERO),
        OptionRight::Put => (contract.strike - spot).max(Decimal::ZERO),
    };
    let extrinsic = Decimal::new(150, 2);
    let mid = (intrinsic + extrinsic).round_dp(2);
    let half_spread = Decimal::new(2, 2);

    OptionQuote::from_bid_ask(mid - half_spread, mid + half_spread, 50, 50)
}

fn simulated_stock_quote(spot: Decimal) -> StockQuote {
    let half_spread = Decimal::new(1, 2);
    StockQuote::from_bid_ask(spot - half_spread, spot + half_spread, 100, 100)
}
