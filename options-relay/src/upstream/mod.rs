use crate::{
    bus::UpstreamEvent,
    error::UpstreamError,
    instrument::{Expiration, InstrumentKey, OptionContract, OptionRight},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;

/// In-process [`UpstreamSource`] producing random walk quotes.
pub mod simulated;

/// Top of book quote for one option contract.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OptionQuote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: u64,
    pub ask_size: u64,
    pub mid: Decimal,
    pub spread: Decimal,
    pub time: DateTime<Utc>,
}

impl OptionQuote {
    pub fn from_bid_ask(bid: Decimal, ask: Decimal, bid_size: u64, ask_size: u64) -> Self {
        let (mid, spread) = mid_and_spread(bid, ask);
        Self {
            bid,
            ask,
            bid_size,
            ask_size,
            mid,
            spread,
            time: Utc::now(),
        }
    }
}

/// Quote for an underlying equity.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StockQuote {
    pub price: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: u64,
    pub ask_size: u64,
    pub volume: u64,
    pub last: Decimal,
    #[serde(rename = "isSnapshot", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_snapshot: bool,
    pub time: DateTime<Utc>,
}

impl StockQuote {
    /// Quote priced at the bid/ask midpoint.
    pub fn from_bid_ask(bid: Decimal, ask: Decimal, bid_size: u64, ask_size: u64) -> Self {
        let (price, _) = mid_and_spread(bid, ask);
        Self {
            price,
            bid,
            ask,
            bid_size,
            ask_size,
            volume: 0,
            last: price,
            is_snapshot: false,
            time: Utc::now(),
        }
    }
}

/// One strike/right row of an option chain snapshot.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChainRow {
    pub root: SmolStr,
    pub expiration: Expiration,
    pub strike: Decimal,
    pub right: OptionRight,
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: u64,
    pub ask_size: u64,
    pub mid: Decimal,
    pub spread: Decimal,
    pub open_interest: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vega: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<f64>,
}

/// One minute OHLCV bar.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Bar {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// Health of an upstream quote stream, reported through `stream_stats`.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamStats {
    pub connected: bool,
    pub tracked_contracts: usize,
    pub tracked_stocks: usize,
    pub total_contract_quotes: usize,
    pub total_stock_quotes: usize,
    pub subscribers: usize,
}

/// Rate limited market data source.
///
/// Only the [`SubscriptionRegistry`](crate::registry::SubscriptionRegistry) may call
/// [`subscribe_instrument`](UpstreamSource::subscribe_instrument) and
/// [`unsubscribe_instrument`](UpstreamSource::unsubscribe_instrument). Push updates are published
/// onto the [`QuoteBus`](crate::bus::QuoteBus) the implementation was constructed with.
#[async_trait]
pub trait UpstreamSource: Send + Sync + 'static {
    async fn expirations(&self, symbol: &str) -> Result<Vec<Expiration>, UpstreamError>;

    async fn options_chain(
        &self,
        symbol: &str,
        expiration: Expiration,
    ) -> Result<Vec<ChainRow>, UpstreamError>;

    async fn stock_quote(&self, symbol: &str) -> Result<StockQuote, UpstreamError>;

    /// One minute bars covering the most recent `window`.
    async fn historical_bars(&self, symbol: &str, window: Duration)
    -> Result<Vec<Bar>, UpstreamError>;

    async fn subscribe_instrument(&self, key: &InstrumentKey) -> Result<(), UpstreamError>;

    async fn unsubscribe_instrument(&self, key: &InstrumentKey) -> Result<(), UpstreamError>;

    /// Latest streamed quote for a contract, if it is streaming.
    fn current_quote(&self, contract: &OptionContract) -> Option<OptionQuote>;

    /// Latest streamed quote for an underlying, if it is streaming.
    fn current_stock_quote(&self, ticker: &str) -> Option<StockQuote>;

    /// Every streamed contract quote for a root symbol.
    fn quotes_for_root(&self, root: &str) -> Vec<(OptionContract, OptionQuote)>;

    fn stats(&self) -> UpstreamStats {
        UpstreamStats::default()
    }
}

/// Latest-value cache of streamed quotes plus the set of instruments the stream carries.
#[derive(Debug, Default)]
pub struct QuoteCache {
    state: RwLock<QuoteCacheState>,
}

#[derive(Debug, Default)]
struct QuoteCacheState {
    tracked: FnvHashSet<InstrumentKey>,
    options: FnvHashMap<OptionContract, OptionQuote>,
    stocks: FnvHashMap<SmolStr, StockQuote>,
}

impl QuoteCache {
    pub fn track(&self, key: InstrumentKey) -> bool {
        self.state.write().tracked.insert(key)
    }

    /// Stop tracking an instrument and forget its cached quote.
    pub fn untrack(&self, key: &InstrumentKey) -> bool {
        let mut state = self.state.write();
        match key {
            InstrumentKey::Option(contract) => {
                state.options.remove(contract);
            }
            InstrumentKey::Underlying(ticker) => {
                state.stocks.remove(ticker);
            }
        }
        state.tracked.remove(key)
    }

    pub fn is_tracked(&self, key: &InstrumentKey) -> bool {
        self.state.read().tracked.contains(key)
    }

    pub fn tracked(&self) -> Vec<InstrumentKey> {
        self.state.read().tracked.iter().cloned().collect()
    }

    pub fn apply(&self, event: &UpstreamEvent) {
        let mut state = self.state.write();
        match event {
            UpstreamEvent::OptionQuote { contract, quote } => {
                state.options.insert(contract.clone(), quote.clone());
            }
            UpstreamEvent::StockQuote { ticker, quote } => {
                state.stocks.insert(ticker.clone(), quote.clone());
            }
        }
    }

    pub fn option_quote(&self, contract: &OptionContract) -> Option<OptionQuote> {
        self.state.read().options.get(contract).cloned()
    }

    pub fn stock_quote(&self, ticker: &str) -> Option<StockQuote> {
        self.state.read().stocks.get(ticker).cloned()
    }

    pub fn quotes_for_root(&self, root: &str) -> Vec<(OptionContract, OptionQuote)> {
        let mut quotes = self
            .state
            .read()
            .options
            .iter()
            .filter(|(contract, _)| contract.root == root)
            .map(|(contract, quote)| (contract.clone(), quote.clone()))
            .collect::<Vec<_>>();
        quotes.sort_by(|(a, _), (b, _)| a.cmp(b));
        quotes
    }

    /// Populate the counting fields of [`UpstreamStats`].
    pub fn stats(&self, connected: bool, subscribers: usize) -> UpstreamStats {
        let state = self.state.read();
        let tracked_stocks = state
            .tracked
            .iter()
            .filter(|key| matches!(key, InstrumentKey::Underlying(_)))
            .count();

        UpstreamStats {
            connected,
            tracked_contracts: state.tracked.len() - tracked_stocks,
            tracked_stocks,
            total_contract_quotes: state.options.len(),
            total_stock_quotes: state.stocks.len(),
            subscribers,
        }
    }
}

fn mid_and_spread(bid: Decimal, ask: Decimal) -> (Decimal, Decimal) {
    if bid.is_zero() || ask.is_zero() {
        (Decimal::ZERO, Decimal::ZERO)
    } else {
        ((bid + ask) / Decimal::TWO, ask - bid)
    }
}
