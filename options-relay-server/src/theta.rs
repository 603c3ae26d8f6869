/// ThetaData terminal upstream
///
/// REST snapshots come from the terminal's HTTP API; live quotes from its stream socket, which is
/// reconnected with exponential backoff and re-subscribed to every tracked instrument.
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use fnv::FnvHashMap;
use futures::{SinkExt, StreamExt};
use options_relay::{
    Expiration, InstrumentKey, OptionContract, OptionRight, QuoteBus, UpstreamEvent,
    UpstreamSource,
    error::UpstreamError,
    market_hours::eastern,
    upstream::{Bar, ChainRow, OptionQuote, QuoteCache, StockQuote, UpstreamStats},
};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use smol_str::SmolStr;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// HTTP status the terminal answers with when a request has no data.
const STATUS_NO_DATA: u16 = 472;

const DEFAULT_HTTP_URL: &str = "http://127.0.0.1:25510";
const DEFAULT_WS_URL: &str = "ws://127.0.0.1:25520/v1/events";

/// ThetaData connection configuration
#[derive(Debug, Clone)]
pub struct ThetaConfig {
    /// Terminal REST base URL
    pub http_url: Url,
    /// Terminal stream socket URL
    pub ws_url: String,
    /// REST request timeout
    pub request_timeout: Duration,
    /// First reconnection delay, doubled per consecutive failure
    pub reconnect_delay: Duration,
    /// Upper bound on the reconnection delay
    pub max_reconnect_delay: Duration,
}

impl ThetaConfig {
    pub fn new(http_url: Url, ws_url: impl Into<String>) -> Self {
        Self {
            http_url,
            ws_url: ws_url.into(),
            request_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }

    pub fn from_env() -> Result<Self, url::ParseError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Terminal addresses from `THETA_HTTP_URL` and `THETA_WS_URL`, local defaults otherwise.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, url::ParseError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http_url = lookup("THETA_HTTP_URL").unwrap_or_else(|| DEFAULT_HTTP_URL.to_string());
        let ws_url = lookup("THETA_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string());
        Ok(Self::new(Url::parse(&http_url)?, ws_url))
    }
}

#[derive(Debug, Clone)]
struct StreamCommand {
    key: InstrumentKey,
    add: bool,
}

/// [`UpstreamSource`] backed by a ThetaData terminal.
#[derive(Debug)]
pub struct ThetaUpstream {
    config: ThetaConfig,
    http: reqwest::Client,
    bus: QuoteBus,
    cache: QuoteCache,
    commands: mpsc::Sender<StreamCommand>,
    connected: AtomicBool,
    next_request_id: AtomicU64,
}

impl ThetaUpstream {
    /// Build the REST client and start the stream task.
    pub fn connect(
        config: ThetaConfig,
        bus: QuoteBus,
    ) -> Result<(Arc<Self>, JoinHandle<()>), UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| UpstreamError::Http(error.to_string()))?;
        let (commands, rx) = mpsc::channel(1024);

        let upstream = Arc::new(Self {
            config,
            http,
            bus,
            cache: QuoteCache::default(),
            commands,
            connected: AtomicBool::new(false),
            next_request_id: AtomicU64::new(1),
        });
        let stream = tokio::spawn(Arc::clone(&upstream).run_stream(rx));

        Ok((upstream, stream))
    }

    /// Stream connection loop with auto-reconnect
    async fn run_stream(self: Arc<Self>, mut commands: mpsc::Receiver<StreamCommand>) {
        info!(url = %self.config.ws_url, "starting upstream stream client");
        let mut attempt = 0u32;

        loop {
            match connect_async(self.config.ws_url.as_str()).await {
                Ok((socket, _)) => {
                    attempt = 0;
                    self.connected.store(true, Ordering::Release);
                    let (mut write, mut read) = socket.split();

                    let tracked = self.cache.tracked();
                    info!(instruments = tracked.len(), "upstream stream connected, resubscribing");

                    let mut healthy = true;
                    for key in tracked {
                        let request = self.stream_request(&key, true);
                        if write.send(Message::Text(request.into())).await.is_err() {
                            healthy = false;
                            break;
                        }
                    }

                    while healthy {
                        tokio::select! {
                            command = commands.recv() => match command {
                                Some(StreamCommand { key, add }) => {
                                    let request = self.stream_request(&key, add);
                                    if write.send(Message::Text(request.into())).await.is_err() {
                                        healthy = false;
                                    }
                                }
                                None => {
                                    self.connected.store(false, Ordering::Release);
                                    info!("upstream stream client stopped");
                                    return;
                                }
                            },
                            message = read.next() => match message {
                                Some(Ok(Message::Text(text))) => self.handle_stream_message(text.as_str()),
                                Some(Ok(Message::Close(frame))) => {
                                    info!(?frame, "upstream stream closed by terminal");
                                    healthy = false;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(error)) => {
                                    warn!(%error, "upstream stream error");
                                    healthy = false;
                                }
                                None => healthy = false,
                            },
                        }
                    }

                    self.connected.store(false, Ordering::Release);
                    warn!("upstream stream disconnected");
                }
                Err(error) => {
                    warn!(%error, attempt, "upstream stream connection failed");
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = backoff(
                self.config.reconnect_delay,
                self.config.max_reconnect_delay,
                attempt,
            );
            info!(delay_ms = delay.as_millis() as u64, attempt, "reconnecting to upstream stream");
            tokio::time::sleep(delay).await;
        }
    }

    fn stream_request(&self, key: &InstrumentKey, add: bool) -> String {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = match key {
            InstrumentKey::Option(contract) => json!({
                "msg_type": "STREAM",
                "sec_type": "OPTION",
                "req_type": "QUOTE",
                "add": add,
                "id": id,
                "contract": {
                    "root": contract.root,
                    "expiration": contract.expiration.as_u32(),
                    "strike": millistrike(contract.strike),
                    "right": contract.right.as_long_str(),
                },
            }),
            InstrumentKey::Underlying(ticker) => json!({
                "msg_type": "STREAM",
                "sec_type": "STOCK",
                "req_type": "QUOTE",
                "add": add,
                "id": id,
                "contract": { "root": ticker },
            }),
        };
        request.to_string()
    }

    fn handle_stream_message(&self, text: &str) {
        let message = match serde_json::from_str::<StreamMessage>(text) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, "unparseable upstream stream message");
                return;
            }
        };

        let Some(event) = message.into_event() else {
            return;
        };

        // Late quotes for an instrument that was just removed are dropped
        if !self.cache.is_tracked(&event.key()) {
            return;
        }
        self.cache.apply(&event);
        self.bus.publish(event);
    }

    async fn get<T>(&self, endpoint: &str, query: &[(&str, String)]) -> Result<T, UpstreamError>
    where
        T: DeserializeOwned,
    {
        let url = self
            .config
            .http_url
            .join(endpoint)
            .map_err(|error| UpstreamError::Http(error.to_string()))?;

        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|error| UpstreamError::Http(error.to_string()))?;

        let status = response.status().as_u16();
        if status == STATUS_NO_DATA {
            return Err(UpstreamError::NoData(endpoint.to_string()));
        }
        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                endpoint: endpoint.to_string(),
                status,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|error| UpstreamError::Parse(error.to_string()))
    }

    async fn bulk(
        &self,
        endpoint: &str,
        symbol: &str,
        expiration: Expiration,
    ) -> Result<Vec<BulkRow>, UpstreamError> {
        let query = [
            ("root", symbol.to_string()),
            ("exp", expiration.as_u32().to_string()),
        ];
        Ok(self
            .get::<Envelope<Vec<BulkRow>>>(endpoint, &query)
            .await?
            .response)
    }
}

#[async_trait::async_trait]
impl UpstreamSource for ThetaUpstream {
    async fn expirations(&self, symbol: &str) -> Result<Vec<Expiration>, UpstreamError> {
        let raw = self
            .get::<Envelope<Vec<u32>>>("v2/list/expirations", &[("root", symbol.to_string())])
            .await?
            .response;

        let today = eastern(Utc::now()).date_naive();
        Ok(raw
            .into_iter()
            .filter_map(|date| parse_date(date).map(Expiration))
            .filter(|expiration| expiration.0 >= today)
            .collect())
    }

    async fn options_chain(
        &self,
        symbol: &str,
        expiration: Expiration,
    ) -> Result<Vec<ChainRow>, UpstreamError> {
        let (quotes, open_interest, greeks) = tokio::join!(
            self.bulk("v2/bulk_snapshot/option/quote", symbol, expiration),
            self.bulk("v2/bulk_snapshot/option/open_interest", symbol, expiration),
            self.bulk("v2/bulk_snapshot/option/greeks", symbol, expiration),
        );

        let quotes = quotes?;
        let open_interest = open_interest?;
        let greeks = greeks.unwrap_or_else(|error| {
            warn!(%symbol, %expiration, %error, "greeks unavailable, continuing without them");
            Vec::new()
        });

        let open_interest = open_interest
            .into_iter()
            .filter_map(|row| Some((row.contract.id()?, row.tick(1).and_then(|oi| oi.to_u64())?)))
            .collect::<FnvHashMap<_, _>>();
        let greeks = greeks
            .into_iter()
            .filter_map(|row| {
                let tick = row.ticks.first()?.clone();
                Some((row.contract.id()?, tick))
            })
            .collect::<FnvHashMap<_, _>>();

        let mut rows = quotes
            .into_iter()
            .filter_map(|row| {
                let id = row.contract.id()?;
                let contract = row.contract.to_contract()?;
                let quote = OptionQuote::from_bid_ask(
                    decimal(row.tick(3)?),
                    decimal(row.tick(7)?),
                    row.tick(1)?.to_u64()?,
                    row.tick(5)?.to_u64()?,
                );
                let greek = |index: usize| greeks.get(&id).and_then(|tick| tick.get(index).copied());

                Some(ChainRow {
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
                    open_interest: open_interest.get(&id).copied().unwrap_or_default(),
                    delta: greek(3),
                    theta: greek(4),
                    vega: greek(5),
                    iv: greek(9),
                })
            })
            .collect::<Vec<_>>();

        if rows.is_empty() {
            return Err(UpstreamError::NoData(format!("{symbol} {expiration}")));
        }

        rows.sort_by(|a, b| a.strike.cmp(&b.strike).then(a.right.cmp(&b.right)));
        Ok(rows)
    }

    async fn stock_quote(&self, symbol: &str) -> Result<StockQuote, UpstreamError> {
        // [ms_of_day, bid_size, bid_exchange, bid, bid_condition, ask_size, ask_exchange, ask, ...]
        let tick = self
            .get::<Envelope<Vec<Vec<f64>>>>("v2/snapshot/stock/quote", &[("root", symbol.to_string())])
            .await?
            .response
            .into_iter()
            .next()
            .filter(|tick| tick.len() >= 8)
            .ok_or_else(|| UpstreamError::NoData(symbol.to_string()))?;

        Ok(StockQuote::from_bid_ask(
            decimal(tick[3]),
            decimal(tick[7]),
            tick[1].to_u64().unwrap_or_default(),
            tick[5].to_u64().unwrap_or_default(),
        ))
    }

    async fn historical_bars(
        &self,
        symbol: &str,
        window: Duration,
    ) -> Result<Vec<Bar>, UpstreamError> {
        let now = Utc::now();
        let start = now - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::zero());
        let query = [
            ("root", symbol.to_string()),
            ("start_date", eastern(start).format("%Y%m%d").to_string()),
            ("end_date", eastern(now).format("%Y%m%d").to_string()),
            ("ivl", "60000".to_string()),
        ];

        // [ms_of_day, open, high, low, close, volume, count, date]
        let bars = self
            .get::<Envelope<Vec<Vec<f64>>>>("v2/hist/stock/ohlc", &query)
            .await?
            .response
            .into_iter()
            .filter(|row| row.len() >= 8)
            .filter_map(|row| {
                Some(Bar {
                    time: bar_time(row[7].to_u32()?, row[0].to_u64()?)?,
                    open: decimal(row[1]),
                    high: decimal(row[2]),
                    low: decimal(row[3]),
                    close: decimal(row[4]),
                    volume: row[5].to_u64().unwrap_or_default(),
                })
            })
            .filter(|bar| bar.time >= start && !bar.close.is_zero())
            .collect::<Vec<_>>();

        if bars.is_empty() {
            return Err(UpstreamError::NoData(symbol.to_string()));
        }
        Ok(bars)
    }

    async fn subscribe_instrument(&self, key: &InstrumentKey) -> Result<(), UpstreamError> {
        self.cache.track(key.clone());
        self.commands
            .send(StreamCommand {
                key: key.clone(),
                add: true,
            })
            .await
            .map_err(|_| UpstreamError::Unavailable)
    }

    async fn unsubscribe_instrument(&self, key: &InstrumentKey) -> Result<(), UpstreamError> {
        self.cache.untrack(key);
        self.commands
            .send(StreamCommand {
                key: key.clone(),
                add: false,
            })
            .await
            .map_err(|_| UpstreamError::Unavailable)
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
        self.cache.stats(
            self.connected.load(Ordering::Acquire),
            self.bus.receiver_count(),
        )
    }
}

/// REST response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    response: T,
}

/// One contract of a bulk snapshot response.
#[derive(Debug, Deserialize)]
struct BulkRow {
    contract: WireContract,
    #[serde(default)]
    ticks: Vec<Vec<f64>>,
}

impl BulkRow {
    fn tick(&self, index: usize) -> Option<f64> {
        self.ticks.first()?.get(index).copied()
    }
}

#[derive(Debug, Deserialize)]
struct WireContract {
    #[serde(default)]
    security_type: Option<SmolStr>,
    root: SmolStr,
    #[serde(default)]
    expiration: Option<u32>,
    /// Strike in thousandths of a dollar.
    #[serde(default)]
    strike: Option<i64>,
    #[serde(default)]
    right: Option<SmolStr>,
}

impl WireContract {
    /// Merge key across bulk endpoints for one expiration.
    fn id(&self) -> Option<(i64, SmolStr)> {
        Some((self.strike?, self.right.clone()?))
    }

    fn to_contract(&self) -> Option<OptionContract> {
        let expiration = Expiration(parse_date(self.expiration?)?);
        let strike = Decimal::new(self.strike?, 3).normalize();
        let right = self.right.as_deref()?.parse::<OptionRight>().ok()?;
        OptionContract::new(self.root.clone(), expiration, strike, right).ok()
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireQuote {
    #[serde(default)]
    bid: Decimal,
    #[serde(default)]
    ask: Decimal,
    #[serde(default)]
    bid_size: u64,
    #[serde(default)]
    ask_size: u64,
    #[serde(default)]
    last: Option<Decimal>,
    #[serde(default)]
    volume: u64,
}

/// Quote pushed on the stream socket.
#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    contract: Option<WireContract>,
    #[serde(default)]
    quote: Option<WireQuote>,
}

impl StreamMessage {
    fn into_event(self) -> Option<UpstreamEvent> {
        let contract = self.contract?;
        let quote = self.quote?;

        match contract.security_type.as_deref() {
            Some("OPTION") => Some(UpstreamEvent::OptionQuote {
                contract: contract.to_contract()?,
                quote: OptionQuote::from_bid_ask(quote.bid, quote.ask, quote.bid_size, quote.ask_size),
            }),
            Some("STOCK") => {
                let mut stock =
                    StockQuote::from_bid_ask(quote.bid, quote.ask, quote.bid_size, quote.ask_size);
                if let Some(last) = quote.last.filter(|last| !last.is_zero()) {
                    stock.price = last;
                    stock.last = last;
                }
                stock.volume = quote.volume;
                Some(UpstreamEvent::StockQuote {
                    ticker: contract.root,
                    quote: stock,
                })
            }
            _ => None,
        }
    }
}

fn millistrike(strike: Decimal) -> i64 {
    (strike * Decimal::ONE_THOUSAND).trunc().to_i64().unwrap_or_default()
}

fn decimal(value: f64) -> Decimal {
    Decimal::from_f64_retain(value)
        .map(|value| value.round_dp(4).normalize())
        .unwrap_or_default()
}

/// Terminal `YYYYMMDD` integer date.
fn parse_date(date: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt((date / 10_000) as i32, (date / 100) % 100, date % 100)
}

/// Exchange local `date` plus milliseconds since midnight, as UTC.
fn bar_time(date: u32, ms_of_day: u64) -> Option<DateTime<Utc>> {
    let midnight = parse_date(date)?.and_hms_opt(0, 0, 0)?;
    let local = chrono_tz::America::New_York
        .from_local_datetime(&midnight)
        .earliest()?;
    Some((local + ChronoDuration::milliseconds(ms_of_day as i64)).with_timezone(&Utc))
}

fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn contract(raw: &str) -> InstrumentKey {
        raw.parse().unwrap()
    }

    #[test]
    fn test_config_from_lookup() {
        struct TestCase {
            http: Option<&'static str>,
            ws: Option<&'static str>,
            expected: Result<(&'static str, &'static str), url::ParseError>,
        }

        let tests = vec![
            TestCase {
                // TC0: nothing set
                http: None,
                ws: None,
                expected: Ok(("http://127.0.0.1:25510/", "ws://127.0.0.1:25520/v1/events")),
            },
            TestCase {
                // TC1: both overridden
                http: Some("http://terminal:25510"),
                ws: Some("ws://terminal:25520/v1/events"),
                expected: Ok(("http://terminal:25510/", "ws://terminal:25520/v1/events")),
            },
            TestCase {
                // TC2: port out of range
                http: Some("http://terminal:99999"),
                ws: None,
                expected: Err(url::ParseError::InvalidPort),
            },
            TestCase {
                // TC3: garbage REST address
                http: Some("not a url"),
                ws: None,
                expected: Err(url::ParseError::RelativeUrlWithoutBase),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = ThetaConfig::from_lookup(|key| match key {
                "THETA_HTTP_URL" => test.http.map(str::to_string),
                "THETA_WS_URL" => test.ws.map(str::to_string),
                _ => None,
            });
            let actual = actual
                .as_ref()
                .map(|config| (config.http_url.as_str(), config.ws_url.as_str()))
                .map_err(|error| *error);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_backoff() {
        struct TestCase {
            attempt: u32,
            expected: Duration,
        }

        let tests = vec![
            TestCase {
                // TC0: first retry waits the base delay
                attempt: 1,
                expected: Duration::from_secs(5),
            },
            TestCase {
                // TC1: doubles per failure
                attempt: 3,
                expected: Duration::from_secs(20),
            },
            TestCase {
                // TC2: capped
                attempt: 10,
                expected: Duration::from_secs(60),
            },
            TestCase {
                // TC3: huge attempt counts do not overflow
                attempt: u32::MAX,
                expected: Duration::from_secs(60),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = backoff(Duration::from_secs(5), Duration::from_secs(60), test.attempt);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_stream_message_into_event() {
        struct TestCase {
            input: &'static str,
            expected: Option<InstrumentKey>,
        }

        let tests = vec![
            TestCase {
                // TC0: option quote with millistrike
                input: r#"{"header":{"type":"QUOTE"},"contract":{"security_type":"OPTION","root":"SPY","expiration":20250620,"strike":450000,"right":"C"},"quote":{"bid":1.2,"ask":1.3,"bid_size":5,"ask_size":7}}"#,
                expected: Some(contract("SPY:20250620:450:C")),
            },
            TestCase {
                // TC1: fractional strike
                input: r#"{"contract":{"security_type":"OPTION","root":"SPY","expiration":20250620,"strike":452500,"right":"P"},"quote":{"bid":2.0,"ask":2.1}}"#,
                expected: Some(contract("SPY:20250620:452.5:P")),
            },
            TestCase {
                // TC2: stock quote
                input: r#"{"contract":{"security_type":"STOCK","root":"SPY"},"quote":{"bid":450.1,"ask":450.2,"last":450.15}}"#,
                expected: Some(InstrumentKey::Underlying(SmolStr::new("SPY"))),
            },
            TestCase {
                // TC3: status message without a quote
                input: r#"{"header":{"type":"STATUS","status":"CONNECTED"}}"#,
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let message = serde_json::from_str::<StreamMessage>(test.input).unwrap();
            let actual = message.into_event().map(|event| event.key());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_stock_stream_prefers_last_trade() {
        let message = serde_json::from_str::<StreamMessage>(
            r#"{"contract":{"security_type":"STOCK","root":"QQQ"},"quote":{"bid":400.0,"ask":400.2,"last":400.05,"volume":1200}}"#,
        )
        .unwrap();

        match message.into_event() {
            Some(UpstreamEvent::StockQuote { ticker, quote }) => {
                assert_eq!(ticker, "QQQ");
                assert_eq!(quote.price, dec!(400.05));
                assert_eq!(quote.volume, 1200);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_millistrike_and_dates() {
        assert_eq!(millistrike(dec!(450)), 450_000);
        assert_eq!(millistrike(dec!(452.5)), 452_500);
        assert_eq!(parse_date(20251219), NaiveDate::from_ymd_opt(2025, 12, 19));
        assert_eq!(parse_date(20251340), None);

        // 09:30 EDT
        let open = bar_time(20250620, 34_200_000).unwrap();
        assert_eq!(open, Utc.with_ymd_and_hms(2025, 6, 20, 13, 30, 0).unwrap());
    }
}
