use crate::{
    analysis::AnalysisRecord,
    error::InstrumentError,
    instrument::{Expiration, OptionContract},
    session::ConnectionId,
    upstream::{ChainRow, OptionQuote, StockQuote, UpstreamStats},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

/// Messages a client may send, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        #[serde(default)]
        token: Option<String>,
    },
    Subscribe {
        #[serde(default)]
        symbol: Option<Value>,
        #[serde(default)]
        expiration: Option<Value>,
    },
    TrackContract(ContractParams),
    UntrackContract(ContractParams),
    GetQuote(ContractParams),
    GetTickerQuotes {
        #[serde(default)]
        root: Option<Value>,
    },
    GetStockQuote {
        #[serde(default)]
        ticker: Option<Value>,
    },
    StreamStats,
    #[serde(other)]
    Unsupported,
}

/// Loosely typed contract fields; strikes and expirations may arrive as numbers.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContractParams {
    #[serde(default)]
    pub root: Option<Value>,
    #[serde(default)]
    pub expiration: Option<Value>,
    #[serde(default)]
    pub strike: Option<Value>,
    #[serde(default)]
    pub right: Option<Value>,
}

impl ContractParams {
    pub fn contract(&self) -> Result<OptionContract, InstrumentError> {
        OptionContract::parse(
            &param_text(&self.root).unwrap_or_default(),
            &param_text(&self.expiration).unwrap_or_default(),
            &param_text(&self.strike).unwrap_or_default(),
            &param_text(&self.right).unwrap_or_default(),
        )
    }
}

/// Text form of a scalar JSON parameter; `None` for absent, null, or structured values.
pub fn param_text(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

/// A parsed inbound message along with its raw `type`.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub kind: SmolStr,
    pub message: ClientMessage,
}

/// Parse a raw text frame, returning `None` if it is not a JSON object with a string `type`.
pub fn parse_inbound(raw: &str) -> Option<Inbound> {
    let value = serde_json::from_str::<Value>(raw).ok()?;
    let kind = SmolStr::new(value.get("type")?.as_str()?);
    let message = serde_json::from_value::<ClientMessage>(value).ok()?;
    Some(Inbound { kind, message })
}

/// Entry of an `online_users` or `active_users` list.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub username: SmolStr,
    pub is_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<SmolStr>,
}

/// Registry summary carried by `stream_stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub total_contracts: usize,
    pub total_subscriptions: usize,
    pub avg_per_contract: Decimal,
}

/// Contract and quote pair of a `ticker_quotes_response`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickerQuote {
    pub contract: SmolStr,
    #[serde(flatten)]
    pub quote: OptionQuote,
}

/// Messages sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Outbound {
    AuthRequired {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<SmolStr>,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_id: Option<ConnectionId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<SmolStr>,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<SmolStr>,
    },
    AuthSuccess {
        is_admin: bool,
        username: SmolStr,
        message: SmolStr,
        #[serde(skip_serializing_if = "Option::is_none")]
        can_change_ticker: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_solo_user: Option<bool>,
    },
    AuthFailed {
        error: SmolStr,
    },
    AuthTimeout {
        error: SmolStr,
    },
    PermissionDenied {
        error: SmolStr,
        is_admin: bool,
        is_solo_user: bool,
    },
    TickerChanged {
        symbol: SmolStr,
        expiration: Expiration,
        changed_by: SmolStr,
    },
    ContractTracked {
        success: bool,
        contract: SmolStr,
        subscriber_count: usize,
        is_first_subscriber: bool,
        stream_subscribed: bool,
    },
    ContractUntracked {
        success: bool,
        contract: SmolStr,
        subscriber_count: usize,
        is_last_subscriber: bool,
        stream_unsubscribed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<SmolStr>,
    },
    OptionsQuote {
        contract_key: SmolStr,
        #[serde(flatten)]
        quote: OptionQuote,
    },
    StockQuote {
        ticker: SmolStr,
        price: Option<Decimal>,
        quote: Option<StockQuote>,
    },
    QuoteResponse {
        contract: SmolStr,
        quote: Option<OptionQuote>,
    },
    TickerQuotesResponse {
        root: SmolStr,
        quotes: Vec<TickerQuote>,
        count: usize,
    },
    StreamStats {
        #[serde(flatten)]
        upstream: UpstreamStats,
        user_subscriptions: SubscriptionSummary,
    },
    Expirations {
        response: Vec<Expiration>,
    },
    Options {
        response: Vec<ChainRow>,
    },
    Stock {
        response: StockQuote,
    },
    EntryTimingUpdate {
        timing: Value,
        timestamp: i64,
    },
    OnlineUsers {
        users: Vec<OnlineUser>,
        count: usize,
        can_change_ticker: bool,
        is_solo_user: bool,
    },
    ActiveUsers {
        users: Vec<OnlineUser>,
        count: usize,
    },
    AnalysisComplete {
        result: AnalysisRecord,
    },
    RateLimitExceeded {
        error: SmolStr,
        retry_after: u64,
    },
    Error {
        error: SmolStr,
    },
}

impl Outbound {
    pub fn error(error: &str) -> Self {
        Outbound::Error {
            error: SmolStr::new(error),
        }
    }

    /// Wire name of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::AuthRequired { .. } => "auth_required",
            Outbound::AuthSuccess { .. } => "auth_success",
            Outbound::AuthFailed { .. } => "auth_failed",
            Outbound::AuthTimeout { .. } => "auth_timeout",
            Outbound::PermissionDenied { .. } => "permission_denied",
            Outbound::TickerChanged { .. } => "ticker_changed",
            Outbound::ContractTracked { .. } => "contract_tracked",
            Outbound::ContractUntracked { .. } => "contract_untracked",
            Outbound::OptionsQuote { .. } => "options_quote",
            Outbound::StockQuote { .. } => "stock_quote",
            Outbound::QuoteResponse { .. } => "quote_response",
            Outbound::TickerQuotesResponse { .. } => "ticker_quotes_response",
            Outbound::StreamStats { .. } => "stream_stats",
            Outbound::Expirations { .. } => "expirations",
            Outbound::Options { .. } => "options",
            Outbound::Stock { .. } => "stock",
            Outbound::EntryTimingUpdate { .. } => "entry_timing_update",
            Outbound::OnlineUsers { .. } => "online_users",
            Outbound::ActiveUsers { .. } => "active_users",
            Outbound::AnalysisComplete { .. } => "analysis_complete",
            Outbound::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Outbound::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
