use crate::{
    error::InstrumentError,
    instrument::{Expiration, InstrumentKey, OptionContract, OptionRight},
    market_hours::MarketSession,
    protocol::ContractParams,
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Bounded concurrency queue running one job per [`TradeSignal`].
pub mod queue;

/// Pluggable [`Scorer`](scoring::Scorer) and the default weighted composite.
pub mod scoring;

pub use queue::{AnalysisQueue, QueueStatus, ReportSink, SubmitOutcome};
pub use scoring::{CompositeScorer, PriceContext, ScoreBreakdown, ScoreInput, Scorer, decide};

/// Trade alert as received from an external producer, before validation.
///
/// Contract fields are loosely typed since producers send strikes and expirations as either
/// strings or numbers.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SignalRequest {
    #[serde(default)]
    pub id: Option<SmolStr>,
    #[serde(flatten)]
    pub contract: ContractParams,
    #[serde(default)]
    pub trader: Option<SmolStr>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub price: Option<Decimal>,
}

impl SignalRequest {
    pub fn into_signal(self, received_at: DateTime<Utc>) -> Result<TradeSignal, InstrumentError> {
        Ok(TradeSignal {
            contract: self.contract.contract()?,
            id: self.id,
            trader: self.trader,
            priority: self.priority,
            price: self.price,
            received_at,
        })
    }
}

/// Validated trade alert for one option contract.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeSignal {
    pub id: Option<SmolStr>,
    pub contract: OptionContract,
    pub trader: Option<SmolStr>,
    /// Source priority, `1` being the most trusted producer.
    pub priority: Option<u8>,
    /// Entry price quoted by the producer.
    pub price: Option<Decimal>,
    pub received_at: DateTime<Utc>,
}

impl TradeSignal {
    /// Deduplication key; one job per contract may be queued or running.
    pub fn key(&self) -> InstrumentKey {
        InstrumentKey::Option(self.contract.clone())
    }

    /// Identifier echoed in the result, defaulting to the contract key.
    pub fn signal_id(&self) -> SmolStr {
        self.id
            .clone()
            .unwrap_or_else(|| SmolStr::new(self.contract.to_string()))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    #[display("BUY")]
    Buy,
    #[display("WATCH")]
    Watch,
    #[display("SKIP")]
    Skip,
    #[display("ERROR")]
    Error,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    #[display("HIGH")]
    High,
    #[display("MEDIUM")]
    Medium,
    #[display("LOW")]
    Low,
}

/// Discrete outcome of scoring a signal.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Decision {
    pub action: Action,
    pub confidence: Confidence,
    pub reason: SmolStr,
}

impl Decision {
    pub fn error(reason: impl Into<SmolStr>) -> Self {
        Self {
            action: Action::Error,
            confidence: Confidence::Low,
            reason: reason.into(),
        }
    }
}

/// Lifecycle of an analysis job.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Terminal record of one analysis job, broadcast as `analysis_complete`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub signal_id: SmolStr,
    pub contract: SmolStr,
    pub root: SmolStr,
    pub expiration: Expiration,
    pub strike: Decimal,
    pub right: OptionRight,
    pub trader: Option<SmolStr>,
    pub score: Decimal,
    pub action: Action,
    pub confidence: Confidence,
    pub reason: SmolStr,
    pub breakdown: Option<ScoreBreakdown>,
    pub state: JobState,
    pub market_session: MarketSession,
    /// Whether a live quote was streaming, skipping the historical fetch.
    pub fast_path: bool,
    pub queued_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub deadline_ms: u64,
    pub duration_ms: u64,
    pub deadline_exceeded: bool,
}
