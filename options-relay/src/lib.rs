/// Options Relay - Core Library
///
/// Relays a shared upstream options market data feed to many authenticated WebSocket clients:
/// - reference counted upstream subscriptions, so each instrument is streamed once
/// - session lifecycle with a post connect authentication grace period and a zombie reaper
/// - periodic snapshot broadcast of one shared "viewed" instrument, slowed during the daily
///   upstream maintenance window
/// - a bounded concurrency analysis queue scoring incoming trade signals
///
/// Network front ends live in `options-relay-server`; everything here is transport agnostic and
/// driven through [`Transport`](transport::Transport) handles.

/// All errors generated in `options-relay`.
pub mod error;

/// Runtime tunables with their defaults and environment overrides.
pub mod config;

/// Option contract identifiers, expirations and instrument keys.
pub mod instrument;

/// [`UpstreamSource`](upstream::UpstreamSource) abstraction over the market data provider.
pub mod upstream;

/// Fan-out bus for streamed upstream quotes.
pub mod bus;

/// Session credential verification.
pub mod auth;

/// Outbound message channel bound to one client connection.
pub mod transport;

/// Client wire protocol.
pub mod protocol;

/// Process wide viewed instrument, pause flag and entry timing.
pub mod context;

/// Exchange calendar helpers.
pub mod market_hours;

/// Reference counted instrument subscriptions.
pub mod registry;

/// Per connection state.
pub mod session;

/// Session table, message dispatch and broadcasts.
pub mod manager;

/// Adaptive snapshot broadcast loop.
pub mod scheduler;

/// Trade signal scoring and the analysis job queue.
pub mod analysis;

// Re-export commonly used types for convenience
pub use analysis::{AnalysisQueue, AnalysisRecord, SignalRequest, TradeSignal};
pub use auth::{CredentialService, Identity, StaticCredentials};
pub use bus::{QuoteBus, UpstreamEvent};
pub use config::RelayConfig;
pub use context::{PauseSwitch, SharedContext};
pub use error::RelayError;
pub use instrument::{Expiration, InstrumentKey, OptionContract, OptionRight, ViewedInstrument};
pub use manager::{BroadcastOutcome, SessionManager};
pub use registry::SubscriptionRegistry;
pub use scheduler::BroadcastScheduler;
pub use session::ConnectionId;
pub use transport::{Frame, Transport};
pub use upstream::UpstreamSource;
