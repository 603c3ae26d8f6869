use crate::{
    analysis::{AnalysisRecord, ReportSink},
    auth::{CredentialService, Identity, Verification},
    bus::{QuoteBus, UpstreamEvent},
    config::{RelayConfig, default_expiration},
    context::{SharedContext, TimingSnapshot},
    error::{InstrumentError, RegistryError, UpstreamError},
    instrument::{Expiration, InstrumentKey, ViewedInstrument, parse_symbol},
    protocol::{
        ClientMessage, ContractParams, Inbound, OnlineUser, Outbound, SubscriptionSummary,
        TickerQuote, param_text, parse_inbound,
    },
    registry::SubscriptionRegistry,
    session::{AuthState, ConnectionId, Session},
    transport::{SendError, Transport, TransportState},
    upstream::UpstreamSource,
};
use chrono::Utc;
use fnv::FnvHashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;
use smol_str::SmolStr;
use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    task::{AbortHandle, JoinHandle},
    time::Instant,
};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, error, info, warn};

const CLOSE_NORMAL: u16 = 1000;

const PERMISSION_DENIED: &str =
    "🔒 Only admins can change tickers when multiple users are online.";

/// Result of one [`SessionManager::broadcast_snapshot`] cycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BroadcastOutcome {
    Sent { recipients: usize, failures: usize },
    /// Operator declared pause; nothing was fetched.
    Paused,
    /// No authenticated session is listening; nothing was fetched.
    NoAudience,
    /// The shared instrument changed while fetching; the payloads were dropped.
    Stale,
    UpstreamFailed,
}

/// Why the reaper removed a session.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ReapReason {
    ClosedTransport,
    Unauthenticated,
    StuckClosing,
}

impl ReapReason {
    pub fn label(&self) -> &'static str {
        match self {
            ReapReason::ClosedTransport => "closed transport",
            ReapReason::Unauthenticated => "never authenticated",
            ReapReason::StuckClosing => "stuck closing",
        }
    }
}

/// Owns every connected session: authentication, inbound message dispatch, teardown and
/// fan-out of shared payloads.
///
/// The session table lives under one mutex that is never held across an await. Each session
/// additionally serialises its own inbound messages, so per connection state is only ever
/// mutated by one message at a time.
pub struct SessionManager {
    config: RelayConfig,
    context: Arc<SharedContext>,
    registry: SubscriptionRegistry,
    upstream: Arc<dyn UpstreamSource>,
    credentials: Arc<dyn CredentialService>,
    bus: QuoteBus,
    sessions: Mutex<FnvHashMap<ConnectionId, Session>>,
    next_id: AtomicU64,
    this: Weak<SessionManager>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.lock().len())
            .field("context", &self.context)
            .finish()
    }
}

/// What an `auth` message resolves to before any credential check.
enum AuthStep {
    Already(Identity),
    MissingToken,
    Verify(String),
    Ignore,
}

impl SessionManager {
    pub fn new(
        config: RelayConfig,
        context: Arc<SharedContext>,
        registry: SubscriptionRegistry,
        upstream: Arc<dyn UpstreamSource>,
        credentials: Arc<dyn CredentialService>,
        bus: QuoteBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            context,
            registry,
            upstream,
            credentials,
            bus,
            sessions: Mutex::new(FnvHashMap::default()),
            next_id: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    pub fn context(&self) -> &Arc<SharedContext> {
        &self.context
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Register a new connection.
    ///
    /// A valid `auth_hint` authenticates the session immediately without arming the grace
    /// timer; otherwise the client is prompted and has `auth_grace` to authenticate.
    pub async fn open(
        &self,
        transport: Transport,
        auth_hint: Option<String>,
        peer: Option<SmolStr>,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut session = Session::new(id, transport.clone(), peer.clone(), self.config.rate_limit);
        if auth_hint.is_some() {
            session.auth = AuthState::Authenticating { grace: None };
        }

        let total = {
            let mut sessions = self.sessions.lock();
            sessions.insert(id, session);
            sessions.len()
        };
        info!(connection = %id, peer = ?peer, total, "connection opened");

        if let Some(token) = auth_hint {
            if let Verification::Valid(identity) = self.credentials.verify_session(&token).await {
                if self.promote(id, identity, true) {
                    self.send_initial_snapshot(id, &transport).await;
                }
                return id;
            }
            debug!(connection = %id, "cookie credential rejected, falling back to manual auth");
        }

        self.prompt_for_auth(id, &transport);
        id
    }

    fn prompt_for_auth(&self, id: ConnectionId, transport: &Transport) {
        reply(
            transport,
            Outbound::AuthRequired {
                message: Some(SmolStr::new_static("Please authenticate to receive data")),
                connection_id: Some(id),
                error: None,
                action: None,
            },
        );

        let manager = self.this.clone();
        let grace = self.config.auth_grace;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(manager) = manager.upgrade() {
                manager.expire_grace(id).await;
            }
        });

        // A rejected cookie leaves the session mid check; reset it so the timer can expire it.
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&id) {
            Some(session)
                if matches!(
                    session.auth,
                    AuthState::Unauthenticated { .. } | AuthState::Authenticating { .. }
                ) =>
            {
                session.auth.disarm();
                session.auth = AuthState::Unauthenticated {
                    grace: Some(timer.abort_handle()),
                };
            }
            _ => timer.abort(),
        }
    }

    /// Grace timer expiry; only an unauthenticated session with no credential check in flight
    /// times out.
    async fn expire_grace(&self, id: ConnectionId) {
        let timed_out = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&id) else {
                return;
            };

            match &mut session.auth {
                AuthState::Unauthenticated { .. } => {
                    session.auth = AuthState::TimedOut;
                    reply(
                        &session.transport,
                        Outbound::AuthTimeout {
                            error: SmolStr::new_static(
                                "Authentication timeout - please refresh and login",
                            ),
                        },
                    );
                    session.transport.close(CLOSE_NORMAL, "Authentication timeout");
                    true
                }
                AuthState::Authenticating { grace } => {
                    debug!(connection = %id, "grace timer expired during credential check, deferring");
                    *grace = None;
                    false
                }
                _ => false,
            }
        };

        if timed_out {
            info!(connection = %id, "authentication timeout, closing connection");
            self.remove(id, "authentication timeout").await;
        }
    }

    /// Promote a session to authenticated. Returns `false` if it no longer exists.
    fn promote(&self, id: ConnectionId, identity: Identity, via_cookie: bool) -> bool {
        let forwarder = self.spawn_forwarder(id);
        let timing = self.context.latest_timing();

        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(&id) else {
            forwarder.abort();
            return false;
        };

        session.auth.disarm();
        session.auth = AuthState::Authenticated(identity.clone());
        if let Some(previous) = session.forwarder.replace(forwarder) {
            previous.abort();
        }
        let transport = session.transport.clone();

        let authenticated = sessions.values().filter(|session| session.is_healthy()).count();
        drop(sessions);

        info!(
            connection = %id,
            username = %identity.username,
            is_admin = identity.is_admin,
            via_cookie,
            authenticated,
            "connection authenticated"
        );

        let (can_change_ticker, is_solo_user) = if via_cookie {
            (None, None)
        } else {
            (
                Some(identity.is_admin || authenticated == 1),
                Some(authenticated == 1),
            )
        };

        reply(
            &transport,
            Outbound::AuthSuccess {
                is_admin: identity.is_admin,
                username: identity.username,
                message: SmolStr::new_static("Authentication successful"),
                can_change_ticker,
                is_solo_user,
            },
        );

        if let Some(TimingSnapshot { timing, timestamp }) = timing {
            reply(&transport, Outbound::EntryTimingUpdate { timing, timestamp });
        }

        self.schedule_presence();
        true
    }

    /// Deliver the shared instrument's snapshot triple to one freshly authenticated session.
    async fn send_initial_snapshot(&self, id: ConnectionId, transport: &Transport) {
        let viewed = self.context.viewed();
        match self.fetch_snapshot(&viewed).await {
            Ok(payloads) => {
                let delivered = self.context.with_current(&viewed, || {
                    payloads
                        .into_iter()
                        .all(|payload| transport.send_shared(payload).is_ok())
                });
                if delivered.is_none() {
                    debug!(connection = %id, "instrument changed before initial snapshot was sent");
                }
            }
            Err(error) => {
                warn!(connection = %id, %error, "initial snapshot fetch failed");
                reply(transport, Outbound::error("Failed to fetch market data"));
            }
        }
    }

    /// Handle one raw inbound text frame.
    pub async fn handle_message(&self, id: ConnectionId, raw: &str) {
        let Some(inbound) = self
            .sessions
            .lock()
            .get(&id)
            .map(|session| Arc::clone(&session.inbound))
        else {
            warn!(connection = %id, "message for unknown connection");
            return;
        };
        let _serial = inbound.lock().await;

        let (transport, authenticated, is_admin, username) = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&id) else {
                return;
            };

            let now = Instant::now();
            session.last_activity = now;
            if let Err(remaining) = session.rate_limiter.check(now) {
                debug!(connection = %id, "message rate limit exceeded");
                reply(
                    &session.transport,
                    Outbound::RateLimitExceeded {
                        error: SmolStr::new_static("Too many messages. Please slow down."),
                        retry_after: remaining.as_millis().div_ceil(1000) as u64,
                    },
                );
                return;
            }

            (
                session.transport.clone(),
                session.is_authenticated(),
                session.is_admin(),
                session.username().cloned().unwrap_or_default(),
            )
        };

        let Some(Inbound { kind, message }) = parse_inbound(raw) else {
            debug!(connection = %id, "unparseable message");
            reply(&transport, Outbound::error("Invalid message format"));
            return;
        };

        let message = match message {
            ClientMessage::Auth { token } => {
                self.authenticate(id, &transport, token).await;
                return;
            }
            other => other,
        };

        if !authenticated {
            reply(
                &transport,
                Outbound::AuthRequired {
                    message: None,
                    connection_id: None,
                    error: Some(SmolStr::new_static("Please authenticate first")),
                    action: Some(kind),
                },
            );
            return;
        }

        match message {
            ClientMessage::Auth { .. } => {}
            ClientMessage::Subscribe { symbol, expiration } => {
                self.change_instrument(&transport, is_admin, username, symbol, expiration);
            }
            ClientMessage::TrackContract(params) => {
                self.track_contract(id, &transport, &params).await;
            }
            ClientMessage::UntrackContract(params) => {
                self.untrack_contract(id, &transport, &params).await;
            }
            ClientMessage::GetQuote(params) => match params.contract() {
                Ok(contract) => reply(
                    &transport,
                    Outbound::QuoteResponse {
                        contract: SmolStr::new(contract.to_string()),
                        quote: self.upstream.current_quote(&contract),
                    },
                ),
                Err(error) => reply(&transport, contract_error(&error)),
            },
            ClientMessage::GetTickerQuotes { root } => {
                let Some(root) = param_text(&root).and_then(|root| parse_symbol(&root).ok())
                else {
                    reply(&transport, Outbound::error("Missing root ticker symbol"));
                    return;
                };
                let quotes = self
                    .upstream
                    .quotes_for_root(&root)
                    .into_iter()
                    .map(|(contract, quote)| TickerQuote {
                        contract: SmolStr::new(contract.to_string()),
                        quote,
                    })
                    .collect::<Vec<_>>();
                reply(
                    &transport,
                    Outbound::TickerQuotesResponse {
                        root,
                        count: quotes.len(),
                        quotes,
                    },
                );
            }
            ClientMessage::GetStockQuote { ticker } => {
                let Some(ticker) = param_text(&ticker).and_then(|ticker| parse_symbol(&ticker).ok())
                else {
                    reply(&transport, Outbound::error("Missing ticker symbol"));
                    return;
                };
                let quote = self.upstream.current_stock_quote(&ticker);
                reply(
                    &transport,
                    Outbound::StockQuote {
                        ticker,
                        price: quote.as_ref().map(|quote| quote.price),
                        quote,
                    },
                );
            }
            ClientMessage::StreamStats => {
                reply(
                    &transport,
                    Outbound::StreamStats {
                        upstream: self.upstream.stats(),
                        user_subscriptions: self.subscription_summary(),
                    },
                );
            }
            ClientMessage::Unsupported => {
                debug!(connection = %id, %kind, "unsupported message type");
                reply(&transport, Outbound::error("Unsupported message type"));
            }
        }
    }

    async fn authenticate(&self, id: ConnectionId, transport: &Transport, token: Option<String>) {
        let step = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&id) else {
                return;
            };

            if let Some(identity) = session.auth.identity() {
                AuthStep::Already(identity.clone())
            } else if matches!(session.auth, AuthState::Rejected | AuthState::TimedOut) {
                AuthStep::Ignore
            } else {
                match token.filter(|token| !token.is_empty()) {
                    None => AuthStep::MissingToken,
                    Some(token) => {
                        if let AuthState::Unauthenticated { grace } = &mut session.auth {
                            let grace = grace.take();
                            session.auth = AuthState::Authenticating { grace };
                        }
                        AuthStep::Verify(token)
                    }
                }
            }
        };

        let token = match step {
            AuthStep::Already(identity) => {
                reply(
                    transport,
                    Outbound::AuthSuccess {
                        is_admin: identity.is_admin,
                        username: identity.username,
                        message: SmolStr::new_static("Already authenticated"),
                        can_change_ticker: None,
                        is_solo_user: None,
                    },
                );
                return;
            }
            AuthStep::MissingToken => {
                reply(
                    transport,
                    Outbound::AuthFailed {
                        error: SmolStr::new_static("Missing authentication token"),
                    },
                );
                return;
            }
            AuthStep::Ignore => return,
            AuthStep::Verify(token) => token,
        };

        match self.credentials.verify_session(&token).await {
            Verification::Valid(identity) => {
                if self.promote(id, identity, false) {
                    self.send_initial_snapshot(id, transport).await;
                }
            }
            Verification::Invalid => self.reject(id, transport),
        }
    }

    fn reject(&self, id: ConnectionId, transport: &Transport) {
        {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&id) else {
                return;
            };
            session.auth.disarm();
            session.auth = AuthState::Rejected;
        }

        info!(connection = %id, "authentication failed");
        reply(
            transport,
            Outbound::AuthFailed {
                error: SmolStr::new_static("Invalid or expired session token"),
            },
        );

        let manager = self.this.clone();
        let delay = self.config.failed_auth_close_delay;
        let transport = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            transport.close(CLOSE_NORMAL, "Authentication failed");
            if let Some(manager) = manager.upgrade() {
                manager.remove(id, "authentication failed").await;
            }
        });
    }

    fn change_instrument(
        &self,
        transport: &Transport,
        is_admin: bool,
        username: SmolStr,
        symbol: Option<Value>,
        expiration: Option<Value>,
    ) {
        if !is_admin && self.authenticated_count() != 1 {
            reply(
                transport,
                Outbound::PermissionDenied {
                    error: SmolStr::new_static(PERMISSION_DENIED),
                    is_admin: false,
                    is_solo_user: false,
                },
            );
            return;
        }

        let symbol = match symbol {
            Some(Value::String(symbol)) => parse_symbol(&symbol).ok(),
            _ => None,
        };
        let Some(symbol) = symbol else {
            reply(transport, Outbound::error("Invalid symbol format"));
            return;
        };

        let expiration = match param_text(&expiration).filter(|text| !text.trim().is_empty()) {
            None => default_expiration(),
            Some(text) => match text.parse::<Expiration>() {
                Ok(expiration) => expiration,
                Err(_) => {
                    reply(transport, Outbound::error("Invalid expiration format"));
                    return;
                }
            },
        };

        let next = ViewedInstrument { symbol, expiration };
        let previous = self.context.set_instrument(next, |viewed| {
            let changed = Arc::new(Outbound::TickerChanged {
                symbol: viewed.symbol.clone(),
                expiration: viewed.expiration,
                changed_by: username.clone(),
            });
            self.send_to_healthy(&[changed]);
        });

        info!(
            %previous,
            current = %self.context.viewed(),
            changed_by = %username,
            "shared instrument changed"
        );
    }

    async fn track_contract(&self, id: ConnectionId, transport: &Transport, params: &ContractParams) {
        let contract = match params.contract() {
            Ok(contract) => contract,
            Err(error) => {
                reply(transport, contract_error(&error));
                return;
            }
        };

        let key = InstrumentKey::Option(contract.clone());
        let outcome = self.registry.subscribe(id, key.clone()).await;

        if !outcome.stream_subscribed {
            warn!(connection = %id, instrument = %key, "upstream is not streaming tracked contract");
        }

        reply(
            transport,
            Outbound::ContractTracked {
                success: true,
                contract: key.to_smolstr(),
                subscriber_count: outcome.subscriber_count,
                is_first_subscriber: outcome.is_first_subscriber,
                stream_subscribed: outcome.stream_subscribed,
            },
        );

        if let Some(quote) = self.upstream.current_quote(&contract) {
            reply(
                transport,
                Outbound::OptionsQuote {
                    contract_key: key.to_smolstr(),
                    quote,
                },
            );
        }
    }

    async fn untrack_contract(
        &self,
        id: ConnectionId,
        transport: &Transport,
        params: &ContractParams,
    ) {
        let contract = match params.contract() {
            Ok(contract) => contract,
            Err(error) => {
                reply(transport, contract_error(&error));
                return;
            }
        };

        let key = InstrumentKey::Option(contract);
        let message = match self.registry.unsubscribe(id, &key).await {
            Ok(outcome) => Outbound::ContractUntracked {
                success: true,
                contract: key.to_smolstr(),
                subscriber_count: outcome.subscriber_count,
                is_last_subscriber: outcome.is_last_subscriber,
                stream_unsubscribed: outcome.stream_unsubscribed,
                error: None,
            },
            Err(error) => {
                let reason = match error {
                    RegistryError::UnknownInstrument(_) => "Not subscribed to this contract",
                    RegistryError::NotSubscribed(_) => "User not subscribed to this contract",
                };
                Outbound::ContractUntracked {
                    success: false,
                    contract: key.to_smolstr(),
                    subscriber_count: self.registry.subscriber_count(&key),
                    is_last_subscriber: false,
                    stream_unsubscribed: false,
                    error: Some(SmolStr::new_static(reason)),
                }
            }
        };

        reply(transport, message);
    }

    fn subscription_summary(&self) -> SubscriptionSummary {
        let stats = self.registry.stats();
        let avg_per_contract = if stats.total_instruments == 0 {
            Decimal::ZERO
        } else {
            (Decimal::from(stats.total_memberships) / Decimal::from(stats.total_instruments))
                .round_dp(1)
        };

        SubscriptionSummary {
            total_contracts: stats.total_instruments,
            total_subscriptions: stats.total_memberships,
            avg_per_contract,
        }
    }

    /// Transport level close reported by the front end.
    pub async fn close(&self, id: ConnectionId) {
        if let Some(session) = self.sessions.lock().get(&id) {
            session.transport.mark_closed();
        }
        self.remove(id, "connection closed").await;
    }

    /// Release every subscription `id` holds, then discard the session.
    ///
    /// Waits for any in-flight message of the session so a concurrent `track_contract` cannot
    /// add a membership after the release.
    async fn remove(&self, id: ConnectionId, cause: &'static str) -> bool {
        let Some(inbound) = self
            .sessions
            .lock()
            .get(&id)
            .map(|session| Arc::clone(&session.inbound))
        else {
            return false;
        };
        let _serial = inbound.lock().await;

        let released = self.registry.release_all(id).await;

        let Some(mut session) = self.sessions.lock().remove(&id) else {
            return false;
        };
        session.shutdown_tasks();

        info!(
            connection = %id,
            username = ?session.username(),
            was_authenticated = session.is_authenticated(),
            age_secs = session.age(Instant::now()).as_secs(),
            released = released.len(),
            cause,
            remaining = self.session_count(),
            "connection removed"
        );

        self.schedule_presence();
        true
    }

    /// One reaper sweep. Authenticated sessions with an open transport are never removed.
    pub async fn reap(&self) -> Vec<(ConnectionId, ReapReason)> {
        let now = Instant::now();
        let doomed = self
            .sessions
            .lock()
            .values()
            .filter_map(|session| {
                reap_reason(session, now, &self.config).map(|reason| (session.id, reason))
            })
            .collect::<Vec<_>>();

        let mut reaped = Vec::with_capacity(doomed.len());
        for (id, reason) in doomed {
            if self.remove(id, reason.label()).await {
                reaped.push((id, reason));
            }
        }

        if !reaped.is_empty() {
            info!(reaped = reaped.len(), "reaper removed zombie connections");
        }
        reaped
    }

    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.reaper_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let sweep = Arc::clone(&manager);
                if let Err(error) = tokio::spawn(async move { sweep.reap().await }).await {
                    error!(%error, "reaper sweep panicked");
                }
            }
        })
    }

    /// Fetch the shared instrument's payloads and send them to every authenticated session
    /// with an open transport.
    pub async fn broadcast_snapshot(&self) -> BroadcastOutcome {
        if self.context.is_paused() {
            return BroadcastOutcome::Paused;
        }
        if self.authenticated_count() == 0 {
            return BroadcastOutcome::NoAudience;
        }

        let viewed = self.context.viewed();
        let payloads = match self.fetch_snapshot(&viewed).await {
            Ok(payloads) => payloads,
            Err(error) => {
                warn!(instrument = %viewed, %error, "snapshot fetch failed, skipping cycle");
                return BroadcastOutcome::UpstreamFailed;
            }
        };

        match self
            .context
            .with_current(&viewed, || self.send_to_healthy(&payloads))
        {
            Some((recipients, failures)) => {
                if failures > 0 {
                    warn!(instrument = %viewed, recipients, failures, "broadcast had send failures");
                }
                BroadcastOutcome::Sent {
                    recipients,
                    failures,
                }
            }
            None => {
                debug!(instrument = %viewed, "instrument changed during fetch, discarding snapshot");
                BroadcastOutcome::Stale
            }
        }
    }

    async fn fetch_snapshot(
        &self,
        viewed: &ViewedInstrument,
    ) -> Result<[Arc<Outbound>; 3], UpstreamError> {
        let (expirations, chain, stock) = tokio::join!(
            self.upstream.expirations(&viewed.symbol),
            self.upstream.options_chain(&viewed.symbol, viewed.expiration),
            self.upstream.stock_quote(&viewed.symbol),
        );

        Ok([
            Arc::new(Outbound::Expirations {
                response: expirations?,
            }),
            Arc::new(Outbound::Options { response: chain? }),
            Arc::new(Outbound::Stock { response: stock? }),
        ])
    }

    /// Send `messages` to every healthy session, returning `(recipients, failures)`.
    ///
    /// A failed send is logged and the session left for the reaper.
    fn send_to_healthy(&self, messages: &[Arc<Outbound>]) -> (usize, usize) {
        let sessions = self.sessions.lock();
        let mut recipients = 0;
        let mut failures = 0;

        for session in sessions.values().filter(|session| session.is_healthy()) {
            recipients += 1;
            for message in messages {
                if let Err(error) = session.transport.send_shared(Arc::clone(message)) {
                    failures += 1;
                    debug!(connection = %session.id, %error, kind = message.kind(), "broadcast send failed");
                    break;
                }
            }
        }

        (recipients, failures)
    }

    /// Send `online_users` to every healthy session, plus `active_users` to admins.
    pub fn broadcast_online_users(&self) -> usize {
        let sessions = self.sessions.lock();
        let healthy = sessions
            .values()
            .filter(|session| session.is_healthy())
            .collect::<Vec<_>>();

        let users = healthy
            .iter()
            .filter_map(|session| session.auth.identity())
            .map(|identity| OnlineUser {
                username: identity.username.clone(),
                is_admin: identity.is_admin,
                user_id: Some(identity.user_id.clone()),
                ip: None,
            })
            .collect::<Vec<_>>();

        let admins = healthy
            .iter()
            .filter(|session| session.is_admin())
            .filter_map(|session| {
                session.username().map(|username| OnlineUser {
                    username: username.clone(),
                    is_admin: true,
                    user_id: None,
                    ip: Some(session.peer.clone().unwrap_or_else(|| SmolStr::new_static("unknown"))),
                })
            })
            .collect::<Vec<_>>();

        let count = users.len();
        let online = |can_change_ticker| {
            Arc::new(Outbound::OnlineUsers {
                users: users.clone(),
                count,
                can_change_ticker,
                is_solo_user: count == 1,
            })
        };
        let for_admins = online(true);
        let for_users = online(count == 1);
        let active = Arc::new(Outbound::ActiveUsers {
            count: admins.len(),
            users: admins,
        });

        for session in &healthy {
            let result = if session.is_admin() {
                session
                    .transport
                    .send_shared(Arc::clone(&for_admins))
                    .and_then(|_| session.transport.send_shared(Arc::clone(&active)))
            } else {
                session.transport.send_shared(Arc::clone(&for_users))
            };
            if let Err(error) = result {
                debug!(connection = %session.id, %error, "online users send failed");
            }
        }

        debug!(count, "broadcast online users");
        count
    }

    fn schedule_presence(&self) {
        let manager = self.this.clone();
        let delay = self.config.presence_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.broadcast_online_users();
            }
        });
    }

    pub fn spawn_presence(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.presence_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if manager.session_count() > 0 {
                    manager.broadcast_online_users();
                }
            }
        })
    }

    /// Periodically log registry occupancy while anything is registered.
    pub fn spawn_stats_logger(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.stats_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.log_subscription_stats();
            }
        })
    }

    fn log_subscription_stats(&self) {
        let stats = self.registry.stats();
        if stats.total_instruments == 0 {
            return;
        }

        let top = stats
            .instruments
            .iter()
            .take(5)
            .map(|(key, count)| format!("{key} ({count})"))
            .collect::<Vec<_>>()
            .join(", ");

        info!(
            instruments = stats.total_instruments,
            memberships = stats.total_memberships,
            avg_per_instrument = %self.subscription_summary().avg_per_contract,
            top = %top,
            "subscription stats"
        );
    }

    /// Store and fan out an entry timing snapshot from the external timing producer.
    pub fn publish_entry_timing(&self, timing: Value) -> usize {
        let timestamp = Utc::now().timestamp_millis();
        self.context.set_timing(TimingSnapshot {
            timing: timing.clone(),
            timestamp,
        });
        let (recipients, _) =
            self.send_to_healthy(&[Arc::new(Outbound::EntryTimingUpdate { timing, timestamp })]);
        recipients
    }

    /// Quote delivery task: drains the bus and forwards what this session is registered to.
    fn spawn_forwarder(&self, id: ConnectionId) -> AbortHandle {
        let manager = self.this.clone();
        let mut stream = self.bus.stream();

        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(connection = %id, skipped, "quote forwarder lagged");
                        continue;
                    }
                };

                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let Some(transport) = manager.transport(id) else {
                    break;
                };
                if !manager.wants(id, &event) {
                    continue;
                }

                let message = match event {
                    UpstreamEvent::OptionQuote { contract, quote } => Outbound::OptionsQuote {
                        contract_key: SmolStr::new(contract.to_string()),
                        quote,
                    },
                    UpstreamEvent::StockQuote { ticker, quote } => Outbound::StockQuote {
                        ticker,
                        price: Some(quote.price),
                        quote: Some(quote),
                    },
                };

                match transport.send(message) {
                    Ok(()) => {}
                    Err(SendError::Full) => debug!(connection = %id, "quote dropped, outbound queue full"),
                    Err(SendError::NotOpen) => break,
                }
            }
            debug!(connection = %id, "quote forwarder stopped");
        })
        .abort_handle()
    }

    /// Whether session `id` should receive `event`.
    fn wants(&self, id: ConnectionId, event: &UpstreamEvent) -> bool {
        match event {
            UpstreamEvent::OptionQuote { .. } => self.registry.is_member(id, &event.key()),
            UpstreamEvent::StockQuote { ticker, .. } => {
                self.context.viewed().symbol == *ticker || self.registry.has_root(id, ticker)
            }
        }
    }

    fn transport(&self, id: ConnectionId) -> Option<Transport> {
        self.sessions
            .lock()
            .get(&id)
            .map(|session| session.transport.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Sessions that are authenticated with an open transport.
    pub fn authenticated_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|session| session.is_healthy())
            .count()
    }

    pub fn auth_state(&self, id: ConnectionId) -> Option<&'static str> {
        self.sessions.lock().get(&id).map(|session| session.auth.label())
    }

    pub fn has_grace_timer(&self, id: ConnectionId) -> bool {
        self.sessions
            .lock()
            .get(&id)
            .is_some_and(|session| session.auth.has_grace_timer())
    }
}

impl ReportSink for SessionManager {
    fn publish(&self, record: &AnalysisRecord) {
        let (recipients, _) = self.send_to_healthy(&[Arc::new(Outbound::AnalysisComplete {
            result: record.clone(),
        })]);
        debug!(contract = %record.contract, recipients, "analysis result broadcast");
    }
}

/// Which reaper rule, if any, removes `session`.
fn reap_reason(session: &Session, now: Instant, config: &RelayConfig) -> Option<ReapReason> {
    if session.is_healthy() {
        return None;
    }

    let age = session.age(now);
    match session.transport.state() {
        TransportState::Closed if age > config.closed_transport_grace => {
            Some(ReapReason::ClosedTransport)
        }
        _ if !session.is_authenticated() && age > config.unauthenticated_max_age => {
            Some(ReapReason::Unauthenticated)
        }
        TransportState::Closing if age > config.invalid_state_grace => {
            Some(ReapReason::StuckClosing)
        }
        _ => None,
    }
}

fn contract_error(error: &InstrumentError) -> Outbound {
    match error {
        InstrumentError::MissingParameters => Outbound::error("Missing contract parameters"),
        InstrumentError::InvalidSymbol(_) => Outbound::error("Invalid symbol format"),
        other => Outbound::error(&other.to_string()),
    }
}

/// Best effort reply to the connection that sent a message.
fn reply(transport: &Transport, message: Outbound) {
    let kind = message.kind();
    if let Err(error) = transport.send(message) {
        debug!(%error, kind, "reply dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::PauseSwitch,
        transport::Frame,
        upstream::simulated::SimulatedUpstream,
    };
    use tokio::sync::mpsc;

    fn session(transport: Transport, auth: AuthState) -> Session {
        let mut session = Session::new(
            ConnectionId(1),
            transport,
            None,
            RelayConfig::default().rate_limit,
        );
        session.auth = auth;
        session
    }

    fn identity() -> Identity {
        Identity {
            user_id: SmolStr::new("u1"),
            username: SmolStr::new("alice"),
            is_admin: false,
        }
    }

    fn manager(upstream: Arc<SimulatedUpstream>, bus: QuoteBus) -> Arc<SessionManager> {
        let config = RelayConfig::default();
        let context = Arc::new(SharedContext::new(
            config.default_instrument.clone(),
            Arc::new(PauseSwitch::default()),
        ));
        let credentials = crate::auth::StaticCredentials::new()
            .with_token("alice-token", identity())
            .with_token(
                "bob-token",
                Identity {
                    user_id: SmolStr::new("u2"),
                    username: SmolStr::new("bob"),
                    is_admin: false,
                },
            );
        SessionManager::new(
            config,
            context,
            SubscriptionRegistry::new(upstream.clone()),
            upstream,
            Arc::new(credentials),
            bus,
        )
    }

    fn message_kinds(rx: &mut mpsc::Receiver<Frame>) -> Vec<&'static str> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|frame| match frame {
                Frame::Message(message) => message.kind(),
                Frame::Close { .. } => "close",
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_reason() {
        struct TestCase {
            auth: AuthState,
            transport: TransportState,
            age: Duration,
            expected: Option<ReapReason>,
        }

        let tests = vec![
            TestCase {
                // TC0: healthy authenticated session is never reaped
                auth: AuthState::Authenticated(identity()),
                transport: TransportState::Open,
                age: Duration::from_secs(86_400),
                expected: None,
            },
            TestCase {
                // TC1: closed transport inside its grace
                auth: AuthState::Authenticated(identity()),
                transport: TransportState::Closed,
                age: Duration::from_secs(5),
                expected: None,
            },
            TestCase {
                // TC2: closed transport past its grace, regardless of youth
                auth: AuthState::Authenticated(identity()),
                transport: TransportState::Closed,
                age: Duration::from_secs(11),
                expected: Some(ReapReason::ClosedTransport),
            },
            TestCase {
                // TC3: unauthenticated past max age
                auth: AuthState::Unauthenticated { grace: None },
                transport: TransportState::Open,
                age: Duration::from_secs(91),
                expected: Some(ReapReason::Unauthenticated),
            },
            TestCase {
                // TC4: unauthenticated within max age
                auth: AuthState::Unauthenticated { grace: None },
                transport: TransportState::Open,
                age: Duration::from_secs(60),
                expected: None,
            },
            TestCase {
                // TC5: authenticated but stuck closing
                auth: AuthState::Authenticated(identity()),
                transport: TransportState::Closing,
                age: Duration::from_secs(61),
                expected: Some(ReapReason::StuckClosing),
            },
        ];

        let config = RelayConfig::default();
        for (index, test) in tests.into_iter().enumerate() {
            let (transport, _rx) = Transport::channel(4);
            match test.transport {
                TransportState::Open => {}
                TransportState::Closing => transport.close(CLOSE_NORMAL, "test"),
                TransportState::Closed => transport.mark_closed(),
            }
            let session = session(transport, test.auth);
            let now = session.created_at + test.age;

            let actual = reap_reason(&session, now, &config);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[tokio::test]
    async fn test_unparseable_and_gated_messages() {
        let bus = QuoteBus::new(16);
        let upstream = Arc::new(SimulatedUpstream::new(bus.clone()));
        let config = RelayConfig::default();
        let context = Arc::new(SharedContext::new(
            config.default_instrument.clone(),
            Arc::new(PauseSwitch::default()),
        ));
        let manager = SessionManager::new(
            config,
            context,
            SubscriptionRegistry::new(upstream.clone()),
            upstream,
            Arc::new(crate::auth::StaticCredentials::new()),
            bus,
        );

        let (transport, mut rx): (Transport, mpsc::Receiver<Frame>) = Transport::channel(16);
        let id = manager.open(transport, None, None).await;
        assert_eq!(manager.auth_state(id), Some("unauthenticated"));
        assert!(manager.has_grace_timer(id));

        manager.handle_message(id, "not json").await;
        manager
            .handle_message(id, r#"{"type":"stream_stats"}"#)
            .await;

        let kinds = message_kinds(&mut rx);
        assert_eq!(kinds, vec!["auth_required", "error", "auth_required"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_survives_full_transport() {
        let bus = QuoteBus::new(16);
        let upstream = Arc::new(SimulatedUpstream::new(bus.clone()));
        let manager = manager(upstream, bus);

        // auth_success fills the single slot, nothing drains it
        let (stuck, _stuck_rx) = Transport::channel(1);
        manager.open(stuck, Some("alice-token".to_string()), None).await;

        let (healthy, mut healthy_rx) = Transport::channel(256);
        manager.open(healthy, Some("bob-token".to_string()), None).await;
        message_kinds(&mut healthy_rx);

        let outcome = manager.broadcast_snapshot().await;
        assert_eq!(
            outcome,
            BroadcastOutcome::Sent {
                recipients: 2,
                failures: 1
            }
        );

        let delivered = message_kinds(&mut healthy_rx)
            .into_iter()
            .filter(|kind| matches!(*kind, "expirations" | "options" | "stock"))
            .collect::<Vec<_>>();
        assert_eq!(delivered, vec!["expirations", "options", "stock"]);
        assert_eq!(manager.authenticated_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_dropped_when_instrument_changes_mid_fetch() {
        let bus = QuoteBus::new(16);
        let upstream = Arc::new(
            SimulatedUpstream::new(bus.clone()).with_fetch_latency(Duration::from_millis(200)),
        );
        let manager = manager(upstream, bus);

        let (transport, mut rx) = Transport::channel(256);
        manager.open(transport, Some("alice-token".to_string()), None).await;
        message_kinds(&mut rx);

        let broadcast = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.broadcast_snapshot().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.context().set_instrument(
            ViewedInstrument {
                symbol: SmolStr::new("QQQ"),
                expiration: "20251219".parse().unwrap(),
            },
            |_| {},
        );

        assert_eq!(broadcast.await.unwrap(), BroadcastOutcome::Stale);
        let leaked = message_kinds(&mut rx)
            .into_iter()
            .filter(|kind| matches!(*kind, "expirations" | "options" | "stock"))
            .count();
        assert_eq!(leaked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaped_session_releases_subscriptions() {
        let bus = QuoteBus::new(16);
        let upstream = Arc::new(SimulatedUpstream::new(bus.clone()));
        let manager = manager(upstream.clone(), bus);

        let (transport, _rx) = Transport::channel(256);
        let id = manager
            .open(transport.clone(), Some("alice-token".to_string()), None)
            .await;
        manager
            .handle_message(
                id,
                r#"{"type":"track_contract","root":"SPY","expiration":"20250620","strike":450,"right":"C"}"#,
            )
            .await;

        let keys = manager.registry().keys_for(id);
        assert_eq!(keys.len(), 1);
        let key = keys[0].clone();
        assert!(manager.registry().contains(&key));

        transport.mark_closed();
        assert!(manager.reap().await.is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        let reaped = manager.reap().await;

        assert_eq!(reaped, vec![(id, ReapReason::ClosedTransport)]);
        assert_eq!(upstream.unsubscribe_calls(&key), 1);
        assert!(!manager.registry().contains(&key));
        assert_eq!(manager.session_count(), 0);
    }
}
