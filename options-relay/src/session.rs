use crate::{
    auth::Identity,
    config::RateLimitConfig,
    transport::{Transport, TransportState},
};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::{task::AbortHandle, time::Instant};

/// Opaque, monotonically assigned connection identifier.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Display,
    From,
    Deserialize,
    Serialize,
)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

/// Authentication state machine of one session.
///
/// ```text
/// Unauthenticated -> Authenticating -> Authenticated
///        |                  |--------> Rejected
///        |------------------+--------> TimedOut (only from Unauthenticated)
/// ```
///
/// The grace timer handle lives inside the unauthenticated states, so an authenticated session
/// cannot hold one.
#[derive(Debug)]
pub enum AuthState {
    Unauthenticated { grace: Option<AbortHandle> },
    /// A credential check is in flight; the grace timer defers to its result.
    Authenticating { grace: Option<AbortHandle> },
    Authenticated(Identity),
    Rejected,
    TimedOut,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated(_))
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            AuthState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn has_grace_timer(&self) -> bool {
        matches!(
            self,
            AuthState::Unauthenticated { grace: Some(_) } | AuthState::Authenticating { grace: Some(_) }
        )
    }

    /// Abort and forget the grace timer, if armed.
    pub fn disarm(&mut self) {
        if let AuthState::Unauthenticated { grace } | AuthState::Authenticating { grace } = self {
            if let Some(handle) = grace.take() {
                handle.abort();
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuthState::Unauthenticated { .. } => "unauthenticated",
            AuthState::Authenticating { .. } => "authenticating",
            AuthState::Authenticated(_) => "authenticated",
            AuthState::Rejected => "rejected",
            AuthState::TimedOut => "timed_out",
        }
    }
}

/// Fixed window message counter with a lockout once the window limit is exceeded.
#[derive(Debug, Clone)]
pub struct MessageRateLimiter {
    config: RateLimitConfig,
    window_start: Option<Instant>,
    count: u32,
    locked_until: Option<Instant>,
}

impl MessageRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window_start: None,
            count: 0,
            locked_until: None,
        }
    }

    /// Count one message at `now`, returning the remaining lockout if it must be dropped.
    pub fn check(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(until) = self.locked_until {
            if until > now {
                return Err(until - now);
            }
            self.locked_until = None;
            self.window_start = None;
        }

        match self.window_start {
            Some(start) if now.duration_since(start) <= self.config.window => {
                self.count += 1;
            }
            _ => {
                self.window_start = Some(now);
                self.count = 1;
            }
        }

        if self.count > self.config.max_messages {
            self.locked_until = Some(now + self.config.lockout);
            Err(self.config.lockout)
        } else {
            Ok(())
        }
    }
}

/// Per connection state owned by the [`SessionManager`](crate::manager::SessionManager).
#[derive(Debug)]
pub struct Session {
    pub id: ConnectionId,
    pub transport: Transport,
    pub auth: AuthState,
    pub peer: Option<SmolStr>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub rate_limiter: MessageRateLimiter,
    /// Quote delivery task, present once authenticated.
    pub forwarder: Option<AbortHandle>,
    /// Serialises inbound message handling for this connection.
    pub inbound: Arc<tokio::sync::Mutex<()>>,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        transport: Transport,
        peer: Option<SmolStr>,
        rate_limit: RateLimitConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            transport,
            auth: AuthState::Unauthenticated { grace: None },
            peer,
            created_at: now,
            last_activity: now,
            rate_limiter: MessageRateLimiter::new(rate_limit),
            forwarder: None,
            inbound: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    /// Authenticated with an open transport; the only sessions that receive broadcasts.
    pub fn is_healthy(&self) -> bool {
        self.is_authenticated() && self.transport.state() == TransportState::Open
    }

    pub fn is_admin(&self) -> bool {
        self.auth.identity().is_some_and(|identity| identity.is_admin)
    }

    pub fn username(&self) -> Option<&SmolStr> {
        self.auth.identity().map(|identity| &identity.username)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Stop every background task bound to this session.
    pub fn shutdown_tasks(&mut self) {
        self.auth.disarm();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> MessageRateLimiter {
        MessageRateLimiter::new(RateLimitConfig {
            max_messages: 3,
            window: Duration::from_millis(1000),
            lockout: Duration::from_millis(10_000),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_locks_out_after_limit() {
        let mut limiter = limiter();
        let start = Instant::now();

        for _ in 0..3 {
            assert_eq!(limiter.check(start), Ok(()));
        }
        assert_eq!(limiter.check(start), Err(Duration::from_secs(10)));

        // Still locked out part way through
        let later = start + Duration::from_secs(4);
        assert_eq!(limiter.check(later), Err(Duration::from_secs(6)));

        // Lockout expired
        let after = start + Duration::from_secs(11);
        assert_eq!(limiter.check(after), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_window_resets() {
        let mut limiter = limiter();
        let start = Instant::now();

        for _ in 0..3 {
            assert_eq!(limiter.check(start), Ok(()));
        }

        let next_window = start + Duration::from_millis(1001);
        for _ in 0..3 {
            assert_eq!(limiter.check(next_window), Ok(()));
        }
    }

    #[tokio::test]
    async fn test_disarm_aborts_grace_timer() {
        let timer = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let mut state = AuthState::Unauthenticated {
            grace: Some(timer.abort_handle()),
        };
        assert!(state.has_grace_timer());

        state.disarm();

        assert!(!state.has_grace_timer());
        assert!(timer.await.unwrap_err().is_cancelled());
    }
}
