use async_trait::async_trait;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;

/// Name of the cookie carrying a session token.
pub const SESSION_COOKIE: &str = "sessionToken";

/// Authenticated user behind a session.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: SmolStr,
    pub username: SmolStr,
    #[serde(default)]
    pub is_admin: bool,
}

/// Outcome of a credential check.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Verification {
    Valid(Identity),
    Invalid,
}

/// External service that validates session tokens it issued.
#[async_trait]
pub trait CredentialService: Send + Sync + 'static {
    async fn verify_session(&self, token: &str) -> Verification;
}

/// Fixed token table, loaded from JSON of the form `{ "<token>": { "userId", "username", "isAdmin" } }`.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    tokens: FnvHashMap<SmolStr, Identity>,
    latency: Duration,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let tokens = serde_json::from_str::<FnvHashMap<SmolStr, Identity>>(json)?;
        Ok(Self {
            tokens,
            latency: Duration::ZERO,
        })
    }

    pub fn with_token(mut self, token: &str, identity: Identity) -> Self {
        self.tokens.insert(SmolStr::new(token), identity);
        self
    }

    /// Delay every verification, mimicking a remote credential store.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl CredentialService for StaticCredentials {
    async fn verify_session(&self, token: &str) -> Verification {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.tokens.get(token) {
            Some(identity) => Verification::Valid(identity.clone()),
            None => Verification::Invalid,
        }
    }
}

/// Extract the session token from a raw `Cookie` header value.
pub fn session_token_from_cookie(header: &str) -> Option<&str> {
    header.split(';').find_map(|cookie| {
        let (name, value) = cookie.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then_some(value)
    })
}
