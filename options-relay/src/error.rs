use crate::instrument::InstrumentKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `options-relay`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelayError {
    #[error("upstream: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("instrument: {0}")]
    Instrument(#[from] InstrumentError),

    #[error("analysis: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

/// Failures reported by an [`UpstreamSource`](crate::upstream::UpstreamSource).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum UpstreamError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("HTTP {status} from {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("failed to parse upstream payload: {0}")]
    Parse(String),

    #[error("no data available for {0}")]
    NoData(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("upstream unavailable")]
    Unavailable,
}

impl UpstreamError {
    /// Determine if the error is expected to clear on its own by the next polling cycle.
    ///
    /// Server side 5xx responses, network failures and an unconnected stream are transient.
    /// Malformed payloads and client side 4xx responses are not.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Http(_) => true,
            UpstreamError::Status { status, .. } => *status >= 500 || *status == 429,
            UpstreamError::NoData(_) => true,
            UpstreamError::Stream(_) => true,
            UpstreamError::Unavailable => true,
            UpstreamError::Parse(_) => false,
        }
    }
}

/// Bookkeeping failures of the [`SubscriptionRegistry`](crate::registry::SubscriptionRegistry).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Error)]
pub enum RegistryError {
    #[error("no subscription exists for {0}")]
    UnknownInstrument(InstrumentKey),

    #[error("connection is not subscribed to {0}")]
    NotSubscribed(InstrumentKey),
}

/// Failures parsing an [`InstrumentKey`] from client or upstream input.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum InstrumentError {
    #[error("missing contract parameters")]
    MissingParameters,

    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("invalid expiration: {0:?}")]
    InvalidExpiration(String),

    #[error("invalid strike: {0:?}")]
    InvalidStrike(String),

    #[error("invalid option right: {0:?}")]
    InvalidRight(String),
}

/// Failures while running a signal analysis job.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum AnalysisError {
    #[error("scoring failed: {0}")]
    Scoring(String),

    #[error("analysis task aborted: {0}")]
    Aborted(String),
}

/// Invalid configuration values.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_error_is_transient() {
        struct TestCase {
            input: UpstreamError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: network failure is transient
                input: UpstreamError::Http("connection refused".to_string()),
                expected: true,
            },
            TestCase {
                // TC1: server side status is transient
                input: UpstreamError::Status {
                    endpoint: "/v2/list/expirations".to_string(),
                    status: 503,
                },
                expected: true,
            },
            TestCase {
                // TC2: client side status is not transient
                input: UpstreamError::Status {
                    endpoint: "/v2/list/expirations".to_string(),
                    status: 404,
                },
                expected: false,
            },
            TestCase {
                // TC3: rate limited is transient
                input: UpstreamError::Status {
                    endpoint: "/v2/snapshot/stock/quote".to_string(),
                    status: 429,
                },
                expected: true,
            },
            TestCase {
                // TC4: malformed payload is not transient
                input: UpstreamError::Parse("expected array".to_string()),
                expected: false,
            },
            TestCase {
                // TC5: stream not connected is transient
                input: UpstreamError::Unavailable,
                expected: true,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_transient();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_relay_error_from_conversions() {
        let error = RelayError::from(UpstreamError::Unavailable);
        assert_eq!(error.to_string(), "upstream: upstream unavailable");

        let error = RelayError::from(InstrumentError::MissingParameters);
        assert_eq!(error.to_string(), "instrument: missing contract parameters");
    }
}
