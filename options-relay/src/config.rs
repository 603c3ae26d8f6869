use crate::{
    error::ConfigError,
    instrument::{Expiration, ViewedInstrument, parse_symbol},
};
use chrono::NaiveDate;
use smol_str::SmolStr;
use std::{str::FromStr, time::Duration};

/// Per connection inbound message rate limit.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RateLimitConfig {
    /// Messages accepted per window
    pub max_messages: u32,
    /// Length of the counting window
    pub window: Duration,
    /// How long a connection is refused after exceeding the limit
    pub lockout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_messages: 20,
            window: Duration::from_millis(1000),
            lockout: Duration::from_millis(10_000),
        }
    }
}

/// Signal analysis queue limits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AnalysisConfig {
    /// Maximum jobs running at once
    pub max_concurrent: usize,
    /// Soft deadline of a job running alone
    pub base_deadline: Duration,
    /// Added to the deadline when more than one job is running
    pub contention_buffer: Duration,
    /// Historical bar window used when no live quote is streaming
    pub history_window: Duration,
    /// Number of terminal records retained
    pub archive_capacity: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            base_deadline: Duration::from_secs(30),
            contention_buffer: Duration::from_secs(15),
            history_window: Duration::from_secs(30 * 60),
            archive_capacity: 500,
        }
    }
}

/// Runtime configuration of the relay core.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RelayConfig {
    /// Time an unauthenticated session has to present a credential
    pub auth_grace: Duration,
    /// Delay between `auth_failed` and transport closure
    pub failed_auth_close_delay: Duration,
    /// Reaper sweep period
    pub reaper_interval: Duration,
    /// Minimum age before a closed transport is reaped
    pub closed_transport_grace: Duration,
    /// Age after which an unauthenticated session is reaped
    pub unauthenticated_max_age: Duration,
    /// Age after which a session stuck in a closing transport state is reaped
    pub invalid_state_grace: Duration,
    pub rate_limit: RateLimitConfig,
    /// Broadcast period during normal hours
    pub broadcast_period: Duration,
    /// Broadcast period inside the maintenance window
    pub maintenance_period: Duration,
    /// Online users broadcast period
    pub presence_interval: Duration,
    /// Delay before an online users broadcast triggered by a join or leave
    pub presence_delay: Duration,
    /// Subscription statistics log period
    pub stats_interval: Duration,
    /// Outbound frames buffered per connection
    pub outbound_capacity: usize,
    /// Quote bus capacity
    pub bus_capacity: usize,
    pub analysis: AnalysisConfig,
    /// Shared instrument at start up
    pub default_instrument: ViewedInstrument,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            auth_grace: Duration::from_secs(45),
            failed_auth_close_delay: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(5),
            closed_transport_grace: Duration::from_secs(10),
            unauthenticated_max_age: Duration::from_secs(90),
            invalid_state_grace: Duration::from_secs(60),
            rate_limit: RateLimitConfig::default(),
            broadcast_period: Duration::from_secs(1),
            maintenance_period: Duration::from_secs(5),
            presence_interval: Duration::from_secs(5),
            presence_delay: Duration::from_millis(500),
            stats_interval: Duration::from_secs(30),
            outbound_capacity: 256,
            bus_capacity: 4096,
            analysis: AnalysisConfig::default(),
            default_instrument: ViewedInstrument {
                symbol: SmolStr::new_static("SPY"),
                expiration: default_expiration(),
            },
        }
    }
}

/// Expiration assumed when a ticker change omits one.
pub fn default_expiration() -> Expiration {
    Expiration(NaiveDate::from_ymd_opt(2025, 12, 19).unwrap_or_default())
}

impl RelayConfig {
    /// Read overrides from `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides using the provided lookup, starting from [`RelayConfig::default`].
    ///
    /// Durations are expressed in milliseconds.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let millis = |key: &str, target: &mut Duration| -> Result<(), ConfigError> {
            if let Some(value) = parse_var::<u64, _>(&lookup, key)? {
                *target = Duration::from_millis(value);
            }
            Ok(())
        };

        millis("RELAY_AUTH_GRACE_MS", &mut config.auth_grace)?;
        millis(
            "RELAY_FAILED_AUTH_CLOSE_MS",
            &mut config.failed_auth_close_delay,
        )?;
        millis("RELAY_REAPER_INTERVAL_MS", &mut config.reaper_interval)?;
        millis("RELAY_CLOSED_GRACE_MS", &mut config.closed_transport_grace)?;
        millis("RELAY_UNAUTH_MAX_AGE_MS", &mut config.unauthenticated_max_age)?;
        millis("RELAY_INVALID_STATE_GRACE_MS", &mut config.invalid_state_grace)?;
        millis("RELAY_RATE_LIMIT_WINDOW_MS", &mut config.rate_limit.window)?;
        millis("RELAY_RATE_LIMIT_LOCKOUT_MS", &mut config.rate_limit.lockout)?;
        millis("RELAY_BROADCAST_MS", &mut config.broadcast_period)?;
        millis("RELAY_MAINTENANCE_BROADCAST_MS", &mut config.maintenance_period)?;
        millis("RELAY_PRESENCE_MS", &mut config.presence_interval)?;
        millis("RELAY_STATS_MS", &mut config.stats_interval)?;
        millis("RELAY_ANALYSIS_BASE_MS", &mut config.analysis.base_deadline)?;
        millis("RELAY_ANALYSIS_BUFFER_MS", &mut config.analysis.contention_buffer)?;
        millis("RELAY_ANALYSIS_WINDOW_MS", &mut config.analysis.history_window)?;

        if let Some(value) = parse_var(&lookup, "RELAY_RATE_LIMIT_MAX")? {
            config.rate_limit.max_messages = value;
        }
        if let Some(value) = parse_var(&lookup, "RELAY_OUTBOUND_CAPACITY")? {
            config.outbound_capacity = non_zero("RELAY_OUTBOUND_CAPACITY", value)?;
        }
        if let Some(value) = parse_var(&lookup, "RELAY_BUS_CAPACITY")? {
            config.bus_capacity = non_zero("RELAY_BUS_CAPACITY", value)?;
        }
        if let Some(value) = parse_var(&lookup, "RELAY_ANALYSIS_MAX_CONCURRENT")? {
            config.analysis.max_concurrent = non_zero("RELAY_ANALYSIS_MAX_CONCURRENT", value)?;
        }
        if let Some(value) = parse_var(&lookup, "RELAY_ANALYSIS_ARCHIVE")? {
            config.analysis.archive_capacity = value;
        }
        if let Some(value) = lookup("RELAY_DEFAULT_SYMBOL") {
            config.default_instrument.symbol =
                parse_symbol(&value).map_err(|_| invalid("RELAY_DEFAULT_SYMBOL", &value))?;
        }
        if let Some(value) = parse_var(&lookup, "RELAY_DEFAULT_EXPIRATION")? {
            config.default_instrument.expiration = value;
        }

        Ok(config)
    }

    pub fn with_auth_grace(mut self, grace: Duration) -> Self {
        self.auth_grace = grace;
        self
    }

    pub fn with_failed_auth_close_delay(mut self, delay: Duration) -> Self {
        self.failed_auth_close_delay = delay;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_broadcast_periods(mut self, normal: Duration, maintenance: Duration) -> Self {
        self.broadcast_period = normal;
        self.maintenance_period = maintenance;
        self
    }

    pub fn with_presence_delay(mut self, delay: Duration) -> Self {
        self.presence_delay = delay;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn with_analysis(mut self, analysis: AnalysisConfig) -> Self {
        self.analysis = analysis;
        self
    }

    pub fn with_default_instrument(mut self, instrument: ViewedInstrument) -> Self {
        self.default_instrument = instrument;
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().parse::<T>().map_err(|_| invalid(key, &value)))
        .transpose()
}

fn non_zero(key: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        Err(invalid(key, "0"))
    } else {
        Ok(value)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars.iter().copied().collect::<HashMap<_, _>>();
        move |key| vars.get(key).map(|value| value.to_string())
    }

    #[test]
    fn test_default_matches_documented_values() {
        let config = RelayConfig::default();

        assert_eq!(config.auth_grace, Duration::from_secs(45));
        assert_eq!(config.reaper_interval, Duration::from_secs(5));
        assert_eq!(config.rate_limit.max_messages, 20);
        assert_eq!(config.analysis.max_concurrent, 3);
        assert_eq!(config.default_instrument.to_string(), "SPY/20251219");
    }

    #[test]
    fn test_from_lookup() {
        struct TestCase {
            vars: Vec<(&'static str, &'static str)>,
            expected: Result<RelayConfig, ConfigError>,
        }

        let tests = vec![
            TestCase {
                // TC0: nothing set yields defaults
                vars: vec![],
                expected: Ok(RelayConfig::default()),
            },
            TestCase {
                // TC1: durations and counts overridden
                vars: vec![
                    ("RELAY_AUTH_GRACE_MS", "5000"),
                    ("RELAY_RATE_LIMIT_MAX", "5"),
                    ("RELAY_ANALYSIS_MAX_CONCURRENT", "2"),
                ],
                expected: Ok(RelayConfig {
                    auth_grace: Duration::from_secs(5),
                    rate_limit: RateLimitConfig {
                        max_messages: 5,
                        ..RateLimitConfig::default()
                    },
                    analysis: AnalysisConfig {
                        max_concurrent: 2,
                        ..AnalysisConfig::default()
                    },
                    ..RelayConfig::default()
                }),
            },
            TestCase {
                // TC2: shared instrument overridden
                vars: vec![
                    ("RELAY_DEFAULT_SYMBOL", "qqq"),
                    ("RELAY_DEFAULT_EXPIRATION", "2026-01-16"),
                ],
                expected: Ok(RelayConfig::default().with_default_instrument(ViewedInstrument {
                    symbol: SmolStr::new("QQQ"),
                    expiration: "20260116".parse().unwrap(),
                })),
            },
            TestCase {
                // TC3: unparsable duration
                vars: vec![("RELAY_BROADCAST_MS", "fast")],
                expected: Err(ConfigError::InvalidValue {
                    key: "RELAY_BROADCAST_MS".to_string(),
                    value: "fast".to_string(),
                }),
            },
            TestCase {
                // TC4: zero capacity rejected
                vars: vec![("RELAY_BUS_CAPACITY", "0")],
                expected: Err(ConfigError::InvalidValue {
                    key: "RELAY_BUS_CAPACITY".to_string(),
                    value: "0".to_string(),
                }),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = RelayConfig::from_lookup(lookup(&test.vars));
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
