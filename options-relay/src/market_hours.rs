use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::{America::New_York, Tz};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Minute of day the regular session opens (09:30 ET).
const REGULAR_OPEN_MINUTE: u32 = 9 * 60 + 30;

/// Minute of day the regular session closes (16:00 ET).
const REGULAR_CLOSE_MINUTE: u32 = 16 * 60;

/// Hour the upstream maintenance window ends (04:00 ET).
const MAINTENANCE_END_HOUR: u32 = 4;

/// Source of wall clock time, injectable so time of day behaviour is testable.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Copy, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Exchange local time.
pub fn eastern(now: DateTime<Utc>) -> DateTime<Tz> {
    now.with_timezone(&New_York)
}

/// Daily 00:00 - 04:00 ET window in which upstream data is end of day only.
pub fn in_maintenance_window(now: DateTime<Utc>) -> bool {
    eastern(now).hour() < MAINTENANCE_END_HOUR
}

/// Exchange session a moment falls into.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketSession {
    PreMarket,  // before 09:30 ET
    Regular,    // 09:30 - 16:00 ET
    AfterHours, // after 16:00 ET
    Weekend,
}

impl MarketSession {
    pub fn at(now: DateTime<Utc>) -> Self {
        let local = eastern(now);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return MarketSession::Weekend;
        }

        match minute_of_day(&local) {
            minute if minute < REGULAR_OPEN_MINUTE => MarketSession::PreMarket,
            minute if minute < REGULAR_CLOSE_MINUTE => MarketSession::Regular,
            _ => MarketSession::AfterHours,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MarketSession::PreMarket => "PRE-MARKET",
            MarketSession::Regular => "REGULAR",
            MarketSession::AfterHours => "AFTER-HOURS",
            MarketSession::Weekend => "WEEKEND",
        }
    }

    pub fn is_open(&self) -> bool {
        *self == MarketSession::Regular
    }
}

/// Minutes since local midnight.
pub fn minute_of_day<T: Timelike>(time: &T) -> u32 {
    time.hour() * 60 + time.minute()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_in_maintenance_window() {
        struct TestCase {
            input: DateTime<Utc>,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: 00:30 EDT (04:30 UTC in summer)
                input: utc(2025, 6, 18, 4, 30),
                expected: true,
            },
            TestCase {
                // TC1: 03:59 EST (08:59 UTC in winter)
                input: utc(2025, 1, 15, 8, 59),
                expected: true,
            },
            TestCase {
                // TC2: 04:00 EST is outside
                input: utc(2025, 1, 15, 9, 0),
                expected: false,
            },
            TestCase {
                // TC3: 02:00 UTC is 22:00 EDT the previous day, outside
                input: utc(2025, 6, 18, 2, 0),
                expected: false,
            },
            TestCase {
                // TC4: midday
                input: utc(2025, 6, 18, 16, 0),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = in_maintenance_window(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_market_session_at() {
        struct TestCase {
            input: DateTime<Utc>,
            expected: MarketSession,
        }

        let tests = vec![
            TestCase {
                // TC0: 09:29 EDT Wednesday
                input: utc(2025, 6, 18, 13, 29),
                expected: MarketSession::PreMarket,
            },
            TestCase {
                // TC1: 09:30 EDT Wednesday
                input: utc(2025, 6, 18, 13, 30),
                expected: MarketSession::Regular,
            },
            TestCase {
                // TC2: 15:59 EST Wednesday
                input: utc(2025, 1, 15, 20, 59),
                expected: MarketSession::Regular,
            },
            TestCase {
                // TC3: 16:00 EST Wednesday
                input: utc(2025, 1, 15, 21, 0),
                expected: MarketSession::AfterHours,
            },
            TestCase {
                // TC4: Saturday midday
                input: utc(2025, 6, 21, 16, 0),
                expected: MarketSession::Weekend,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = MarketSession::at(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(utc(2025, 6, 18, 16, 0));
        assert!(MarketSession::at(clock.now()).is_open());

        clock.set(utc(2025, 6, 18, 5, 0));
        assert!(in_maintenance_window(clock.now()));
    }
}
