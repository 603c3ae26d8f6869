use super::{Action, Confidence, Decision, TradeSignal};
use crate::{
    error::AnalysisError,
    instrument::OptionRight,
    market_hours::eastern,
    upstream::{Bar, StockQuote},
};
use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Bars averaged for the recent volume figure.
const RECENT_VOLUME_BARS: usize = 5;

/// Recent volume above this multiple of the window average counts as a spike.
const VOLUME_SPIKE_RATIO: Decimal = Decimal::from_parts(15, 0, 0, false, 1);

/// Underlying price context a signal is scored against.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PriceContext {
    pub current: Decimal,
    /// Percentage move across the window.
    pub momentum: Decimal,
    pub volume_spike: bool,
    pub avg_volume: Option<Decimal>,
    /// Lowest low and highest high across the window.
    pub range: Option<(Decimal, Decimal)>,
}

impl PriceContext {
    /// Context from a live quote; without history the move is taken as flat.
    pub fn from_stock_quote(quote: &StockQuote) -> Self {
        Self {
            current: quote.price,
            momentum: Decimal::ZERO,
            volume_spike: false,
            avg_volume: None,
            range: None,
        }
    }

    /// Context from oldest first one minute bars, `None` if there are none to use.
    pub fn from_bars(bars: &[Bar]) -> Option<Self> {
        let (first, last) = (bars.first()?, bars.last()?);
        if first.close.is_zero() {
            return None;
        }

        let momentum = (last.close - first.close) / first.close * Decimal::ONE_HUNDRED;

        let total_volume = bars.iter().map(|bar| Decimal::from(bar.volume)).sum::<Decimal>();
        let avg_volume = total_volume / Decimal::from(bars.len());
        let recent_volume = bars
            .iter()
            .rev()
            .take(RECENT_VOLUME_BARS)
            .map(|bar| Decimal::from(bar.volume))
            .sum::<Decimal>()
            / Decimal::from(RECENT_VOLUME_BARS);

        let low = bars.iter().map(|bar| bar.low).min()?;
        let high = bars.iter().map(|bar| bar.high).max()?;

        Some(Self {
            current: last.close,
            momentum: momentum.round_dp(4),
            volume_spike: recent_volume > avg_volume * VOLUME_SPIKE_RATIO,
            avg_volume: Some(avg_volume.round_dp(2)),
            range: Some((low, high)),
        })
    }
}

/// Everything a [`Scorer`] may look at.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInput<'a> {
    pub signal: &'a TradeSignal,
    pub context: Option<&'a PriceContext>,
    /// The contract already streams live quotes.
    pub already_streaming: bool,
    pub now: DateTime<Utc>,
}

/// Weighted sub scores of one signal; `total` is their sum out of 100.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ScoreBreakdown {
    pub momentum: Decimal,
    pub volume: Decimal,
    pub strike: Decimal,
    pub trader: Decimal,
    pub timing: Decimal,
    pub liquidity: Decimal,
    pub total: Decimal,
}

/// Maps a signal and its context to a [`ScoreBreakdown`].
pub trait Scorer: Send + Sync + 'static {
    fn score(&self, input: &ScoreInput<'_>) -> Result<ScoreBreakdown, AnalysisError>;
}

/// Default six factor scorer.
///
/// | factor    | max | rule                                                        |
/// |-----------|-----|-------------------------------------------------------------|
/// | momentum  | 25  | with trend `min(25, 5·abs(m))`, against `max(0, 10 - abs(m))` |
/// | volume    | 15  | 15 on a volume spike, else 8                                |
/// | strike    | 20  | distance from spot <2% 20, <5% 15, <10% 10, else 5          |
/// | trader    | 15  | priority 1 → 15, 2 → 10, 3 → 7, else 5                      |
/// | timing    | 10  | first/last minutes of the session 2, 10:00-14:59 ET 10, else 7 |
/// | liquidity | 15  | 15 if already streaming, else 8                             |
///
/// Factors without data score a neutral value.
#[derive(Debug, Copy, Clone, Default)]
pub struct CompositeScorer;

impl Scorer for CompositeScorer {
    fn score(&self, input: &ScoreInput<'_>) -> Result<ScoreBreakdown, AnalysisError> {
        let contract = &input.signal.contract;

        let momentum = match input.context {
            Some(context) => momentum_score(contract.right, context.momentum),
            None => Decimal::from(12),
        };

        let volume = match input.context {
            Some(context) if context.volume_spike => Decimal::from(15),
            _ => Decimal::from(8),
        };

        let strike = match input.context {
            Some(context) if !context.current.is_zero() => {
                strike_score((contract.strike - context.current).abs() / context.current)
            }
            _ => Decimal::TEN,
        };

        let trader = Decimal::from(match input.signal.priority {
            Some(1) => 15,
            Some(2) => 10,
            Some(3) => 7,
            _ => 5,
        });

        let timing = timing_score(input.now);

        let liquidity = Decimal::from(if input.already_streaming { 15 } else { 8 });

        let momentum = momentum.round_dp(2);
        let total = momentum + volume + strike + trader + timing + liquidity;
        if total.is_sign_negative() {
            return Err(AnalysisError::Scoring(format!("negative total {total}")));
        }

        Ok(ScoreBreakdown {
            momentum,
            volume,
            strike,
            trader,
            timing,
            liquidity,
            total,
        })
    }
}

fn momentum_score(right: OptionRight, momentum: Decimal) -> Decimal {
    let magnitude = momentum.abs();
    let with_trend = match right {
        OptionRight::Call => momentum > Decimal::ZERO,
        OptionRight::Put => momentum < Decimal::ZERO,
    };

    if with_trend {
        (magnitude * Decimal::from(5)).min(Decimal::from(25))
    } else {
        (Decimal::TEN - magnitude).max(Decimal::ZERO)
    }
}

fn strike_score(distance: Decimal) -> Decimal {
    Decimal::from(match distance {
        distance if distance < Decimal::new(2, 2) => 20,
        distance if distance < Decimal::new(5, 2) => 15,
        distance if distance < Decimal::new(10, 2) => 10,
        _ => 5,
    })
}

fn timing_score(now: DateTime<Utc>) -> Decimal {
    let local = eastern(now);
    Decimal::from(match (local.hour(), local.minute()) {
        (9, minute) if minute < 35 => 2,
        (15, minute) if minute > 50 => 2,
        (10..=14, _) => 10,
        _ => 7,
    })
}

/// Map a total score to a [`Decision`].
pub fn decide(total: Decimal) -> Decision {
    let (action, confidence, reason) = if total >= Decimal::from(75) {
        (Action::Buy, Confidence::High, "Excellent setup - all indicators aligned")
    } else if total >= Decimal::from(60) {
        (Action::Buy, Confidence::Medium, "Good setup - most indicators positive")
    } else if total >= Decimal::from(45) {
        (Action::Watch, Confidence::Low, "Marginal setup - monitor for improvement")
    } else {
        (Action::Skip, Confidence::Low, "Poor setup - multiple red flags")
    };

    Decision {
        action,
        confidence,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::InstrumentKey;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rust_decimal_macros::dec;

    fn signal(key: &str, priority: Option<u8>) -> TradeSignal {
        let contract = match key.parse::<InstrumentKey>().unwrap() {
            InstrumentKey::Option(contract) => contract,
            InstrumentKey::Underlying(_) => panic!("expected option contract"),
        };
        TradeSignal {
            id: None,
            contract,
            trader: None,
            priority,
            price: None,
            received_at: Utc::now(),
        }
    }

    fn bars(closes: &[Decimal], volumes: &[u64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2025, 6, 18, 15, 0, 0).unwrap();
        closes
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(minute, (close, volume))| Bar {
                time: start + ChronoDuration::minutes(minute as i64),
                open: *close,
                high: *close + dec!(0.5),
                low: *close - dec!(0.5),
                close: *close,
                volume: *volume,
            })
            .collect()
    }

    // 12:00 EDT Wednesday
    fn midday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 18, 16, 0, 0).unwrap()
    }

    #[test]
    fn test_price_context_from_bars() {
        let mut closes = vec![dec!(100); 8];
        closes.extend([dec!(101), dec!(102)]);
        let mut volumes = vec![100; 8];
        volumes.extend([1_000, 1_000]);

        let context = PriceContext::from_bars(&bars(&closes, &volumes)).unwrap();

        assert_eq!(context.current, dec!(102));
        assert_eq!(context.momentum, dec!(2));
        // recent (100 * 3 + 2000) / 5 = 460 > 1.5 * (2800 / 10)
        assert!(context.volume_spike);
        assert_eq!(context.range, Some((dec!(99.5), dec!(102.5))));

        assert!(PriceContext::from_bars(&[]).is_none());
    }

    #[test]
    fn test_composite_scorer() {
        struct TestCase {
            signal: TradeSignal,
            context: Option<PriceContext>,
            already_streaming: bool,
            now: DateTime<Utc>,
            expected: ScoreBreakdown,
        }

        let trending_up = PriceContext {
            current: dec!(450),
            momentum: dec!(2),
            volume_spike: true,
            avg_volume: None,
            range: None,
        };

        let tests = vec![
            TestCase {
                // TC0: call with the trend, at the money, elite trader, midday, streaming
                signal: signal("SPY:20250620:450:C", Some(1)),
                context: Some(trending_up.clone()),
                already_streaming: true,
                now: midday(),
                expected: ScoreBreakdown {
                    momentum: dec!(10),
                    volume: dec!(15),
                    strike: dec!(20),
                    trader: dec!(15),
                    timing: dec!(10),
                    liquidity: dec!(15),
                    total: dec!(85),
                },
            },
            TestCase {
                // TC1: put against the trend, 6.7% away from spot, unknown trader
                signal: signal("SPY:20250620:420:P", None),
                context: Some(trending_up),
                already_streaming: false,
                now: midday(),
                expected: ScoreBreakdown {
                    momentum: dec!(8),
                    volume: dec!(15),
                    strike: dec!(10),
                    trader: dec!(5),
                    timing: dec!(10),
                    liquidity: dec!(8),
                    total: dec!(56),
                },
            },
            TestCase {
                // TC2: no price context at 09:31 EDT
                signal: signal("SPY:20250620:450:C", Some(3)),
                context: None,
                already_streaming: false,
                now: Utc.with_ymd_and_hms(2025, 6, 18, 13, 31, 0).unwrap(),
                expected: ScoreBreakdown {
                    momentum: dec!(12),
                    volume: dec!(8),
                    strike: dec!(10),
                    trader: dec!(7),
                    timing: dec!(2),
                    liquidity: dec!(8),
                    total: dec!(47),
                },
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let input = ScoreInput {
                signal: &test.signal,
                context: test.context.as_ref(),
                already_streaming: test.already_streaming,
                now: test.now,
            };
            let actual = CompositeScorer.score(&input).unwrap();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_timing_score() {
        struct TestCase {
            input: DateTime<Utc>,
            expected: Decimal,
        }

        let tests = vec![
            TestCase {
                // TC0: 15:55 EST close
                input: Utc.with_ymd_and_hms(2025, 1, 15, 20, 55, 0).unwrap(),
                expected: dec!(2),
            },
            TestCase {
                // TC1: 14:59 EDT
                input: Utc.with_ymd_and_hms(2025, 6, 18, 18, 59, 0).unwrap(),
                expected: dec!(10),
            },
            TestCase {
                // TC2: 09:40 EDT
                input: Utc.with_ymd_and_hms(2025, 6, 18, 13, 40, 0).unwrap(),
                expected: dec!(7),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(timing_score(test.input), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_decide() {
        struct TestCase {
            input: Decimal,
            expected: (Action, Confidence),
        }

        let tests = vec![
            TestCase {
                // TC0
                input: dec!(75),
                expected: (Action::Buy, Confidence::High),
            },
            TestCase {
                // TC1
                input: dec!(74.99),
                expected: (Action::Buy, Confidence::Medium),
            },
            TestCase {
                // TC2
                input: dec!(45),
                expected: (Action::Watch, Confidence::Low),
            },
            TestCase {
                // TC3
                input: dec!(44),
                expected: (Action::Skip, Confidence::Low),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let decision = decide(test.input);
            assert_eq!(
                (decision.action, decision.confidence),
                test.expected,
                "TC{} failed",
                index
            );
        }
    }

    #[test]
    fn test_momentum_score_caps() {
        assert_eq!(momentum_score(OptionRight::Put, dec!(-8)), dec!(25));
        assert_eq!(momentum_score(OptionRight::Call, dec!(-12)), dec!(0));
    }
}
