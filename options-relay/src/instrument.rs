use crate::error::InstrumentError;
use chrono::{Datelike, NaiveDate};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};
use std::{fmt, str::FromStr};

/// Maximum length of an uppercase root or ticker symbol.
const MAX_SYMBOL_LEN: usize = 10;

/// Normalise a client supplied root or ticker symbol (eg/ " spy " -> "SPY").
pub fn parse_symbol(raw: &str) -> Result<SmolStr, InstrumentError> {
    let symbol = raw.trim();
    let valid = !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.');

    if valid {
        Ok(SmolStr::new(symbol.to_ascii_uppercase()))
    } else {
        Err(InstrumentError::InvalidSymbol(raw.to_string()))
    }
}

/// Option expiration date, rendered as `YYYYMMDD`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Display)]
#[display("{}", _0.format("%Y%m%d"))]
pub struct Expiration(pub NaiveDate);

impl Expiration {
    /// Integer form used by upstream wire formats (eg/ 20251219).
    pub fn as_u32(&self) -> u32 {
        self.0.year() as u32 * 10_000 + self.0.month() * 100 + self.0.day()
    }
}

impl FromStr for Expiration {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        NaiveDate::parse_from_str(trimmed, "%Y%m%d")
            .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y-%m-%d"))
            .map(Expiration)
            .map_err(|_| InstrumentError::InvalidExpiration(s.to_string()))
    }
}

impl Serialize for Expiration {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Expiration {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = de_str_or_number(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Call or put side of an [`OptionContract`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    /// Long form used by upstream stream requests.
    pub fn as_long_str(&self) -> &'static str {
        match self {
            OptionRight::Call => "CALL",
            OptionRight::Put => "PUT",
        }
    }
}

impl fmt::Display for OptionRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OptionRight::Call => "C",
            OptionRight::Put => "P",
        })
    }
}

impl FromStr for OptionRight {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "C" | "CALL" => Ok(OptionRight::Call),
            "P" | "PUT" => Ok(OptionRight::Put),
            _ => Err(InstrumentError::InvalidRight(s.to_string())),
        }
    }
}

impl Serialize for OptionRight {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OptionRight {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Fully specified option contract.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OptionContract {
    pub root: SmolStr,
    pub expiration: Expiration,
    pub strike: Decimal,
    pub right: OptionRight,
}

impl OptionContract {
    /// Construct a contract, normalising the strike so `450`, `450.0` and `450.00` share a key.
    pub fn new(
        root: SmolStr,
        expiration: Expiration,
        strike: Decimal,
        right: OptionRight,
    ) -> Result<Self, InstrumentError> {
        if strike <= Decimal::ZERO {
            return Err(InstrumentError::InvalidStrike(strike.to_string()));
        }

        Ok(Self {
            root,
            expiration,
            strike: strike.normalize(),
            right,
        })
    }

    /// Parse the four loosely typed parameters clients send in `track_contract` style messages.
    pub fn parse(
        root: &str,
        expiration: &str,
        strike: &str,
        right: &str,
    ) -> Result<Self, InstrumentError> {
        if [root, expiration, strike, right]
            .iter()
            .any(|part| part.trim().is_empty())
        {
            return Err(InstrumentError::MissingParameters);
        }

        let strike = Decimal::from_str(strike.trim())
            .map_err(|_| InstrumentError::InvalidStrike(strike.to_string()))?;

        Self::new(
            parse_symbol(root)?,
            expiration.parse()?,
            strike,
            right.parse()?,
        )
    }
}

impl fmt::Display for OptionContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.root, self.expiration, self.strike, self.right
        )
    }
}

/// Canonical key identifying a stream the upstream can deliver.
///
/// Text form is `ROOT:YYYYMMDD:STRIKE:RIGHT` for option contracts and the bare ticker for
/// underlyings (eg/ `SPY:20250620:450:C`, `SPY`).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum InstrumentKey {
    Option(OptionContract),
    Underlying(SmolStr),
}

impl InstrumentKey {
    /// Root symbol of an option contract, or the ticker of an underlying.
    pub fn root(&self) -> &SmolStr {
        match self {
            InstrumentKey::Option(contract) => &contract.root,
            InstrumentKey::Underlying(ticker) => ticker,
        }
    }

    pub fn as_contract(&self) -> Option<&OptionContract> {
        match self {
            InstrumentKey::Option(contract) => Some(contract),
            InstrumentKey::Underlying(_) => None,
        }
    }

    pub fn to_smolstr(&self) -> SmolStr {
        format_smolstr!("{self}")
    }
}

impl From<OptionContract> for InstrumentKey {
    fn from(contract: OptionContract) -> Self {
        Self::Option(contract)
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentKey::Option(contract) => write!(f, "{contract}"),
            InstrumentKey::Underlying(ticker) => write!(f, "{ticker}"),
        }
    }
}

impl FromStr for InstrumentKey {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.split(':').collect::<Vec<_>>();
        match parts.as_slice() {
            [ticker] => parse_symbol(ticker).map(InstrumentKey::Underlying),
            [root, expiration, strike, right] => {
                OptionContract::parse(root, expiration, strike, right).map(InstrumentKey::Option)
            }
            _ => Err(InstrumentError::MissingParameters),
        }
    }
}

impl Serialize for InstrumentKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstrumentKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The process wide symbol and expiration every non privileged session watches together.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct ViewedInstrument {
    pub symbol: SmolStr,
    pub expiration: Expiration,
}

impl fmt::Display for ViewedInstrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.expiration)
    }
}

/// Deserialize a value clients may send either as a JSON string or a JSON number.
pub fn de_str_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNumber {
        Str(String),
        Number(serde_json::Number),
    }

    Ok(match StrOrNumber::deserialize(deserializer)? {
        StrOrNumber::Str(value) => value,
        StrOrNumber::Number(value) => value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn expiration(date: &str) -> Expiration {
        date.parse().unwrap()
    }

    #[test]
    fn test_instrument_key_from_str() {
        struct TestCase {
            input: &'static str,
            expected: Result<InstrumentKey, InstrumentError>,
        }

        let tests = vec![
            TestCase {
                // TC0: canonical option contract
                input: "SPY:20250620:450:C",
                expected: Ok(InstrumentKey::Option(OptionContract {
                    root: SmolStr::new("SPY"),
                    expiration: expiration("20250620"),
                    strike: dec!(450),
                    right: OptionRight::Call,
                })),
            },
            TestCase {
                // TC1: lowercase root, dashed date, trailing zero strike, long right
                input: "spy:2025-06-20:452.50:put",
                expected: Ok(InstrumentKey::Option(OptionContract {
                    root: SmolStr::new("SPY"),
                    expiration: expiration("20250620"),
                    strike: dec!(452.5),
                    right: OptionRight::Put,
                })),
            },
            TestCase {
                // TC2: underlying ticker
                input: "qqq",
                expected: Ok(InstrumentKey::Underlying(SmolStr::new("QQQ"))),
            },
            TestCase {
                // TC3: missing parameter
                input: "SPY:20250620::C",
                expected: Err(InstrumentError::MissingParameters),
            },
            TestCase {
                // TC4: wrong number of parts
                input: "SPY:20250620:450",
                expected: Err(InstrumentError::MissingParameters),
            },
            TestCase {
                // TC5: invalid right
                input: "SPY:20250620:450:X",
                expected: Err(InstrumentError::InvalidRight("X".to_string())),
            },
            TestCase {
                // TC6: invalid expiration
                input: "SPY:20251340:450:C",
                expected: Err(InstrumentError::InvalidExpiration("20251340".to_string())),
            },
            TestCase {
                // TC7: non positive strike
                input: "SPY:20250620:0:C",
                expected: Err(InstrumentError::InvalidStrike("0".to_string())),
            },
            TestCase {
                // TC8: invalid symbol
                input: "SP Y",
                expected: Err(InstrumentError::InvalidSymbol("SP Y".to_string())),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.parse::<InstrumentKey>();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_equivalent_strikes_share_one_key() {
        let a = InstrumentKey::from_str("SPY:20250620:450:C").unwrap();
        let b = InstrumentKey::from_str("SPY:20250620:450.00:CALL").unwrap();

        assert_eq!(a, b);
        assert_eq!(a.to_string(), "SPY:20250620:450:C");
        assert_eq!(b.to_string(), "SPY:20250620:450:C");
    }

    #[test]
    fn test_instrument_key_serde_uses_text_form() {
        let key = InstrumentKey::from_str("SPY:20250620:452.5:P").unwrap();

        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"SPY:20250620:452.5:P\"");

        let back = serde_json::from_str::<InstrumentKey>(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_expiration_accepts_numbers() {
        let viewed = serde_json::from_str::<ViewedInstrument>(
            r#"{"symbol":"SPY","expiration":20251219}"#,
        )
        .unwrap();

        assert_eq!(viewed.expiration.as_u32(), 20251219);
        assert_eq!(viewed.to_string(), "SPY/20251219");
    }
}
