//! Integer token amounts in minor units.
//!
//! Ledger amounts are never floats. They travel as base-10 integer strings
//! (`"1000000000000000000"`) and are held as a 256-bit unsigned integer so
//! that equality against on-chain values is exact.

use primitive_types::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A non-negative token amount in the token's smallest unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TokenAmount(U256);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
    #[error("amount is empty")]
    Empty,
    #[error("invalid base-10 amount: {0:?}")]
    Invalid(String),
    #[error("amount does not fit in 256 bits")]
    Overflow,
}

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(U256([0; 4]));

    /// Decode a big-endian word of at most 32 bytes.
    pub fn from_be_slice(bytes: &[u8]) -> Result<Self, AmountParseError> {
        if bytes.len() > 32 {
            return Err(AmountParseError::Overflow);
        }
        Ok(Self(U256::from_big_endian(bytes)))
    }

    /// Encode as a 32-byte big-endian word (ABI `uint256` layout).
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        self.0.to_big_endian(&mut word);
        word
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl FromStr for TokenAmount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AmountParseError::Empty);
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountParseError::Invalid(s.to_string()));
        }
        U256::from_dec_str(s)
            .map(TokenAmount)
            .map_err(|_| AmountParseError::Overflow)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_large_amount() {
        let raw = "115792089237316195423570985008687907853269984665640564039457584007913129639935";
        let amount: TokenAmount = raw.parse().unwrap();
        assert_eq!(amount.to_string(), raw);
        assert_eq!(amount.to_be_bytes(), [0xff; 32]);
    }

    #[test]
    fn test_rejects_non_decimal_input() {
        assert_eq!("".parse::<TokenAmount>(), Err(AmountParseError::Empty));
        assert!(matches!(
            "-5".parse::<TokenAmount>(),
            Err(AmountParseError::Invalid(_))
        ));
        assert!(matches!(
            "1.5".parse::<TokenAmount>(),
            Err(AmountParseError::Invalid(_))
        ));
        assert!(matches!(
            "0x10".parse::<TokenAmount>(),
            Err(AmountParseError::Invalid(_))
        ));
    }

    #[test]
    fn test_serde_uses_decimal_strings() {
        let amount = TokenAmount::from(100u64);
        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"100\"");
        let back: TokenAmount = serde_json::from_str("\"100\"").unwrap();
        assert_eq!(back, amount);
        assert!(serde_json::from_str::<TokenAmount>("100").is_err());
    }

    #[test]
    fn test_word_layout() {
        let amount = TokenAmount::from(0x0102u64);
        let word = amount.to_be_bytes();
        assert_eq!(word[30], 0x01);
        assert_eq!(word[31], 0x02);
        assert!(word[..30].iter().all(|b| *b == 0));
        assert_eq!(TokenAmount::from_be_slice(&word).unwrap(), amount);
        assert!(TokenAmount::ZERO.is_zero());
    }
}
