//! Tagged quantity types used by pyre APIs.
//!
//! A [`BlockNumber`] is either a symbolic tag (`"latest"`, `"pending"`, ...)
//! or a hex-encoded quantity. Both forms re-encode byte-identically.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum QuantityError {
    #[error("hex quantity missing 0x prefix")]
    MissingPrefix,
    #[error("hex quantity is empty")]
    Empty,
    #[error("hex quantity has leading zero digits")]
    LeadingZero,
    #[error("invalid hex digit in quantity")]
    InvalidDigit,
    #[error("hex quantity larger than 64 bits")]
    Overflow,
}

/// Encode a quantity as minimal hex with a `0x` prefix, e.g. `0x0`, `0x41`.
pub fn encode_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

/// Decode a `0x`-prefixed hex quantity. Leading zero digits are rejected
/// (`0x0` is the only representation of zero).
pub fn decode_quantity(input: &str) -> Result<u64, QuantityError> {
    let digits = input
        .strip_prefix("0x")
        .ok_or(QuantityError::MissingPrefix)?;
    if digits.is_empty() {
        return Err(QuantityError::Empty);
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(QuantityError::LeadingZero);
    }
    if digits.len() > 16 {
        return Err(QuantityError::Overflow);
    }
    u64::from_str_radix(digits, 16).map_err(|_| QuantityError::InvalidDigit)
}

/// A block height argument: a symbolic tag or an explicit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockNumber {
    Earliest,
    Latest,
    Pending,
    Finalized,
    Safe,
    Number(u64),
}

impl BlockNumber {
    pub fn as_number(&self) -> Option<u64> {
        match self {
            BlockNumber::Earliest => Some(0),
            BlockNumber::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockNumber::Earliest => f.write_str("earliest"),
            BlockNumber::Latest => f.write_str("latest"),
            BlockNumber::Pending => f.write_str("pending"),
            BlockNumber::Finalized => f.write_str("finalized"),
            BlockNumber::Safe => f.write_str("safe"),
            BlockNumber::Number(n) => f.write_str(&encode_quantity(*n)),
        }
    }
}

impl Serialize for BlockNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let input = String::deserialize(deserializer)?;
        match input.as_str() {
            "earliest" => Ok(BlockNumber::Earliest),
            "latest" => Ok(BlockNumber::Latest),
            "pending" => Ok(BlockNumber::Pending),
            "finalized" => Ok(BlockNumber::Finalized),
            "safe" => Ok(BlockNumber::Safe),
            other => decode_quantity(other)
                .map(BlockNumber::Number)
                .map_err(|e| D::Error::custom(format!("invalid block number {other:?}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_round_trip() {
        for (n, hex) in [(0u64, "0x0"), (1, "0x1"), (65, "0x41"), (1024, "0x400")] {
            assert_eq!(encode_quantity(n), hex);
            assert_eq!(decode_quantity(hex).unwrap(), n);
        }
    }

    #[test]
    fn quantity_rejects_bad_input() {
        assert_eq!(decode_quantity("41"), Err(QuantityError::MissingPrefix));
        assert_eq!(decode_quantity("0x"), Err(QuantityError::Empty));
        assert_eq!(decode_quantity("0x041"), Err(QuantityError::LeadingZero));
        assert_eq!(decode_quantity("0xzz"), Err(QuantityError::InvalidDigit));
        assert_eq!(
            decode_quantity("0x10000000000000000"),
            Err(QuantityError::Overflow)
        );
    }

    #[test]
    fn tag_round_trip_is_byte_identical() {
        for raw in [
            "\"earliest\"",
            "\"latest\"",
            "\"pending\"",
            "\"finalized\"",
            "\"safe\"",
            "\"0x0\"",
            "\"0x41\"",
        ] {
            let bn: BlockNumber = serde_json::from_str(raw).unwrap();
            assert_eq!(serde_json::to_string(&bn).unwrap(), raw);
        }
    }

    #[test]
    fn tags_decode_to_expected_values() {
        let latest: BlockNumber = serde_json::from_str("\"latest\"").unwrap();
        assert_eq!(latest, BlockNumber::Latest);
        let n: BlockNumber = serde_json::from_str("\"0x41\"").unwrap();
        assert_eq!(n, BlockNumber::Number(65));
        assert_eq!(n.as_number(), Some(65));
        assert_eq!(BlockNumber::Earliest.as_number(), Some(0));
        assert_eq!(BlockNumber::Latest.as_number(), None);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert!(serde_json::from_str::<BlockNumber>("\"newest\"").is_err());
    }
}
