// Copyright 2026 Boundless Foundation, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Canonical token amounts.
//!
//! Balances arrive from upstream sources in different unit bases (wei-style 18 decimal
//! values from the EVM RPC, 6 decimal micro-denom values from the bank REST API). Every
//! amount is brought to [CANONICAL_DECIMALS] fractional digits before it is compared or
//! stored. Extra precision is truncated toward zero, so an amount never rounds up across
//! a minimum-balance threshold.

use std::{fmt, str::FromStr};

use alloy::primitives::U256;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Number of fractional digits every canonical amount carries.
pub const CANONICAL_DECIMALS: u8 = 6;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseAmountError {
    #[error("empty amount")]
    Empty,

    #[error("invalid number: {0}")]
    InvalidNumber(String),

    #[error("negative amounts are not supported: {0}")]
    Negative(String),
}

/// A non-negative amount held in micro units (10^-6 of a whole token).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(U256);

impl Amount {
    pub const ZERO: Amount = Amount(U256::ZERO);

    /// Builds an amount from a value already expressed in micro units.
    pub fn from_micro(micro: U256) -> Self {
        Self(micro)
    }

    /// Builds an amount from whole tokens.
    pub fn from_whole(whole: u64) -> Self {
        Self(U256::from(whole) * scale(CANONICAL_DECIMALS))
    }

    /// Converts a raw upstream value with `decimals` fractional digits into a canonical amount.
    pub fn from_base_units(value: U256, decimals: u8) -> Self {
        if decimals == CANONICAL_DECIMALS {
            Self(value)
        } else if decimals > CANONICAL_DECIMALS {
            Self(value / scale(decimals - CANONICAL_DECIMALS))
        } else {
            Self(value.saturating_mul(scale(CANONICAL_DECIMALS - decimals)))
        }
    }

    /// Value in micro units.
    pub fn micro(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn saturating_mul(&self, factor: u64) -> Self {
        Self(self.0.saturating_mul(U256::from(factor)))
    }

    /// Parses a decimal string such as `"150"`, `"0.5"` or `"12.3456789"`.
    ///
    /// Any number of fractional digits is accepted; digits past the sixth are dropped.
    pub fn parse(s: &str) -> Result<Self, ParseAmountError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseAmountError::Empty);
        }
        if s.starts_with('-') {
            return Err(ParseAmountError::Negative(s.to_string()));
        }
        let s = s.strip_prefix('+').unwrap_or(s);

        let (integer, fraction) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if integer.is_empty() && fraction.is_empty() {
            return Err(ParseAmountError::InvalidNumber(s.to_string()));
        }
        if !integer.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ParseAmountError::InvalidNumber(s.to_string()));
        }

        let digits = CANONICAL_DECIMALS as usize;
        let fraction = if fraction.len() > digits { &fraction[..digits] } else { fraction };
        let integer = if integer.is_empty() { "0" } else { integer };
        let padded = format!("{integer}{fraction:0<digits$}");

        U256::from_str_radix(&padded, 10)
            .map(Self)
            .map_err(|_| ParseAmountError::InvalidNumber(s.to_string()))
    }
}

/// Normalizes a decimal string to its canonical six-digit rendering.
///
/// `canonicalize(&canonicalize(x)?)? == canonicalize(x)?` for every accepted input.
pub fn canonicalize(s: &str) -> Result<String, ParseAmountError> {
    Amount::parse(s).map(|amount| amount.to_string())
}

fn scale(decimals: u8) -> U256 {
    U256::from(10u64).pow(U256::from(decimals))
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = CANONICAL_DECIMALS as usize;
        let s = self.0.to_string();
        if s.len() <= digits {
            write!(f, "0.{s:0>digits$}")
        } else {
            let (integer, fraction) = s.split_at(s.len() - digits);
            write!(f, "{integer}.{fraction}")
        }
    }
}

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Amount::parse(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_and_formats_six_digits() {
        assert_eq!(Amount::parse("150").unwrap().to_string(), "150.000000");
        assert_eq!(Amount::parse("0.5").unwrap().to_string(), "0.500000");
        assert_eq!(Amount::parse(".25").unwrap().to_string(), "0.250000");
        assert_eq!(Amount::parse("12.3456789").unwrap().to_string(), "12.345678");
        assert_eq!(Amount::parse("0").unwrap(), Amount::ZERO);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(Amount::parse(""), Err(ParseAmountError::Empty));
        assert!(matches!(Amount::parse("-1"), Err(ParseAmountError::Negative(_))));
        assert!(matches!(Amount::parse("1.2.3"), Err(ParseAmountError::InvalidNumber(_))));
        assert!(matches!(Amount::parse("abc"), Err(ParseAmountError::InvalidNumber(_))));
        assert!(matches!(Amount::parse("."), Err(ParseAmountError::InvalidNumber(_))));
    }

    #[test]
    fn base_unit_conversion_truncates() {
        // 99.9999999 with 18 decimals must stay below 100.
        let wei = U256::from(99_999_999_900_000_000_000u128);
        let amount = Amount::from_base_units(wei, 18);
        assert_eq!(amount.to_string(), "99.999999");
        assert!(amount < Amount::from_whole(100));

        let micro = U256::from(150_000_000u64);
        assert_eq!(Amount::from_base_units(micro, 6), Amount::from_whole(150));

        assert_eq!(Amount::from_base_units(U256::from(15u64), 0), Amount::from_whole(15));
    }

    #[test]
    fn serde_uses_canonical_string() {
        let amount = Amount::parse("120.5").unwrap();
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"120.500000\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    proptest! {
        #[test]
        fn canonicalize_is_idempotent(integer in 0u64..u64::MAX, fraction in "[0-9]{0,24}") {
            let raw = if fraction.is_empty() {
                integer.to_string()
            } else {
                format!("{integer}.{fraction}")
            };
            let once = canonicalize(&raw).unwrap();
            let twice = canonicalize(&once).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
