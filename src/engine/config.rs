use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use super::money::{Money, MoneyError};
use super::Decimal;

/// How transfer fees are charged. Fees are always in the source currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum FeePolicy {
    #[default]
    Free,
    /// Flat amount per transfer
    Fixed(Decimal),
    /// Percent of the debited principal, e.g. `1.5` for 1.5%
    Percentage(Decimal),
}

impl FeePolicy {
    /// Fee owed for moving `principal` (already in the source currency).
    pub fn fee_for(&self, principal: Money) -> Result<Option<Money>, MoneyError> {
        let fee = match self {
            FeePolicy::Free => return Ok(None),
            FeePolicy::Fixed(amount) => Money::new(*amount, principal.currency()),
            FeePolicy::Percentage(percent) => {
                principal.checked_mul(*percent / Decimal::ONE_HUNDRED)?
            }
        };
        Ok(Some(fee.round_to_minor_units()))
    }
}

/// Runtime knobs of the ledger engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Longest a rate may be used after the provider observed it
    #[serde(with = "ttl_seconds")]
    pub rate_ttl: TimeDelta,
    pub fee_policy: FeePolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rate_ttl: TimeDelta::seconds(300),
            fee_policy: FeePolicy::Free,
        }
    }
}

impl LedgerConfig {
    pub fn with_fee_policy(mut self, fee_policy: FeePolicy) -> Self {
        self.fee_policy = fee_policy;
        self
    }

    pub fn with_rate_ttl(mut self, rate_ttl: TimeDelta) -> Self {
        self.rate_ttl = rate_ttl;
        self
    }
}

mod ttl_seconds {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(ttl.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let seconds = i64::deserialize(deserializer)?;
        TimeDelta::try_seconds(seconds)
            .ok_or_else(|| serde::de::Error::custom(format!("TTL out of range: {seconds}s")))
    }
}
