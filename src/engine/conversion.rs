use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::error::LedgerError;
use super::money::{Currency, Money, MoneyError};
use super::Decimal;

type Pair = (Currency, Currency);

/// A directional exchange rate: `1 from = rate to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRate {
    pub from: Currency,
    pub to: Currency,
    pub rate: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl ConversionRate {
    pub fn new(from: Currency, to: Currency, rate: Decimal, observed_at: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            rate,
            observed_at,
        }
    }

    /// A rate still usable at `now` under the given time-to-live.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        now.signed_duration_since(self.observed_at) <= ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateError {
    #[error("No rate available for {from}->{to}")]
    Missing { from: Currency, to: Currency },

    #[error("Rate for {from}->{to} observed at {observed_at} exceeds the {ttl_secs}s TTL")]
    Stale {
        from: Currency,
        to: Currency,
        observed_at: DateTime<Utc>,
        ttl_secs: i64,
    },

    #[error("Provider returned unusable rate {rate} for {from}->{to}")]
    Invalid {
        from: Currency,
        to: Currency,
        rate: Decimal,
    },

    #[error("Rate provider failure: {0}")]
    Provider(String),
}

/// Source of exchange rates, usually a remote service.
///
/// Calls may be slow and may fail; the ledger never holds an account lock
/// across a call unless the cached rate expired in between.
pub trait RateProvider: Send + Sync {
    fn fetch_rate(&self, from: Currency, to: Currency) -> Result<ConversionRate, RateError>;
}

/// In-memory rate table. Only the directions that were inserted exist.
#[derive(Debug, Default)]
pub struct StaticRateProvider {
    rates: DashMap<Pair, ConversionRate>,
}

impl StaticRateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `from -> to` observed now.
    pub fn set_rate(&self, from: Currency, to: Currency, rate: Decimal) {
        self.insert(ConversionRate::new(from, to, rate, Utc::now()));
    }

    pub fn insert(&self, rate: ConversionRate) {
        self.rates.insert((rate.from, rate.to), rate);
    }

    pub fn remove(&self, from: Currency, to: Currency) {
        self.rates.remove(&(from, to));
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

impl RateProvider for StaticRateProvider {
    fn fetch_rate(&self, from: Currency, to: Currency) -> Result<ConversionRate, RateError> {
        self.rates
            .get(&(from, to))
            .map(|rate| *rate)
            .ok_or(RateError::Missing { from, to })
    }
}

impl<P: RateProvider + ?Sized> RateProvider for std::sync::Arc<P> {
    fn fetch_rate(&self, from: Currency, to: Currency) -> Result<ConversionRate, RateError> {
        (**self).fetch_rate(from, to)
    }
}

/// Outcome of applying a rate (or none) to an amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conversion {
    pub original: Money,
    pub converted: Money,
    /// `None` when no conversion took place.
    pub rate: Option<Decimal>,
}

impl Conversion {
    pub fn identity(amount: Money) -> Self {
        Self {
            original: amount,
            converted: amount,
            rate: None,
        }
    }

    pub(crate) fn at_rate(amount: Money, rate: &ConversionRate) -> Result<Self, MoneyError> {
        debug_assert_eq!(amount.currency(), rate.from, "rate applied to wrong currency");
        Ok(Self {
            original: amount,
            converted: amount.convert_at(rate.rate, rate.to)?,
            rate: Some(rate.rate),
        })
    }

    pub fn is_converted(&self) -> bool {
        self.rate.is_some()
    }
}

/// Fetches, validates and caches rates from a [`RateProvider`].
pub struct ConversionService {
    provider: Box<dyn RateProvider>,
    cache: DashMap<Pair, ConversionRate>,
    ttl: TimeDelta,
}

impl ConversionService {
    pub fn new(provider: impl RateProvider + 'static, ttl: TimeDelta) -> Self {
        Self {
            provider: Box::new(provider),
            cache: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    /// Returns a fresh rate for exactly `from -> to`.
    ///
    /// Served from cache while within the TTL, otherwise the provider is asked.
    /// An inverse rate is never used in place of a missing direction.
    pub fn get_rate(&self, from: Currency, to: Currency) -> Result<ConversionRate, RateError> {
        let now = Utc::now();
        if from == to {
            return Ok(ConversionRate::new(from, to, Decimal::ONE, now));
        }

        if let Some(cached) = self.cache.get(&(from, to)) {
            if cached.is_fresh(now, self.ttl) {
                return Ok(*cached);
            }
        }

        log::debug!("[rates] fetching {from}->{to} from provider");
        let rate = self.provider.fetch_rate(from, to)?;
        self.validate(from, to, &rate, now)?;
        self.cache.insert((from, to), rate);
        Ok(rate)
    }

    /// Returns `rate` if it is still within the TTL, otherwise a refetched one.
    pub fn ensure_fresh(&self, rate: ConversionRate) -> Result<ConversionRate, RateError> {
        if rate.is_fresh(Utc::now(), self.ttl) {
            Ok(rate)
        } else {
            log::debug!(
                "[rates] {}->{} expired between lookup and validation, refetching",
                rate.from,
                rate.to
            );
            self.get_rate(rate.from, rate.to)
        }
    }

    /// Converts `amount` into `to`, identity when the currencies match.
    pub fn convert(&self, amount: Money, to: Currency) -> Result<Conversion, LedgerError> {
        if amount.currency() == to {
            return Ok(Conversion::identity(amount));
        }
        let rate = self.get_rate(amount.currency(), to)?;
        Ok(Conversion::at_rate(amount, &rate)?)
    }

    pub fn invalidate(&self, from: Currency, to: Currency) {
        self.cache.remove(&(from, to));
    }

    fn validate(
        &self,
        from: Currency,
        to: Currency,
        rate: &ConversionRate,
        now: DateTime<Utc>,
    ) -> Result<(), RateError> {
        if rate.from != from || rate.to != to || rate.rate <= Decimal::ZERO {
            return Err(RateError::Invalid {
                from,
                to,
                rate: rate.rate,
            });
        }
        if !rate.is_fresh(now, self.ttl) {
            log::warn!(
                "[rates] provider returned stale rate {from}->{to} observed at {}",
                rate.observed_at
            );
            return Err(RateError::Stale {
                from,
                to,
                observed_at: rate.observed_at,
                ttl_secs: self.ttl.num_seconds(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConversionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionService")
            .field("cached_pairs", &self.cache.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
