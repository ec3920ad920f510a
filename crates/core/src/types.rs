//! Core type definitions

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult};

/// Identifier of a traded instrument, e.g. `BTC_USD`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(Cow<'static, str>);

impl Instrument {
    pub const BTC_USD: Instrument = Instrument(Cow::Borrowed("BTC_USD"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Instrument {
    fn default() -> Self {
        Self::BTC_USD
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decimal price kept as text so it survives transport without float artifacts.
///
/// The empty string means "no data".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(String);

impl Price {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Canonical text of a decimal, without trailing zeros
    pub fn from_decimal(value: Decimal) -> Self {
        Self(value.normalize().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse the text as a decimal. Plain and scientific notation are accepted.
    ///
    /// Finite numbers that `Decimal` cannot hold (magnitude above about
    /// 7.9e28, or more than 28 fractional digits) give `PriceOutOfRange`.
    pub fn parse(&self) -> CoreResult<Decimal> {
        let text = self.0.as_str();
        if text.is_empty() {
            return Err(CoreError::InvalidPrice(self.0.clone()));
        }

        Decimal::from_str(text)
            .or_else(|_| Decimal::from_scientific(text))
            .map_err(|_| {
                if text.parse::<f64>().is_ok_and(f64::is_finite) {
                    CoreError::PriceOutOfRange(self.0.clone())
                } else {
                    CoreError::InvalidPrice(self.0.clone())
                }
            })
    }
}

impl From<Decimal> for Price {
    fn from(value: Decimal) -> Self {
        Self::from_decimal(value)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Timestamped price for an instrument.
///
/// Used both for raw observations coming from sources and for the
/// aggregated per-interval output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub instrument: Instrument,
    pub timestamp: DateTime<Utc>,
    pub price: Price,
}

impl Bar {
    pub fn new(instrument: Instrument, timestamp: DateTime<Utc>, price: impl Into<Price>) -> Self {
        Self {
            instrument,
            timestamp,
            price: price.into(),
        }
    }

    pub fn unix_timestamp(&self) -> i64 {
        self.timestamp.timestamp()
    }

    pub fn has_price(&self) -> bool {
        !self.price.is_empty()
    }
}

impl From<&str> for Price {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Price {
    fn from(text: String) -> Self {
        Self(text)
    }
}

/// Start of the interval bucket containing `timestamp`, aligned to the Unix epoch
pub fn bucket_start(timestamp: DateTime<Utc>, interval: TimeDelta) -> CoreResult<DateTime<Utc>> {
    if interval <= TimeDelta::zero() {
        return Err(CoreError::InvalidInterval(format!("{interval} is not positive")));
    }
    timestamp
        .duration_trunc(interval)
        .map_err(|e| CoreError::InvalidInterval(e.to_string()))
}

/// Result of averaging the prices of one bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AveragedPrice {
    pub price: Price,
    pub accepted: usize,
    /// Prices that are not numbers
    pub rejected: usize,
    /// Numeric prices that could not be represented or summed
    pub out_of_range: usize,
}

/// Arithmetic mean of the bars' prices.
///
/// Prices that do not parse are left out of both the sum and the count, as
/// are prices that would overflow the running sum. No valid price yields an
/// empty price.
pub fn average_price<'a>(bars: impl IntoIterator<Item = &'a Bar>) -> AveragedPrice {
    let mut total = Decimal::ZERO;
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let mut out_of_range = 0usize;

    for bar in bars {
        match bar.price.parse() {
            Ok(value) => match total.checked_add(value) {
                Some(sum) => {
                    total = sum;
                    accepted += 1;
                }
                None => out_of_range += 1,
            },
            Err(CoreError::PriceOutOfRange(_)) => out_of_range += 1,
            Err(_) => rejected += 1,
        }
    }

    let price = match total.checked_div(Decimal::from(accepted)) {
        Some(mean) if accepted > 0 => Price::from_decimal(mean),
        _ => Price::empty(),
    };

    AveragedPrice {
        price,
        accepted,
        rejected,
        out_of_range,
    }
}
