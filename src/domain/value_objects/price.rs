use crate::domain::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Current prices by ticker, supplied by an external market-data feed.
pub type PriceBook = HashMap<String, Price>;

/// A strictly positive, finite per-share price.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Price(f64);

impl Price {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if value <= 0.0 {
            return Err(ValidationError::InvalidPrice(format!(
                "{} must be greater than zero",
                value
            )));
        }
        Ok(Price(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Relative distance from `reference`, e.g. 0.02 for a 2% divergence.
    pub fn divergence_from(&self, reference: Price) -> f64 {
        ((self.0 - reference.0) / reference.0).abs()
    }
}

impl TryFrom<f64> for Price {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Price::new(value)
    }
}

impl From<Price> for f64 {
    fn from(price: Price) -> Self {
        price.0
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${:.2}", self.0)
    }
}
