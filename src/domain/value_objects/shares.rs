use crate::domain::errors::ValidationError;
use serde::{Deserialize, Serialize};

/// A strictly positive whole number of shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Shares(i64);

impl Shares {
    pub fn new(value: i64) -> Result<Self, ValidationError> {
        if value <= 0 {
            return Err(ValidationError::InvalidShares(format!(
                "{} must be greater than zero",
                value
            )));
        }
        Ok(Shares(value))
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Shares left over when `filled` is less than `self`.
    pub fn shortfall(&self, filled: Shares) -> i64 {
        (self.0 - filled.0).max(0)
    }

    pub fn notional(&self, price: f64) -> f64 {
        self.0 as f64 * price
    }
}

impl TryFrom<i64> for Shares {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Shares::new(value)
    }
}

impl From<Shares> for i64 {
    fn from(shares: Shares) -> Self {
        shares.0
    }
}

impl std::fmt::Display for Shares {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
