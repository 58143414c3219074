use crate::domain::errors::ValidationError;
use crate::domain::value_objects::{price::Price, shares::Shares};
use serde::{Deserialize, Serialize};

/// Profit and Loss value object
///
/// Unlike Price, PnL can be negative to represent losses. Values are always
/// finite.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct PnL(f64);

impl PnL {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        Ok(PnL(value))
    }

    /// `(exit - entry) × shares` for a long holding.
    pub fn from_move(entry: Price, exit: Price, shares: Shares) -> Self {
        PnL((exit.value() - entry.value()) * shares.value() as f64)
    }

    pub fn zero() -> Self {
        PnL(0.0)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_profit(&self) -> bool {
        self.0 > 0.0
    }

    pub fn is_loss(&self) -> bool {
        self.0 < 0.0
    }
}

impl std::fmt::Display for PnL {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 >= 0.0 {
            write!(f, "+${:.2}", self.0)
        } else {
            write!(f, "-${:.2}", self.0.abs())
        }
    }
}

impl std::ops::Add for PnL {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        PnL(self.0 + other.0)
    }
}

impl std::iter::Sum for PnL {
    fn sum<I: Iterator<Item = PnL>>(iter: I) -> Self {
        iter.fold(PnL::zero(), |acc, p| acc + p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pnl_from_move_gain() {
        let pnl = PnL::from_move(
            Price::new(175.60).unwrap(),
            Price::new(186.00).unwrap(),
            Shares::new(56).unwrap(),
        );
        assert!((pnl.value() - 582.40).abs() < 1e-9);
        assert!(pnl.is_profit());
    }

    #[test]
    fn test_pnl_from_move_loss() {
        let pnl = PnL::from_move(
            Price::new(50.0).unwrap(),
            Price::new(45.0).unwrap(),
            Shares::new(10).unwrap(),
        );
        assert_eq!(pnl.value(), -50.0);
        assert!(pnl.is_loss());
    }

    #[test]
    fn test_pnl_invalid() {
        assert!(PnL::new(f64::NAN).is_err());
        assert!(PnL::new(f64::NEG_INFINITY).is_err());
    }

    #[test]
    fn test_pnl_sum_and_display() {
        let total: PnL = vec![PnL::new(1000.0).unwrap(), PnL::new(-300.0).unwrap()]
            .into_iter()
            .sum();
        assert_eq!(total.value(), 700.0);
        assert_eq!(format!("{}", total), "+$700.00");
        assert_eq!(format!("{}", PnL::new(-789.12).unwrap()), "-$789.12");
    }
}
