use crate::domain::errors::ValidationError;
use crate::domain::value_objects::price::Price;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A scored instrument proposed by Research. Ephemeral input to sizing,
/// never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub ticker: String,
    pub composite_score: f64,
    #[serde(default)]
    pub sector: Option<String>,
    pub entry_price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub target: Option<f64>,
    #[serde(default)]
    pub risk_metrics: BTreeMap<String, f64>,
}

impl Candidate {
    pub fn new(ticker: &str, composite_score: f64, sector: &str, entry_price: f64) -> Self {
        Self {
            ticker: ticker.to_string(),
            composite_score,
            sector: Some(sector.to_string()),
            entry_price,
            stop_loss: None,
            target: None,
            risk_metrics: BTreeMap::new(),
        }
    }

    pub fn with_stops(mut self, stop_loss: f64, target: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self.target = Some(target);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.ticker.trim().is_empty() {
            return Err(ValidationError::InvalidTicker("ticker is empty".to_string()));
        }
        if !self.composite_score.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        Price::new(self.entry_price)?;
        if let Some(stop) = self.stop_loss {
            Price::new(stop)?;
        }
        if let Some(target) = self.target {
            Price::new(target)?;
        }
        Ok(())
    }

    /// Sector name used for concentration grouping.
    pub fn sector_or_unknown(&self) -> &str {
        self.sector.as_deref().unwrap_or(super::position::UNKNOWN_SECTOR)
    }
}
