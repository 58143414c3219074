//! Deployment Monitor
//!
//! Derives capital utilization and sector concentration from ledger state.
//! Both views are recomputed on demand and never cached: the same ledger
//! state and portfolio value always produce the same snapshot.

use crate::domain::entities::position::{Position, PositionStatus};
use crate::domain::errors::{LedgerError, StoreError, ValidationError};
use crate::domain::services::position_ledger::PositionLedger;
use crate::domain::value_objects::price::PriceBook;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Thresholds for deployment and concentration checks
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentConfig {
    /// Fraction of portfolio value meant to be invested (0.90 = 90%)
    pub target_deployment_ratio: f64,
    /// Rebalance when deployment falls below this fraction of target
    pub min_deployment_threshold: f64,
    pub max_positions: u32,
    /// Sector weight above which a sector is flagged (0.30 = 30%)
    pub sector_concentration_limit: f64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            target_deployment_ratio: 0.90,
            min_deployment_threshold: 0.85,
            max_positions: 10,
            sector_concentration_limit: 0.30,
        }
    }
}

/// Capital utilization at a point in ledger history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSnapshot {
    pub portfolio_value: f64,
    pub open_count: u32,
    pub pending_count: u32,
    /// OPEN cost basis plus PENDING intended notional
    pub deployed_capital: f64,
    pub target_capital: f64,
    pub available_capital: f64,
    pub available_positions: u32,
    pub deployment_pct: f64,
    pub needs_rebalancing: bool,
    /// OPEN cost basis per sector, as a fraction of total OPEN cost
    pub sector_weights: BTreeMap<String, f64>,
}

impl DeploymentSnapshot {
    pub fn compute(
        positions: &[Position],
        portfolio_value: f64,
        config: &DeploymentConfig,
    ) -> Result<Self, ValidationError> {
        if !portfolio_value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if portfolio_value <= 0.0 {
            return Err(ValidationError::InvalidPrice(format!(
                "portfolio value must be positive, got {}",
                portfolio_value
            )));
        }

        let open_count = count(positions, PositionStatus::Open);
        let pending_count = count(positions, PositionStatus::Pending);
        let deployed_capital: f64 = positions.iter().map(Position::committed_capital).sum();

        let target_capital = portfolio_value * config.target_deployment_ratio;
        let deployment_pct = if target_capital > 0.0 {
            deployed_capital / target_capital
        } else {
            0.0
        };

        Ok(Self {
            portfolio_value,
            open_count,
            pending_count,
            deployed_capital,
            target_capital,
            available_capital: (target_capital - deployed_capital).max(0.0),
            available_positions: config
                .max_positions
                .saturating_sub(open_count + pending_count),
            deployment_pct,
            needs_rebalancing: deployment_pct < config.min_deployment_threshold
                && open_count < config.max_positions,
            sector_weights: SectorConcentration::weigh(positions, None),
        })
    }
}

fn count(positions: &[Position], status: PositionStatus) -> u32 {
    positions.iter().filter(|p| p.status == status).count() as u32
}

/// Advisory sector concentration view over OPEN positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorConcentration {
    pub weights: BTreeMap<String, f64>,
    pub limit: f64,
    /// Sectors whose weight exceeds `limit`, heaviest first
    pub over_concentrated: Vec<String>,
}

impl SectorConcentration {
    pub fn from_weights(weights: BTreeMap<String, f64>, limit: f64) -> Self {
        let mut over: Vec<(&String, &f64)> = weights.iter().filter(|(_, w)| **w > limit).collect();
        over.sort_by(|a, b| b.1.total_cmp(a.1));
        let over_concentrated = over.into_iter().map(|(s, _)| s.clone()).collect();
        Self {
            weights,
            limit,
            over_concentrated,
        }
    }

    pub fn compute(positions: &[Position], prices: Option<&PriceBook>, limit: f64) -> Self {
        Self::from_weights(Self::weigh(positions, prices), limit)
    }

    pub fn is_over_concentrated(&self, sector: &str) -> bool {
        self.over_concentrated.iter().any(|s| s == sector)
    }

    /// Market value of OPEN positions grouped by sector, divided by total OPEN
    /// value. Positions without a quoted price are valued at cost.
    fn weigh(positions: &[Position], prices: Option<&PriceBook>) -> BTreeMap<String, f64> {
        let mut by_sector: BTreeMap<String, f64> = BTreeMap::new();
        for position in positions.iter().filter(|p| p.status == PositionStatus::Open) {
            let price = prices.and_then(|book| book.get(&position.ticker)).copied();
            *by_sector
                .entry(position.sector_or_unknown().to_string())
                .or_insert(0.0) += position.market_value(price);
        }

        let total: f64 = by_sector.values().sum();
        if total <= 0.0 {
            return BTreeMap::new();
        }
        by_sector.values_mut().for_each(|value| *value /= total);
        by_sector
    }
}

/// Reads the ledger to answer deployment questions. Holds no state of its own.
pub struct DeploymentMonitor {
    ledger: Arc<PositionLedger>,
    config: DeploymentConfig,
}

impl DeploymentMonitor {
    pub fn new(ledger: Arc<PositionLedger>, config: DeploymentConfig) -> Self {
        Self { ledger, config }
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub async fn check_deployment_status(
        &self,
        portfolio_value: f64,
    ) -> Result<DeploymentSnapshot, LedgerError> {
        let positions = self.ledger.positions(None).await?;
        let snapshot = DeploymentSnapshot::compute(&positions, portfolio_value, &self.config)?;

        info!(
            "Deployment {:.1}% of target (${:.2} / ${:.2}), {} open, {} pending",
            snapshot.deployment_pct * 100.0,
            snapshot.deployed_capital,
            snapshot.target_capital,
            snapshot.open_count,
            snapshot.pending_count
        );
        if snapshot.needs_rebalancing {
            debug!(
                "Rebalancing needed: ${:.2} available across {} slots",
                snapshot.available_capital, snapshot.available_positions
            );
        }
        Ok(snapshot)
    }

    pub async fn check_sector_concentration(
        &self,
        prices: Option<&PriceBook>,
    ) -> Result<SectorConcentration, StoreError> {
        let positions = self.ledger.positions(Some(PositionStatus::Open)).await?;
        let concentration =
            SectorConcentration::compute(&positions, prices, self.config.sector_concentration_limit);

        for sector in &concentration.over_concentrated {
            warn!(
                "Sector {} over-concentrated at {:.1}% (limit {:.1}%)",
                sector,
                concentration.weights.get(sector).copied().unwrap_or(0.0) * 100.0,
                concentration.limit * 100.0
            );
        }
        Ok(concentration)
    }
}
