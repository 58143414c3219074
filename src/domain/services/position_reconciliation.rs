//! Position Reconciliation
//!
//! Compares ledger state against an external source of truth (the broker's
//! view of holdings) and reports drift. Reconciliation is advisory only: it
//! never mutates a position. Every finding is a `ReconciliationAnomaly`
//! requiring human judgment.

use crate::domain::entities::position::{Position, PositionStatus};
use crate::domain::value_objects::price::Price;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Reconciliation thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationConfig {
    /// PENDING positions older than this are flagged for cancellation
    pub stale_pending_after: Duration,
    /// Relative entry-price divergence tolerated before flagging (0.02 = 2%)
    pub price_tolerance_pct: f64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            stale_pending_after: Duration::hours(48),
            price_tolerance_pct: 0.02,
        }
    }
}

/// A holding as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticker: String,
    pub shares: i64,
    pub avg_entry_price: f64,
}

/// The broker's holdings at a point in time, keyed by ticker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub positions: HashMap<String, BrokerPosition>,
}

impl BrokerSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(mut self, ticker: &str, shares: i64, avg_entry_price: f64) -> Self {
        self.positions.insert(
            ticker.to_string(),
            BrokerPosition {
                ticker: ticker.to_string(),
                shares,
                avg_entry_price,
            },
        );
        self
    }
}

/// Discrepancy severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiscrepancySeverity {
    Ok,
    Minor,
    Major,
    Critical,
}

impl fmt::Display for DiscrepancySeverity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Ok => "OK",
                Self::Minor => "MINOR",
                Self::Major => "MAJOR",
                Self::Critical => "CRITICAL",
            }
        )
    }
}

/// A reported discrepancy. Not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconciliationAnomaly {
    /// PENDING for longer than the staleness window; candidate for cancellation
    StalePending {
        position_id: String,
        ticker: String,
        created_at: DateTime<Utc>,
        age_hours: i64,
    },
    /// OPEN, but the broker's entry price diverges beyond tolerance
    PriceDiscrepancy {
        position_id: String,
        ticker: String,
        local_entry_price: f64,
        broker_entry_price: f64,
        divergence_pct: f64,
    },
    /// Filled for fewer shares than intended; the remainder was not pursued
    PartialFill {
        position_id: String,
        ticker: String,
        intended_shares: i64,
        actual_shares: i64,
        unfilled_shares: i64,
    },
    /// OPEN locally with no matching broker holding
    MissingAtBroker {
        position_id: String,
        ticker: String,
        shares: i64,
    },
}

impl ReconciliationAnomaly {
    pub fn position_id(&self) -> &str {
        match self {
            Self::StalePending { position_id, .. }
            | Self::PriceDiscrepancy { position_id, .. }
            | Self::PartialFill { position_id, .. }
            | Self::MissingAtBroker { position_id, .. } => position_id,
        }
    }

    pub fn severity(&self) -> DiscrepancySeverity {
        match self {
            Self::PartialFill { .. } => DiscrepancySeverity::Minor,
            Self::StalePending { .. } => DiscrepancySeverity::Minor,
            Self::PriceDiscrepancy { .. } => DiscrepancySeverity::Major,
            Self::MissingAtBroker { .. } => DiscrepancySeverity::Critical,
        }
    }
}

/// Reconciliation report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub reconciliation_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: DiscrepancySeverity,
    pub positions_checked: usize,
    pub broker_checked: bool,
    pub stale_pending: Vec<ReconciliationAnomaly>,
    pub price_discrepancies: Vec<ReconciliationAnomaly>,
    pub partial_fills: Vec<ReconciliationAnomaly>,
    pub missing_at_broker: Vec<ReconciliationAnomaly>,
}

impl ReconciliationReport {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            // reports can share a millisecond (end of cycle and on demand)
            reconciliation_id: format!(
                "rec_{}_{:08x}",
                timestamp.timestamp_millis(),
                rand::thread_rng().gen::<u32>()
            ),
            timestamp,
            status: DiscrepancySeverity::Ok,
            positions_checked: 0,
            broker_checked: false,
            stale_pending: Vec::new(),
            price_discrepancies: Vec::new(),
            partial_fills: Vec::new(),
            missing_at_broker: Vec::new(),
        }
    }

    pub fn add(&mut self, anomaly: ReconciliationAnomaly) {
        // Status tracks the worst severity seen
        self.status = self.status.max(anomaly.severity());
        let bucket = match anomaly {
            ReconciliationAnomaly::StalePending { .. } => &mut self.stale_pending,
            ReconciliationAnomaly::PriceDiscrepancy { .. } => &mut self.price_discrepancies,
            ReconciliationAnomaly::PartialFill { .. } => &mut self.partial_fills,
            ReconciliationAnomaly::MissingAtBroker { .. } => &mut self.missing_at_broker,
        };
        bucket.push(anomaly);
    }

    pub fn anomalies(&self) -> impl Iterator<Item = &ReconciliationAnomaly> {
        self.stale_pending
            .iter()
            .chain(self.price_discrepancies.iter())
            .chain(self.partial_fills.iter())
            .chain(self.missing_at_broker.iter())
    }

    pub fn anomaly_count(&self) -> usize {
        self.anomalies().count()
    }
}

/// Checks PENDING and OPEN positions against the staleness window and, when
/// a broker snapshot is supplied, against broker-reported holdings.
pub fn reconcile_positions(
    positions: &[Position],
    broker: Option<&BrokerSnapshot>,
    config: &ReconciliationConfig,
    now: DateTime<Utc>,
) -> ReconciliationReport {
    let mut report = ReconciliationReport::new(now);
    report.broker_checked = broker.is_some();

    for position in positions {
        match position.status {
            PositionStatus::Pending => {
                report.positions_checked += 1;
                let age = now - position.created_at;
                if age > config.stale_pending_after {
                    report.add(ReconciliationAnomaly::StalePending {
                        position_id: position.position_id.clone(),
                        ticker: position.ticker.clone(),
                        created_at: position.created_at,
                        age_hours: age.num_hours(),
                    });
                }
            }
            PositionStatus::Open => {
                report.positions_checked += 1;
                check_open_position(position, broker, config, &mut report);
            }
            PositionStatus::Closed | PositionStatus::Rejected => {}
        }
    }

    report
}

fn check_open_position(
    position: &Position,
    broker: Option<&BrokerSnapshot>,
    config: &ReconciliationConfig,
    report: &mut ReconciliationReport,
) {
    let (entry, shares) = match (position.actual_entry_price, position.actual_shares) {
        (Some(entry), Some(shares)) => (entry, shares),
        _ => return,
    };

    if position.unfilled_shares() > 0 {
        report.add(ReconciliationAnomaly::PartialFill {
            position_id: position.position_id.clone(),
            ticker: position.ticker.clone(),
            intended_shares: position.intended_shares.value(),
            actual_shares: shares.value(),
            unfilled_shares: position.unfilled_shares(),
        });
    }

    let Some(broker) = broker else {
        return;
    };

    match broker.positions.get(&position.ticker) {
        None => report.add(ReconciliationAnomaly::MissingAtBroker {
            position_id: position.position_id.clone(),
            ticker: position.ticker.clone(),
            shares: shares.value(),
        }),
        Some(held) => {
            // An unusable broker price is reported as an unbounded divergence
            let divergence = Price::new(held.avg_entry_price)
                .map(|broker_price| broker_price.divergence_from(entry))
                .unwrap_or(f64::INFINITY);
            if divergence > config.price_tolerance_pct {
                report.add(ReconciliationAnomaly::PriceDiscrepancy {
                    position_id: position.position_id.clone(),
                    ticker: position.ticker.clone(),
                    local_entry_price: entry.value(),
                    broker_entry_price: held.avg_entry_price,
                    divergence_pct: divergence,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::OrderIntent;
    use crate::domain::value_objects::shares::Shares;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap() + Duration::hours(hour as i64)
    }

    fn pending(ticker: &str, shares: i64, created: DateTime<Utc>) -> Position {
        let intent = OrderIntent::new(ticker, Some("Energy"), shares, 100.0, None, None).unwrap();
        Position::pending(format!("pos_{}", ticker), &intent, &format!("order-{}", ticker), None, created)
    }

    fn open(ticker: &str, intended: i64, filled: i64, price: f64) -> Position {
        pending(ticker, intended, at(0))
            .fill(
                Shares::new(filled).unwrap(),
                Price::new(price).unwrap(),
                at(1),
                &format!("fill-{}", ticker),
                at(1),
            )
            .unwrap()
    }

    #[test]
    fn test_stale_pending_flagged_after_window() {
        let config = ReconciliationConfig::default();
        let positions = vec![pending("OLD", 10, at(0)), pending("NEW", 10, at(40))];
        let report = reconcile_positions(&positions, None, &config, at(50));

        assert_eq!(report.stale_pending.len(), 1);
        assert_eq!(report.stale_pending[0].position_id(), "pos_OLD");
        assert_eq!(report.status, DiscrepancySeverity::Minor);
        assert!(!report.broker_checked);
    }

    #[test]
    fn test_price_discrepancy_beyond_tolerance() {
        let config = ReconciliationConfig::default();
        let positions = vec![open("XOM", 10, 10, 100.0), open("CVX", 10, 10, 100.0)];
        let broker = BrokerSnapshot::new()
            .with_position("XOM", 10, 101.0)
            .with_position("CVX", 10, 105.0);
        let report = reconcile_positions(&positions, Some(&broker), &config, at(2));

        assert_eq!(report.price_discrepancies.len(), 1);
        match &report.price_discrepancies[0] {
            ReconciliationAnomaly::PriceDiscrepancy { ticker, divergence_pct, .. } => {
                assert_eq!(ticker, "CVX");
                assert!((divergence_pct - 0.05).abs() < 1e-9);
            }
            other => panic!("unexpected anomaly {:?}", other),
        }
        assert_eq!(report.status, DiscrepancySeverity::Major);
    }

    #[test]
    fn test_partial_fill_and_missing_at_broker() {
        let config = ReconciliationConfig::default();
        let positions = vec![open("SLB", 40, 30, 50.0)];
        let report = reconcile_positions(&positions, Some(&BrokerSnapshot::new()), &config, at(2));

        assert_eq!(report.partial_fills.len(), 1);
        assert_eq!(report.missing_at_broker.len(), 1);
        assert_eq!(report.status, DiscrepancySeverity::Critical);
        assert_eq!(report.anomaly_count(), 2);
    }

    #[test]
    fn test_reconcile_is_read_only() {
        let config = ReconciliationConfig::default();
        let positions = vec![pending("OLD", 10, at(0))];
        let before = positions.clone();
        let _ = reconcile_positions(&positions, None, &config, at(100));
        assert_eq!(positions, before);
    }
}
