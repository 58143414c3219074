//! Rebalancer
//!
//! Turns a deployment shortfall into a CandidateRequest for Research, and a
//! scored candidate list into sized allocations. It never creates positions:
//! allocations go to Compliance as proposals, and only approved proposals
//! reach the ledger.

use crate::domain::entities::candidate::Candidate;
use crate::domain::entities::message::{
    CandidateRequest, Department, OutboundMessage, Payload, TradeProposal,
};
use crate::domain::services::deployment_monitor::DeploymentSnapshot;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RebalancerConfig {
    pub min_composite_score: f64,
    pub max_candidates: u32,
    /// Cap per position as a fraction of portfolio value
    pub max_position_pct: f64,
    /// Allocations below this dollar value are dropped
    pub min_trade_value: f64,
    /// Smallest weight any selected candidate may receive
    pub floor_weight: f64,
    /// Convexity of the score → weight mapping (weight ∝ score^exponent)
    pub score_exponent: f64,
    pub sector_diversification: bool,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            min_composite_score: 60.0,
            max_candidates: 10,
            max_position_pct: 0.10,
            min_trade_value: 500.0,
            floor_weight: 0.05,
            score_exponent: 2.0,
            sector_diversification: true,
        }
    }
}

/// A sized candidate, ready to be proposed to Compliance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub ticker: String,
    pub sector: Option<String>,
    pub composite_score: f64,
    pub weight: f64,
    pub target_value: f64,
    pub shares: i64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub target: Option<f64>,
}

impl Allocation {
    pub fn to_proposal(&self) -> TradeProposal {
        TradeProposal {
            ticker: self.ticker.clone(),
            sector: self.sector.clone(),
            shares: self.shares,
            entry_price: self.entry_price,
            stop_loss: self.stop_loss,
            target: self.target,
            composite_score: self.composite_score,
            target_value: self.target_value,
        }
    }
}

/// Normalized weights for `scores`, each `score^exponent` and at least
/// `floor`. Candidates pushed up to the floor are pinned there and the rest
/// of the mass is shared among the others in proportion to their raw weight.
pub fn allocation_weights(scores: &[f64], exponent: f64, floor: f64) -> Vec<f64> {
    let n = scores.len();
    if n == 0 {
        return Vec::new();
    }
    if floor * n as f64 >= 1.0 {
        return vec![1.0 / n as f64; n];
    }

    let raw: Vec<f64> = scores.iter().map(|s| s.powf(exponent)).collect();
    let mut pinned = vec![false; n];

    loop {
        let free_raw: f64 = raw
            .iter()
            .zip(&pinned)
            .filter(|(_, pinned)| !**pinned)
            .map(|(r, _)| *r)
            .sum();
        let free_mass = 1.0 - floor * pinned.iter().filter(|p| **p).count() as f64;
        let free_count = pinned.iter().filter(|p| !**p).count() as f64;

        let weights: Vec<f64> = (0..n)
            .map(|i| {
                if pinned[i] {
                    floor
                } else if free_raw > 0.0 {
                    free_mass * raw[i] / free_raw
                } else {
                    free_mass / free_count
                }
            })
            .collect();

        let mut changed = false;
        for i in 0..n {
            if !pinned[i] && weights[i] < floor {
                pinned[i] = true;
                changed = true;
            }
        }
        if !changed {
            return weights;
        }
    }
}

/// Capital and slots held by proposals Compliance has not answered yet.
///
/// Entries are keyed by ticker and remember the candidate list that produced
/// them, so a list handled again after an aborted cycle replaces its own
/// reservations instead of stacking on them. Everything is released when the
/// trading day changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProposalReservations {
    day: Option<NaiveDate>,
    entries: HashMap<String, Reservation>,
}

#[derive(Debug, Clone, PartialEq)]
struct Reservation {
    source_id: String,
    target_value: f64,
}

impl ProposalReservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every reservation made on an earlier trading day.
    pub fn roll_to(&mut self, day: NaiveDate) {
        if self.day != Some(day) {
            if !self.entries.is_empty() {
                info!(
                    "Releasing {} unanswered proposal reservations from {:?}",
                    self.entries.len(),
                    self.day
                );
            }
            self.entries.clear();
            self.day = Some(day);
        }
    }

    pub fn reserve(&mut self, ticker: &str, source_id: &str, target_value: f64) {
        self.entries.insert(
            ticker.to_string(),
            Reservation {
                source_id: source_id.to_string(),
                target_value,
            },
        );
    }

    /// Releases the reservation for `ticker`, returning the capital it held.
    pub fn release(&mut self, ticker: &str) -> Option<f64> {
        self.entries.remove(ticker).map(|r| r.target_value)
    }

    pub fn release_source(&mut self, source_id: &str) {
        self.entries.retain(|_, r| r.source_id != source_id);
    }

    pub fn contains(&self, ticker: &str) -> bool {
        self.entries.contains_key(ticker)
    }

    pub fn reserved_capital(&self) -> f64 {
        self.entries.values().map(|r| r.target_value).sum()
    }

    pub fn reserved_slots(&self) -> u32 {
        self.entries.len() as u32
    }

    /// `snapshot` with reserved capital and slots taken out of what is available.
    pub fn apply_to(&self, snapshot: &DeploymentSnapshot) -> DeploymentSnapshot {
        let mut adjusted = snapshot.clone();
        adjusted.available_capital = (snapshot.available_capital - self.reserved_capital()).max(0.0);
        adjusted.available_positions = snapshot
            .available_positions
            .saturating_sub(self.reserved_slots());
        adjusted
    }
}

pub struct Rebalancer {
    config: RebalancerConfig,
}

impl Rebalancer {
    /// A score exponent of 1 or less is not convex; the default is used instead.
    pub fn new(mut config: RebalancerConfig) -> Self {
        if config.score_exponent.is_nan() || config.score_exponent <= 1.0 {
            let fallback = RebalancerConfig::default().score_exponent;
            warn!(
                "Score exponent {} is not convex, using {}",
                config.score_exponent, fallback
            );
            config.score_exponent = fallback;
        }
        Self { config }
    }

    pub fn config(&self) -> &RebalancerConfig {
        &self.config
    }

    /// Builds the CandidateRequest for an under-deployed snapshot, or `None`
    /// when no rebalancing is needed or no position slot is free.
    ///
    /// At most one request is issued per trading day: the message carries a
    /// date-scoped idempotency key the bus uses to absorb repeats.
    pub fn generate_candidate_request(
        &self,
        snapshot: &DeploymentSnapshot,
        excluded_sectors: &[String],
        trading_day: NaiveDate,
    ) -> Option<OutboundMessage> {
        if !snapshot.needs_rebalancing || snapshot.available_positions == 0 {
            return None;
        }

        let request = CandidateRequest {
            available_positions: snapshot.available_positions,
            available_capital: snapshot.available_capital,
            min_composite_score: self.config.min_composite_score,
            max_candidates: self.config.max_candidates.min(snapshot.available_positions),
            sector_diversification: self.config.sector_diversification
                || !excluded_sectors.is_empty(),
            excluded_sectors: excluded_sectors.to_vec(),
            deployment_pct: snapshot.deployment_pct,
        };

        info!(
            "Requesting up to {} candidates for ${:.2} (deployment {:.1}%)",
            request.max_candidates,
            request.available_capital,
            request.deployment_pct * 100.0
        );

        Some(
            OutboundMessage::new(
                Department::Portfolio,
                Department::Research,
                Payload::CandidateRequest(request),
            )
            .high_priority()
            .with_idempotency_key(format!("candidate-request:{}", trading_day)),
        )
    }

    /// Sizes the strongest candidates against the available capital.
    ///
    /// Candidates below the minimum score or failing validation are skipped,
    /// duplicates keep their first (highest scored) entry, and at most
    /// `min(max_candidates, max_slots)` are selected. Each value is
    /// `min(available_capital × weight, portfolio_value × max_position_pct)`;
    /// allocations under `min_trade_value` or worth less than one share are
    /// dropped without redistributing their weight.
    pub fn size_candidates(
        &self,
        candidates: &[Candidate],
        available_capital: f64,
        portfolio_value: f64,
        max_slots: usize,
    ) -> Vec<Allocation> {
        if available_capital <= 0.0 || max_slots == 0 {
            return Vec::new();
        }

        let mut eligible: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| match c.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Skipping candidate {}: {}", c.ticker, e);
                    false
                }
            })
            .filter(|c| c.composite_score > 0.0 && c.composite_score >= self.config.min_composite_score)
            .collect();
        eligible.sort_by(|a, b| {
            b.composite_score
                .total_cmp(&a.composite_score)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });

        let mut seen = HashSet::new();
        eligible.retain(|c| seen.insert(c.ticker.clone()));
        eligible.truncate((self.config.max_candidates as usize).min(max_slots));

        let scores: Vec<f64> = eligible.iter().map(|c| c.composite_score).collect();
        let weights = allocation_weights(&scores, self.config.score_exponent, self.config.floor_weight);
        let cap = portfolio_value * self.config.max_position_pct;

        let mut allocations = Vec::with_capacity(eligible.len());
        for (candidate, weight) in eligible.into_iter().zip(weights) {
            let target_value = (available_capital * weight).min(cap);
            let shares = (target_value / candidate.entry_price).floor() as i64;

            if target_value < self.config.min_trade_value || shares < 1 {
                debug!(
                    "Dropping {}: ${:.2} below minimum trade of ${:.2}",
                    candidate.ticker, target_value, self.config.min_trade_value
                );
                continue;
            }

            allocations.push(Allocation {
                ticker: candidate.ticker.clone(),
                sector: candidate.sector.clone(),
                composite_score: candidate.composite_score,
                weight,
                target_value,
                shares,
                entry_price: candidate.entry_price,
                stop_loss: candidate.stop_loss,
                target: candidate.target,
            });
        }

        allocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::message::{MessageType, Priority};
    use std::collections::BTreeMap;

    fn snapshot(deployment_pct: f64, needs: bool, slots: u32) -> DeploymentSnapshot {
        DeploymentSnapshot {
            portfolio_value: 100_000.0,
            open_count: 10 - slots,
            pending_count: 0,
            deployed_capital: 90_000.0 * deployment_pct,
            target_capital: 90_000.0,
            available_capital: 90_000.0 * (1.0 - deployment_pct),
            available_positions: slots,
            deployment_pct,
            needs_rebalancing: needs,
            sector_weights: BTreeMap::new(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    #[test]
    fn test_weights_are_convex_and_normalized() {
        let weights = allocation_weights(&[90.0, 60.0], 2.0, 0.05);
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        // 8100 / (8100 + 3600)
        assert!((weights[0] - 0.6923).abs() < 1e-4);
        // Linear would give 0.6; convex gives more to the leader
        assert!(weights[0] > 0.6);
    }

    #[test]
    fn test_floor_weight_pins_small_allocations() {
        let weights = allocation_weights(&[100.0, 100.0, 20.0], 2.0, 0.05);
        assert!((weights[2] - 0.05).abs() < 1e-12);
        assert!((weights[0] - 0.475).abs() < 1e-12);
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_floor_too_large_falls_back_to_equal() {
        let weights = allocation_weights(&[90.0, 70.0, 65.0], 2.0, 0.5);
        assert_eq!(weights, vec![1.0 / 3.0; 3]);
    }

    #[test]
    fn test_size_candidates_caps_and_filters() {
        let rebalancer = Rebalancer::new(RebalancerConfig::default());
        let candidates = vec![
            Candidate::new("NVDA", 90.0, "Technology", 120.0),
            Candidate::new("XOM", 60.0, "Energy", 110.0),
            Candidate::new("LOW", 40.0, "Retail", 50.0),
        ];
        let allocations = rebalancer.size_candidates(&candidates, 40_000.0, 100_000.0, 5);

        assert_eq!(allocations.len(), 2);
        // 40000 × 0.692 > cap of 10000
        assert_eq!(allocations[0].ticker, "NVDA");
        assert_eq!(allocations[0].target_value, 10_000.0);
        assert_eq!(allocations[0].shares, 83);
        assert_eq!(allocations[1].ticker, "XOM");
        assert_eq!(allocations[1].target_value, 10_000.0);
    }

    #[test]
    fn test_size_candidates_drops_small_trades() {
        let rebalancer = Rebalancer::new(RebalancerConfig::default());
        let candidates = vec![
            Candidate::new("AAPL", 95.0, "Technology", 190.0),
            Candidate::new("KO", 61.0, "Staples", 60.0),
        ];
        // KO weight ~0.29 of 1500 = 437 < 500
        let allocations = rebalancer.size_candidates(&candidates, 1_500.0, 100_000.0, 5);
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].ticker, "AAPL");
    }

    #[test]
    fn test_size_candidates_respects_slots_and_duplicates() {
        let rebalancer = Rebalancer::new(RebalancerConfig::default());
        let candidates = vec![
            Candidate::new("AMD", 70.0, "Technology", 150.0),
            Candidate::new("AMD", 65.0, "Technology", 150.0),
            Candidate::new("CVX", 80.0, "Energy", 155.0),
            Candidate::new("JPM", 75.0, "Financials", 195.0),
        ];
        let allocations = rebalancer.size_candidates(&candidates, 30_000.0, 100_000.0, 2);
        let tickers: Vec<&str> = allocations.iter().map(|a| a.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["CVX", "JPM"]);
    }

    #[test]
    fn test_size_candidates_skips_invalid() {
        let rebalancer = Rebalancer::new(RebalancerConfig::default());
        let mut bad = Candidate::new("BAD", 99.0, "Technology", 10.0);
        bad.entry_price = -1.0;
        let allocations = rebalancer.size_candidates(&[bad], 10_000.0, 100_000.0, 3);
        assert!(allocations.is_empty());
    }

    #[test]
    fn test_candidate_request_when_under_deployed() {
        let rebalancer = Rebalancer::new(RebalancerConfig::default());
        let message = rebalancer
            .generate_candidate_request(&snapshot(0.556, true, 4), &["Technology".to_string()], day())
            .unwrap();

        assert_eq!(message.sender, Department::Portfolio);
        assert_eq!(message.recipient, Department::Research);
        assert_eq!(message.priority, Priority::High);
        assert_eq!(message.message_type(), MessageType::CandidateRequest);
        assert_eq!(message.idempotency_key.as_deref(), Some("candidate-request:2024-06-03"));

        match message.payload {
            Payload::CandidateRequest(request) => {
                assert_eq!(request.available_positions, 4);
                assert_eq!(request.max_candidates, 4);
                assert_eq!(request.min_composite_score, 60.0);
                assert!(request.sector_diversification);
                assert_eq!(request.excluded_sectors, vec!["Technology".to_string()]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_no_request_when_deployed_or_full() {
        let rebalancer = Rebalancer::new(RebalancerConfig::default());
        assert!(rebalancer
            .generate_candidate_request(&snapshot(0.95, false, 4), &[], day())
            .is_none());
        assert!(rebalancer
            .generate_candidate_request(&snapshot(0.5, true, 0), &[], day())
            .is_none());
    }

    #[test]
    fn test_non_convex_exponent_is_replaced() {
        for exponent in [0.5, 1.0, f64::NAN] {
            let rebalancer = Rebalancer::new(RebalancerConfig {
                score_exponent: exponent,
                ..RebalancerConfig::default()
            });
            assert_eq!(rebalancer.config().score_exponent, 2.0);
        }

        let rebalancer = Rebalancer::new(RebalancerConfig {
            score_exponent: 1.5,
            ..RebalancerConfig::default()
        });
        assert_eq!(rebalancer.config().score_exponent, 1.5);
    }

    #[test]
    fn test_reservations_reduce_availability() {
        let mut reservations = ProposalReservations::new();
        reservations.roll_to(day());
        reservations.reserve("AAPL", "list-1", 10_000.0);
        reservations.reserve("XOM", "list-1", 5_000.0);
        reservations.reserve("JPM", "list-2", 8_000.0);

        let adjusted = reservations.apply_to(&snapshot(0.5, true, 4));
        assert!((adjusted.available_capital - 22_000.0).abs() < 1e-9);
        assert_eq!(adjusted.available_positions, 1);

        assert_eq!(reservations.release("XOM"), Some(5_000.0));
        assert_eq!(reservations.release("XOM"), None);
        reservations.release_source("list-1");
        assert!(!reservations.contains("AAPL"));
        assert!(reservations.contains("JPM"));

        // never negative
        reservations.reserve("NVDA", "list-3", 100_000.0);
        let adjusted = reservations.apply_to(&snapshot(0.5, true, 1));
        assert_eq!(adjusted.available_capital, 0.0);
        assert_eq!(adjusted.available_positions, 0);
    }

    #[test]
    fn test_reservations_expire_with_the_trading_day() {
        let mut reservations = ProposalReservations::new();
        reservations.roll_to(day());
        reservations.reserve("AAPL", "list-1", 10_000.0);

        reservations.roll_to(day());
        assert_eq!(reservations.reserved_slots(), 1);

        reservations.roll_to(day().succ_opt().unwrap());
        assert_eq!(reservations.reserved_slots(), 0);
        assert_eq!(reservations.reserved_capital(), 0.0);
    }
}
