//! Position entity and its lifecycle state machine
//!
//! ```text
//! PENDING --fill(full)-->    OPEN
//! PENDING --fill(partial)--> OPEN   (remainder is not pursued)
//! PENDING --cancel/reject--> REJECTED
//! OPEN    --exit-->          CLOSED
//! ```
//!
//! CLOSED and REJECTED are terminal. Transitions never mutate in place: each
//! one returns the next version of the position, which the ledger persists
//! with a compare-and-set on the previous status.

use crate::domain::errors::{LedgerError, ValidationError};
use crate::domain::value_objects::{pnl::PnL, price::Price, shares::Shares};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const UNKNOWN_SECTOR: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
    Rejected,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "PENDING",
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Rejected)
    }

    /// Next status for `transition`, or `None` when the state machine does
    /// not allow it.
    pub fn after(&self, transition: Transition) -> Option<PositionStatus> {
        match (self, transition) {
            (PositionStatus::Pending, Transition::Fill) => Some(PositionStatus::Open),
            (PositionStatus::Pending, Transition::Reject) => Some(PositionStatus::Rejected),
            (PositionStatus::Open, Transition::Close) => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PositionStatus::Pending),
            "OPEN" => Ok(PositionStatus::Open),
            "CLOSED" => Ok(PositionStatus::Closed),
            "REJECTED" => Ok(PositionStatus::Rejected),
            other => Err(ValidationError::InvalidPayload(format!(
                "unknown position status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Fill,
    Reject,
    Close,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transition::Fill => "fill",
            Transition::Reject => "reject",
            Transition::Close => "close",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExitReason {
    Target,
    Stop,
    Time,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Target => "TARGET",
            ExitReason::Stop => "STOP",
            ExitReason::Time => "TIME",
            ExitReason::Manual => "MANUAL",
        }
    }
}

impl FromStr for ExitReason {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TARGET" => Ok(ExitReason::Target),
            "STOP" => Ok(ExitReason::Stop),
            "TIME" => Ok(ExitReason::Time),
            "MANUAL" => Ok(ExitReason::Manual),
            other => Err(ValidationError::InvalidPayload(format!(
                "unknown exit reason '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FillKind {
    Full,
    Partial,
}

impl FillKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillKind::Full => "FULL",
            FillKind::Partial => "PARTIAL",
        }
    }
}

impl FromStr for FillKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FULL" => Ok(FillKind::Full),
            "PARTIAL" => Ok(FillKind::Partial),
            other => Err(ValidationError::InvalidPayload(format!(
                "unknown fill kind '{}'",
                other
            ))),
        }
    }
}

/// An approved sizing decision, ready to become a PENDING position.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub ticker: String,
    pub sector: Option<String>,
    pub shares: Shares,
    pub entry_price: Price,
    pub stop_loss: Option<Price>,
    pub target: Option<Price>,
}

impl OrderIntent {
    /// Builds an intent from raw values, rejecting non-positive shares or
    /// prices.
    pub fn new(
        ticker: &str,
        sector: Option<&str>,
        shares: i64,
        entry_price: f64,
        stop_loss: Option<f64>,
        target: Option<f64>,
    ) -> Result<Self, ValidationError> {
        if ticker.trim().is_empty() {
            return Err(ValidationError::InvalidTicker("ticker is empty".to_string()));
        }
        Ok(Self {
            ticker: ticker.to_string(),
            sector: sector.map(str::to_string),
            shares: Shares::new(shares)?,
            entry_price: Price::new(entry_price)?,
            stop_loss: stop_loss.map(Price::new).transpose()?,
            target: target.map(Price::new).transpose()?,
        })
    }
}

/// A tracked unit of market exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub position_id: String,
    pub ticker: String,
    pub sector: Option<String>,
    pub status: PositionStatus,

    pub intended_entry_price: Price,
    pub intended_shares: Shares,
    pub intended_stop_loss: Option<Price>,
    pub intended_target: Option<Price>,

    pub actual_entry_price: Option<Price>,
    pub actual_shares: Option<Shares>,
    pub actual_entry_date: Option<DateTime<Utc>>,
    pub fill_kind: Option<FillKind>,

    pub exit_price: Option<Price>,
    pub exit_date: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<PnL>,
    pub rejection_reason: Option<String>,

    pub risk_per_share: Option<f64>,
    pub total_risk: Option<f64>,

    pub order_msg_id: String,
    pub risk_msg_id: Option<String>,
    pub fill_msg_id: Option<String>,
    pub exit_msg_id: Option<String>,
    pub reject_msg_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn pending(
        position_id: String,
        intent: &OrderIntent,
        order_msg_id: &str,
        risk_msg_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        // Risk is only defined for a stop below the entry.
        let risk_per_share = intent
            .stop_loss
            .map(|stop| intent.entry_price.value() - stop.value())
            .filter(|risk| *risk > 0.0);
        let total_risk = risk_per_share.map(|r| r * intent.shares.value() as f64);

        Position {
            position_id,
            ticker: intent.ticker.clone(),
            sector: intent.sector.clone(),
            status: PositionStatus::Pending,
            intended_entry_price: intent.entry_price,
            intended_shares: intent.shares,
            intended_stop_loss: intent.stop_loss,
            intended_target: intent.target,
            actual_entry_price: None,
            actual_shares: None,
            actual_entry_date: None,
            fill_kind: None,
            exit_price: None,
            exit_date: None,
            exit_reason: None,
            realized_pnl: None,
            rejection_reason: None,
            risk_per_share,
            total_risk,
            order_msg_id: order_msg_id.to_string(),
            risk_msg_id: risk_msg_id.map(str::to_string),
            fill_msg_id: None,
            exit_msg_id: None,
            reject_msg_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn guard(&self, transition: Transition) -> Result<PositionStatus, LedgerError> {
        self.status
            .after(transition)
            .ok_or_else(|| LedgerError::StateConflict {
                position_id: self.position_id.clone(),
                current: self.status,
                attempted: transition,
            })
    }

    /// PENDING → OPEN. A fill smaller than intended is classified PARTIAL and
    /// the remainder is dropped.
    pub fn fill(
        &self,
        filled_shares: Shares,
        fill_price: Price,
        fill_date: DateTime<Utc>,
        fill_msg_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Position, LedgerError> {
        let next = self.guard(Transition::Fill)?;
        if filled_shares > self.intended_shares {
            return Err(ValidationError::InvalidShares(format!(
                "filled {} exceeds intended {} for {}",
                filled_shares, self.intended_shares, self.position_id
            ))
            .into());
        }

        let kind = if filled_shares == self.intended_shares {
            FillKind::Full
        } else {
            FillKind::Partial
        };

        let mut filled = self.clone();
        filled.status = next;
        filled.actual_entry_price = Some(fill_price);
        filled.actual_shares = Some(filled_shares);
        filled.actual_entry_date = Some(fill_date);
        filled.fill_kind = Some(kind);
        filled.fill_msg_id = Some(fill_msg_id.to_string());
        filled.total_risk = filled
            .risk_per_share
            .map(|r| r * filled_shares.value() as f64);
        filled.updated_at = now;
        Ok(filled)
    }

    /// OPEN → CLOSED, realizing `(exit - actual_entry) × actual_shares`.
    pub fn close(
        &self,
        exit_price: Price,
        exit_date: DateTime<Utc>,
        exit_reason: ExitReason,
        exit_msg_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Position, LedgerError> {
        let next = self.guard(Transition::Close)?;
        let (entry, shares) = match (self.actual_entry_price, self.actual_shares) {
            (Some(entry), Some(shares)) => (entry, shares),
            _ => {
                return Err(ValidationError::InvalidPayload(format!(
                    "open position {} has no fill recorded",
                    self.position_id
                ))
                .into())
            }
        };

        let mut closed = self.clone();
        closed.status = next;
        closed.exit_price = Some(exit_price);
        closed.exit_date = Some(exit_date);
        closed.exit_reason = Some(exit_reason);
        closed.realized_pnl = Some(PnL::from_move(entry, exit_price, shares));
        closed.exit_msg_id = Some(exit_msg_id.to_string());
        closed.updated_at = now;
        Ok(closed)
    }

    /// PENDING → REJECTED.
    pub fn reject(
        &self,
        reason: &str,
        reject_msg_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Position, LedgerError> {
        let next = self.guard(Transition::Reject)?;
        let mut rejected = self.clone();
        rejected.status = next;
        rejected.rejection_reason = Some(reason.to_string());
        rejected.reject_msg_id = Some(reject_msg_id.to_string());
        rejected.updated_at = now;
        Ok(rejected)
    }

    /// True when `message_id` already drove a transition of this position.
    pub fn has_applied(&self, message_id: &str) -> bool {
        [&self.fill_msg_id, &self.exit_msg_id, &self.reject_msg_id]
            .iter()
            .any(|id| id.as_deref() == Some(message_id))
    }

    /// Capital committed: actual cost when OPEN, intended cost when PENDING.
    pub fn committed_capital(&self) -> f64 {
        match self.status {
            PositionStatus::Open => self.cost_basis(),
            PositionStatus::Pending => self.intended_shares.notional(self.intended_entry_price.value()),
            PositionStatus::Closed | PositionStatus::Rejected => 0.0,
        }
    }

    /// `actual_shares × actual_entry_price`, zero before a fill.
    pub fn cost_basis(&self) -> f64 {
        match (self.actual_shares, self.actual_entry_price) {
            (Some(shares), Some(price)) => shares.notional(price.value()),
            _ => 0.0,
        }
    }

    /// Market value of an OPEN position, falling back to cost when no
    /// current price is known.
    pub fn market_value(&self, current: Option<Price>) -> f64 {
        if self.status != PositionStatus::Open {
            return 0.0;
        }
        match (self.actual_shares, current) {
            (Some(shares), Some(price)) => shares.notional(price.value()),
            _ => self.cost_basis(),
        }
    }

    pub fn unrealized_pnl(&self, current: Price) -> Option<PnL> {
        if self.status != PositionStatus::Open {
            return None;
        }
        Some(PnL::from_move(self.actual_entry_price?, current, self.actual_shares?))
    }

    /// Shares that were intended but never filled.
    pub fn unfilled_shares(&self) -> i64 {
        self.actual_shares
            .map(|filled| self.intended_shares.shortfall(filled))
            .unwrap_or(0)
    }

    pub fn sector_or_unknown(&self) -> &str {
        self.sector.as_deref().unwrap_or(UNKNOWN_SECTOR)
    }
}

/// Append-only record of a position transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub position_id: String,
    pub from_status: Option<PositionStatus>,
    pub to_status: PositionStatus,
    pub message_id: Option<String>,
    pub detail: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl PositionEvent {
    pub fn created(position: &Position) -> Self {
        Self {
            position_id: position.position_id.clone(),
            from_status: None,
            to_status: position.status,
            message_id: Some(position.order_msg_id.clone()),
            detail: serde_json::json!({
                "ticker": position.ticker,
                "intended_shares": position.intended_shares.value(),
                "intended_entry_price": position.intended_entry_price.value(),
            }),
            recorded_at: position.created_at,
        }
    }

    pub fn transitioned(
        before: &Position,
        after: &Position,
        message_id: &str,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            position_id: after.position_id.clone(),
            from_status: Some(before.status),
            to_status: after.status,
            message_id: Some(message_id.to_string()),
            detail,
            recorded_at: after.updated_at,
        }
    }
}
