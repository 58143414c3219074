//! Valuation collaborator
//!
//! Portfolio value, current prices and the broker's view of holdings all
//! come from outside the core. Calls go through the collaborator pool, which
//! bounds concurrency and applies a timeout.

use crate::domain::errors::CollaboratorError;
use crate::domain::services::position_reconciliation::BrokerSnapshot;
use crate::domain::value_objects::price::PriceBook;
use async_trait::async_trait;

#[async_trait]
pub trait ValuationSource: Send + Sync {
    /// Total portfolio value (cash plus holdings) used for deployment targets.
    async fn portfolio_value(&self) -> Result<f64, CollaboratorError>;

    /// Latest prices for `tickers`. Unknown tickers are simply absent.
    async fn prices(&self, tickers: &[String]) -> Result<PriceBook, CollaboratorError>;

    /// Broker-reported holdings, when the source has access to them.
    async fn broker_snapshot(&self) -> Result<Option<BrokerSnapshot>, CollaboratorError>;
}
