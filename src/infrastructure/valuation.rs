//! Fixed valuation source
//!
//! Serves a configured portfolio value and whatever prices and broker
//! holdings have been loaded into it. Used by the binary when no market-data
//! feed is wired in, and by tests to drive deployment scenarios.

use crate::domain::errors::CollaboratorError;
use crate::domain::repositories::valuation_source::ValuationSource;
use crate::domain::services::position_reconciliation::BrokerSnapshot;
use crate::domain::value_objects::price::{Price, PriceBook};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct ValuationState {
    portfolio_value: f64,
    prices: PriceBook,
    broker: Option<BrokerSnapshot>,
    latency: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct StaticValuation {
    state: Arc<RwLock<ValuationState>>,
}

impl StaticValuation {
    pub fn new(portfolio_value: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(ValuationState {
                portfolio_value,
                ..ValuationState::default()
            })),
        }
    }

    pub async fn set_portfolio_value(&self, value: f64) {
        self.state.write().await.portfolio_value = value;
    }

    pub async fn set_price(&self, ticker: &str, price: Price) {
        self.state.write().await.prices.insert(ticker.to_string(), price);
    }

    pub async fn set_broker_snapshot(&self, snapshot: Option<BrokerSnapshot>) {
        self.state.write().await.broker = snapshot;
    }

    /// Delays every call, to exercise caller-side timeouts.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.write().await.latency = latency;
    }

    async fn simulate_latency(&self) {
        let latency = self.state.read().await.latency;
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ValuationSource for StaticValuation {
    async fn portfolio_value(&self) -> Result<f64, CollaboratorError> {
        self.simulate_latency().await;
        let value = self.state.read().await.portfolio_value;
        if !value.is_finite() || value <= 0.0 {
            return Err(CollaboratorError::Failed(format!(
                "portfolio value {} is not usable",
                value
            )));
        }
        Ok(value)
    }

    async fn prices(&self, tickers: &[String]) -> Result<PriceBook, CollaboratorError> {
        self.simulate_latency().await;
        let state = self.state.read().await;
        Ok(tickers
            .iter()
            .filter_map(|t| state.prices.get(t).map(|p| (t.clone(), *p)))
            .collect())
    }

    async fn broker_snapshot(&self) -> Result<Option<BrokerSnapshot>, CollaboratorError> {
        self.simulate_latency().await;
        Ok(self.state.read().await.broker.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prices_only_for_requested_tickers() {
        let valuation = StaticValuation::new(100_000.0);
        valuation.set_price("AAPL", Price::new(190.0).unwrap()).await;
        valuation.set_price("MSFT", Price::new(410.0).unwrap()).await;

        let prices = valuation
            .prices(&["AAPL".to_string(), "TSLA".to_string()])
            .await
            .unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices.get("AAPL").map(|p| p.value()), Some(190.0));
    }

    #[tokio::test]
    async fn test_unusable_portfolio_value() {
        let valuation = StaticValuation::new(0.0);
        assert!(valuation.portfolio_value().await.is_err());
        valuation.set_portfolio_value(250_000.0).await;
        assert_eq!(valuation.portfolio_value().await.unwrap(), 250_000.0);
    }
}
