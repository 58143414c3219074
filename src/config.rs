use crate::application::handlers::portfolio_handler::PortfolioHandlerConfig;
use crate::application::services::collaborator_pool::CollaboratorPoolConfig;
use crate::domain::services::deployment_monitor::DeploymentConfig;
use crate::domain::services::position_reconciliation::ReconciliationConfig;
use crate::domain::services::rebalancer::RebalancerConfig;
use crate::task_runner::RetryPolicy;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the Portfolio desk
#[derive(Debug, Clone, PartialEq)]
pub struct DeskConfig {
    pub portfolio_value: f64, // Used by the static valuation source
    pub cycle_interval_seconds: u64,
    pub status_addr: SocketAddr,

    // Deployment
    pub target_deployment_ratio: f64,  // Fraction of portfolio meant to be invested
    pub min_deployment_threshold: f64, // Rebalance below this fraction of target
    pub max_positions: u32,
    pub sector_concentration_limit: f64,

    // Candidate sizing
    pub max_position_pct: f64, // Cap per position as a fraction of portfolio value
    pub min_composite_score: f64,
    pub max_candidates: u32,
    pub min_trade_value: f64,
    pub allocation_floor_weight: f64,
    pub allocation_score_exponent: f64,

    // Reconciliation
    pub stale_pending_hours: i64,
    pub price_tolerance_pct: f64,

    // Collaborators and retries
    pub collaborator_timeout_milliseconds: u64,
    pub collaborator_max_concurrency: usize,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_milliseconds: u64,
    pub retry_max_delay_milliseconds: u64,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            portfolio_value: 100_000.0,
            cycle_interval_seconds: 300,
            status_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            target_deployment_ratio: 0.90,
            min_deployment_threshold: 0.85,
            max_positions: 10,
            sector_concentration_limit: 0.30,
            max_position_pct: 0.10,
            min_composite_score: 60.0,
            max_candidates: 10,
            min_trade_value: 500.0,
            allocation_floor_weight: 0.05,
            allocation_score_exponent: 2.0,
            stale_pending_hours: 48,
            price_tolerance_pct: 0.02,
            collaborator_timeout_milliseconds: 5000,
            collaborator_max_concurrency: 4,
            retry_max_attempts: 3,
            retry_initial_delay_milliseconds: 100,
            retry_max_delay_milliseconds: 2000,
        }
    }
}

/// Reads `name` through `lookup`, keeping `current` when the variable is
/// absent, unparseable or rejected by `valid`.
fn read_var<T, L, V>(lookup: &L, name: &str, current: T, rule: &str, valid: V) -> T
where
    T: FromStr + Display + Copy,
    T::Err: Display,
    L: Fn(&str) -> Option<String>,
    V: Fn(T) -> bool,
{
    let Some(raw) = lookup(name) else {
        return current;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(value) => value,
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {} ({}), using default: {}",
                name,
                value,
                rule,
                current
            );
            current
        }
        Err(e) => {
            tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {}",
                name,
                raw,
                e,
                current
            );
            current
        }
    }
}

fn is_fraction(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}

impl DeskConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> DeskConfig {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any key/value source. Invalid values are
    /// logged and ignored.
    pub fn from_lookup<L>(lookup: L) -> DeskConfig
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut c = DeskConfig::default();
        let l = &lookup;

        c.portfolio_value = read_var(l, "PORTFOLIO_VALUE", c.portfolio_value, "must be positive", |v: f64| {
            v.is_finite() && v > 0.0
        });
        c.cycle_interval_seconds = read_var(
            l,
            "CYCLE_INTERVAL_SECONDS",
            c.cycle_interval_seconds,
            "must be between 1 and 86400",
            |v: u64| (1..=86_400).contains(&v),
        );
        c.status_addr = read_var(l, "STATUS_ADDR", c.status_addr, "must be host:port", |_| true);

        c.target_deployment_ratio = read_var(
            l,
            "TARGET_DEPLOYMENT_RATIO",
            c.target_deployment_ratio,
            "must be in (0, 1]",
            is_fraction,
        );
        c.min_deployment_threshold = read_var(
            l,
            "MIN_DEPLOYMENT_THRESHOLD",
            c.min_deployment_threshold,
            "must be in (0, 1]",
            is_fraction,
        );
        c.max_positions = read_var(l, "MAX_POSITIONS", c.max_positions, "must be between 1 and 100", |v: u32| {
            (1..=100).contains(&v)
        });
        c.sector_concentration_limit = read_var(
            l,
            "SECTOR_CONCENTRATION_LIMIT",
            c.sector_concentration_limit,
            "must be in (0, 1]",
            is_fraction,
        );

        c.max_position_pct = read_var(l, "MAX_POSITION_PCT", c.max_position_pct, "must be in (0, 1]", is_fraction);
        c.min_composite_score = read_var(
            l,
            "MIN_COMPOSITE_SCORE",
            c.min_composite_score,
            "must be between 0 and 100",
            |v: f64| (0.0..=100.0).contains(&v),
        );
        c.max_candidates = read_var(l, "MAX_CANDIDATES", c.max_candidates, "must be between 1 and 100", |v: u32| {
            (1..=100).contains(&v)
        });
        c.min_trade_value = read_var(l, "MIN_TRADE_VALUE", c.min_trade_value, "must be non-negative", |v: f64| {
            v.is_finite() && v >= 0.0
        });
        c.allocation_floor_weight = read_var(
            l,
            "ALLOCATION_FLOOR_WEIGHT",
            c.allocation_floor_weight,
            "must be in [0, 1)",
            |v: f64| (0.0..1.0).contains(&v),
        );
        c.allocation_score_exponent = read_var(
            l,
            "ALLOCATION_SCORE_EXPONENT",
            c.allocation_score_exponent,
            "must be above 1 and at most 10",
            |v: f64| v > 1.0 && v <= 10.0,
        );

        c.stale_pending_hours = read_var(
            l,
            "STALE_PENDING_HOURS",
            c.stale_pending_hours,
            "must be between 1 and 720",
            |v: i64| (1..=720).contains(&v),
        );
        c.price_tolerance_pct = read_var(
            l,
            "PRICE_TOLERANCE_PCT",
            c.price_tolerance_pct,
            "must be between 0 and 0.5",
            |v: f64| (0.0..=0.5).contains(&v),
        );

        c.collaborator_timeout_milliseconds = read_var(
            l,
            "COLLABORATOR_TIMEOUT_MILLISECONDS",
            c.collaborator_timeout_milliseconds,
            "must be between 100 and 60000",
            |v: u64| (100..=60_000).contains(&v),
        );
        c.collaborator_max_concurrency = read_var(
            l,
            "COLLABORATOR_MAX_CONCURRENCY",
            c.collaborator_max_concurrency,
            "must be between 1 and 64",
            |v: usize| (1..=64).contains(&v),
        );
        c.retry_max_attempts = read_var(
            l,
            "RETRY_MAX_ATTEMPTS",
            c.retry_max_attempts,
            "must be between 1 and 10",
            |v: u32| (1..=10).contains(&v),
        );
        c.retry_initial_delay_milliseconds = read_var(
            l,
            "RETRY_INITIAL_DELAY_MILLISECONDS",
            c.retry_initial_delay_milliseconds,
            "must be between 1 and 60000",
            |v: u64| (1..=60_000).contains(&v),
        );
        c.retry_max_delay_milliseconds = read_var(
            l,
            "RETRY_MAX_DELAY_MILLISECONDS",
            c.retry_max_delay_milliseconds,
            "must be between 1 and 300000",
            |v: u64| (1..=300_000).contains(&v),
        );

        if c.retry_max_delay_milliseconds < c.retry_initial_delay_milliseconds {
            tracing::warn!(
                "RETRY_MAX_DELAY_MILLISECONDS {} is below the initial delay, raising it to {}",
                c.retry_max_delay_milliseconds,
                c.retry_initial_delay_milliseconds
            );
            c.retry_max_delay_milliseconds = c.retry_initial_delay_milliseconds;
        }

        c
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_seconds)
    }

    pub fn deployment_config(&self) -> DeploymentConfig {
        DeploymentConfig {
            target_deployment_ratio: self.target_deployment_ratio,
            min_deployment_threshold: self.min_deployment_threshold,
            max_positions: self.max_positions,
            sector_concentration_limit: self.sector_concentration_limit,
        }
    }

    pub fn rebalancer_config(&self) -> RebalancerConfig {
        RebalancerConfig {
            min_composite_score: self.min_composite_score,
            max_candidates: self.max_candidates,
            max_position_pct: self.max_position_pct,
            min_trade_value: self.min_trade_value,
            floor_weight: self.allocation_floor_weight,
            score_exponent: self.allocation_score_exponent,
            ..RebalancerConfig::default()
        }
    }

    pub fn reconciliation_config(&self) -> ReconciliationConfig {
        ReconciliationConfig {
            stale_pending_after: chrono::Duration::hours(self.stale_pending_hours),
            price_tolerance_pct: self.price_tolerance_pct,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_milliseconds),
            max_delay: Duration::from_millis(self.retry_max_delay_milliseconds),
        }
    }

    pub fn portfolio_handler_config(&self) -> PortfolioHandlerConfig {
        PortfolioHandlerConfig {
            deployment: self.deployment_config(),
            rebalancer: self.rebalancer_config(),
            retry: self.retry_policy(),
        }
    }

    pub fn collaborator_pool_config(&self) -> CollaboratorPoolConfig {
        CollaboratorPoolConfig {
            max_concurrency: self.collaborator_max_concurrency,
            call_timeout: Duration::from_millis(self.collaborator_timeout_milliseconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = DeskConfig::default();
        assert_eq!(config.target_deployment_ratio, 0.90);
        assert_eq!(config.min_deployment_threshold, 0.85);
        assert_eq!(config.max_positions, 10);
        assert_eq!(config.max_position_pct, 0.10);
        assert_eq!(config.sector_concentration_limit, 0.30);
        assert_eq!(config.min_composite_score, 60.0);
        assert_eq!(config.stale_pending_hours, 48);
        assert_eq!(config.deployment_config(), DeploymentConfig::default());
        assert_eq!(config.rebalancer_config(), RebalancerConfig::default());
        assert_eq!(config.reconciliation_config(), ReconciliationConfig::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = DeskConfig::from_lookup(lookup(&[
            ("PORTFOLIO_VALUE", "250000"),
            ("MAX_POSITIONS", "15"),
            ("TARGET_DEPLOYMENT_RATIO", "0.8"),
            ("STALE_PENDING_HOURS", "24"),
            ("STATUS_ADDR", "0.0.0.0:8080"),
            ("COLLABORATOR_TIMEOUT_MILLISECONDS", "750"),
        ]));
        assert_eq!(config.portfolio_value, 250_000.0);
        assert_eq!(config.max_positions, 15);
        assert_eq!(config.target_deployment_ratio, 0.8);
        assert_eq!(config.reconciliation_config().stale_pending_after, chrono::Duration::hours(24));
        assert_eq!(config.status_addr.port(), 8080);
        assert_eq!(
            config.collaborator_pool_config().call_timeout,
            Duration::from_millis(750)
        );
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = DeskConfig::from_lookup(lookup(&[
            ("PORTFOLIO_VALUE", "-5"),
            ("MAX_POSITIONS", "lots"),
            ("SECTOR_CONCENTRATION_LIMIT", "1.5"),
            ("STATUS_ADDR", "nowhere"),
        ]));
        let defaults = DeskConfig::default();
        assert_eq!(config.portfolio_value, defaults.portfolio_value);
        assert_eq!(config.max_positions, defaults.max_positions);
        assert_eq!(config.sector_concentration_limit, defaults.sector_concentration_limit);
        assert_eq!(config.status_addr, defaults.status_addr);
    }

    #[test]
    fn test_retry_delays_stay_ordered() {
        let config = DeskConfig::from_lookup(lookup(&[
            ("RETRY_INITIAL_DELAY_MILLISECONDS", "500"),
            ("RETRY_MAX_DELAY_MILLISECONDS", "200"),
        ]));
        let policy = config.retry_policy();
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_score_exponent_must_be_convex() {
        for value in ["0.5", "1.0"] {
            let config = DeskConfig::from_lookup(lookup(&[("ALLOCATION_SCORE_EXPONENT", value)]));
            assert_eq!(config.allocation_score_exponent, 2.0);
        }

        let config = DeskConfig::from_lookup(lookup(&[("ALLOCATION_SCORE_EXPONENT", "1.5")]));
        assert_eq!(config.rebalancer_config().score_exponent, 1.5);
    }
}
