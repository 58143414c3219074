pub mod deployment_monitor;
pub mod position_ledger;
pub mod position_reconciliation;
pub mod rebalancer;
