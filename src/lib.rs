//! Atrium Portfolio Desk Library
//!
//! Core components for the Portfolio department of a message-driven trading
//! desk: the position ledger, deployment and rebalancing services, the cycle
//! orchestrator and the storage backends behind them.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod task_runner;
