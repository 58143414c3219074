pub mod portfolio_handler;
pub mod status_handler;
