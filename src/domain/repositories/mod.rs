pub mod message_bus;
pub mod position_store;
pub mod valuation_source;
