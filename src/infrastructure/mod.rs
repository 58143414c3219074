pub mod memory_bus;
pub mod memory_store;
pub mod valuation;
