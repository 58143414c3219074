pub mod collaborator_pool;
pub mod orchestrator;
