pub mod broadcast;
pub mod ingest;
pub mod persistence;
pub mod portfolio_store;

pub use broadcast::EventBus;
