pub mod candle_aggregator;
pub mod candle_dispatcher;
pub mod dispatcher;
pub mod execution;
pub mod ingestor;
pub mod pnl_broadcaster;
pub mod strategy;
