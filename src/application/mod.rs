// Agent modules - the core decision-making pipeline stages (§4, §5)
pub mod agents;

// Wires the stages together into a running system, or a backtest replay
pub mod pipeline;
