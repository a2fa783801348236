// Domain-specific error types
pub mod errors;

// Port interfaces (persistence, broadcast) implemented by infrastructure adapters
pub mod ports;

// Core trading domain: ticks, candles, signals, positions, portfolio
pub mod trading;

// Rolling technical indicators (SMA/ATR/ADX)
pub mod indicators;

// Online logistic-SGD classifier
pub mod learner;
