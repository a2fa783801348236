use rust_decimal::Decimal;
use thiserror::Error;

/// The six error kinds of the streaming core (policy, not type identity —
/// callers match on variant to decide log level and recovery; only
/// `InvariantViolation` in release builds drops the offending record
/// instead of propagating).
#[derive(Debug, Error)]
pub enum CoreError {
    /// WS drop, DB connect refused, broadcast timeout. Log, backoff, retry forever.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Bad JSON or missing fields from the exchange feed. Log once, skip record.
    #[error("malformed input from {source}: {reason}")]
    MalformedInput { source: String, reason: String },

    /// An output queue is full. Newest-drop at the ingestor, block downstream.
    #[error("capacity exhausted: {queue}")]
    CapacityExhausted { queue: String },

    /// A safety gate rejected an otherwise well-formed signal or order.
    #[error("rejected: {0}")]
    BusinessRejection(#[from] RejectionReason),

    /// Negative balance, non-positive tick price, candle with low>high, etc.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Portfolio file write failed. Log at warning, retry on next mutation.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

/// The business-rejection reasons enumerated in §4.5/§7, surfaced as
/// structured `log` control-plane events.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RejectionReason {
    #[error("duplicate signal {id}")]
    DuplicateSignal { id: String },

    #[error("cooldown active for {symbol}, {remaining_ms}ms remaining")]
    CooldownActive { symbol: String, remaining_ms: i64 },

    #[error("sizing produced non-positive quantity for {symbol}")]
    ZeroSizing { symbol: String },

    #[error("below min notional for {symbol}: {notional} < {floor}")]
    BelowMinNotional {
        symbol: String,
        notional: Decimal,
        floor: Decimal,
    },

    #[error("insufficient funds for {symbol}: need {need}, available {available}")]
    InsufficientFunds {
        symbol: String,
        need: Decimal,
        available: Decimal,
    },

    #[error("same-side position already open for {symbol}")]
    SameSideOpen { symbol: String },

    #[error("engine is locked out")]
    LockedOut,
}
