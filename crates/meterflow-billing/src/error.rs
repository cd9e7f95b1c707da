use thiserror::Error;

pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors produced by the billing engine and its storage layer.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error during {operation}: {source}")]
    DatabaseError {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("configuration error: {message}")]
    ConfigError { message: String },

    #[error("subscription not found: {id}")]
    SubscriptionNotFound { id: String },

    #[error("billing cycle not found: {id}")]
    CycleNotFound { id: String },

    #[error("invoice not found: {id}")]
    InvoiceNotFound { id: String },

    #[error("invalid cycle state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("billing cycle {id} is not closing (state: {state})")]
    CycleNotClosing { id: String, state: String },

    #[error("no price amount in effect for currency {currency} at {at}")]
    MissingPriceAmount { currency: String, at: String },

    #[error("no usable meter for subscription item {item}")]
    MissingMeter { item: String },

    #[error("invalid quantity: {value}")]
    InvalidQuantity { value: String },

    #[error("currency mismatch: subscription bills in {expected}, price amount is {found}")]
    CurrencyMismatch { expected: String, found: String },

    #[error("billing cycle {cycle_id} has no rating results")]
    MissingRatingResults { cycle_id: String },

    #[error("invalid price tiers: {reason}")]
    InvalidPriceTiers { reason: String },

    #[error("ledger entry does not balance for {currency}: debits {debits}, credits {credits}")]
    UnbalancedLedgerEntry {
        currency: String,
        debits: i64,
        credits: i64,
    },

    #[error("invoice number template {template} has unresolved token {token}")]
    InvalidNumberTemplate { template: String, token: String },

    #[error("operation {operation} is not permitted in production")]
    ProductionOperation { operation: String },

    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },

    #[error("invalid state: {message}")]
    InvalidState { message: String },
}
