// Error taxonomy for the stake pool engine

use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::EventStatus;

/// Every way a ledger operation can be rejected.
///
/// Rejections never leave partial state behind: the storage transaction
/// that would have applied the operation is aborted before commit.
#[derive(Debug, Clone, Serialize)]
pub enum EngineError {
    /// Bad selector, amount, identifier or reason
    Validation(String),
    /// Operation not allowed from the event's current status
    InvalidTransition { op: &'static str, status: EventStatus },
    InsufficientFunds { available: Decimal, requested: Decimal },
    Unauthorized(String),
    NotFound(String),
    Storage(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        EngineError::Unauthorized(msg.into())
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        EngineError::NotFound(format!("{} {}", what, id))
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InsufficientFunds { .. } => "insufficient_funds",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::NotFound(_) => "not_found",
            EngineError::Storage(_) => "storage_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "Validation failed: {}", msg),
            EngineError::InvalidTransition { op, status } => {
                write!(f, "Cannot {} an event that is {}", op, status)
            }
            EngineError::InsufficientFunds { available, requested } => {
                write!(f, "Insufficient funds: have {}, need {}", available, requested)
            }
            EngineError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            EngineError::NotFound(what) => write!(f, "Not found: {}", what),
            EngineError::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(format!("corrupt record: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_display_messages() {
        let err = EngineError::InsufficientFunds { available: dec!(10), requested: dec!(25.50) };
        assert_eq!(err.to_string(), "Insufficient funds: have 10, need 25.50");
        assert_eq!(err.code(), "insufficient_funds");

        let err = EngineError::InvalidTransition { op: "resolve", status: EventStatus::Open };
        assert_eq!(err.to_string(), "Cannot resolve an event that is open");
    }

    #[test]
    fn test_not_found_formats_kind_and_id() {
        let err = EngineError::not_found("event", "abc");
        assert_eq!(err.to_string(), "Not found: event abc");
    }
}
