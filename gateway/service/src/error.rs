// Copyright (c) 2024 The Botho Foundation

//! Error types for the gateway service.

use bth_gateway_core::{
    session::SessionStatus, ConfigError, Cryptocurrency, FeeError, KeyError, TxError,
};
use thiserror::Error;
use uuid::Uuid;

/// Errors from the session store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stale write for session {id}: expected version {expected}")]
    StaleWrite { id: Uuid, expected: u64 },

    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lock poisoned: {0}")]
    Lock(String),
}

/// Errors from a chain client.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// Timeout or unreachable endpoint; worth retrying
    #[error("transient chain error: {0}")]
    Transient(String),

    /// The node refused the request
    #[error("rejected by node: {0}")]
    Rejected(String),

    #[error("insufficient funds for network fee: {0}")]
    InsufficientFundsForFee(String),

    /// The node answered with something we cannot interpret
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }
}

/// Gateway error taxonomy.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad seed, path, index or input; never retried
    #[error("validation error: {0}")]
    Validation(String),

    /// Concurrent update; retry with a fresh read
    #[error("stale write: {0}")]
    StaleWrite(String),

    #[error("transient chain error: {0}")]
    TransientChain(String),

    #[error("insufficient funds for network fee: {0}")]
    InsufficientFundsForFee(String),

    #[error("re-org detected: {0}")]
    ReorgDetected(String),

    #[error("address index space exhausted for {coin} (max {max_index})")]
    AllocationExhausted {
        coin: Cryptocurrency,
        max_index: u64,
    },

    #[error("price unavailable: {0}")]
    PriceUnavailable(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Chain(ChainError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GatewayError {
    /// Whether a failed automatic step should hand the session to an
    /// operator. Transient failures are retried on the next pass instead;
    /// store and configuration faults are not about the session itself.
    pub fn needs_review(&self) -> bool {
        !matches!(
            self,
            GatewayError::StaleWrite(_)
                | GatewayError::TransientChain(_)
                | GatewayError::PriceUnavailable(_)
                | GatewayError::Store(_)
                | GatewayError::Config(_)
        )
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StaleWrite { .. } => GatewayError::StaleWrite(err.to_string()),
            other => GatewayError::Store(other),
        }
    }
}

impl From<ChainError> for GatewayError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Transient(msg) => GatewayError::TransientChain(msg),
            ChainError::InsufficientFundsForFee(msg) => GatewayError::InsufficientFundsForFee(msg),
            other => GatewayError::Chain(other),
        }
    }
}

impl From<KeyError> for GatewayError {
    fn from(err: KeyError) -> Self {
        GatewayError::Validation(err.to_string())
    }
}

impl From<TxError> for GatewayError {
    fn from(err: TxError) -> Self {
        GatewayError::Validation(err.to_string())
    }
}

impl From<FeeError> for GatewayError {
    fn from(err: FeeError) -> Self {
        GatewayError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_mapping() {
        let stale: GatewayError = StoreError::StaleWrite {
            id: Uuid::nil(),
            expected: 3,
        }
        .into();
        assert!(matches!(stale, GatewayError::StaleWrite(_)));

        let transient: GatewayError = ChainError::Transient("timeout".to_string()).into();
        assert!(matches!(transient, GatewayError::TransientChain(_)));

        let funds: GatewayError =
            ChainError::InsufficientFundsForFee("balance 1".to_string()).into();
        assert!(matches!(funds, GatewayError::InsufficientFundsForFee(_)));

        let key: GatewayError = KeyError::InvalidPath("index 1".to_string()).into();
        assert!(matches!(key, GatewayError::Validation(_)));
    }

    #[test]
    fn test_needs_review() {
        let malformed: GatewayError = ChainError::Malformed("bad json".to_string()).into();
        assert!(malformed.needs_review());
        assert!(GatewayError::Validation("chain id".to_string()).needs_review());

        let transient: GatewayError = ChainError::Transient("timeout".to_string()).into();
        assert!(!transient.needs_review());
        assert!(!GatewayError::StaleWrite("v3".to_string()).needs_review());
        assert!(!GatewayError::PriceUnavailable("down".to_string()).needs_review());
        assert!(!GatewayError::Config(ConfigError::Invalid("no chain".to_string())).needs_review());
    }
}
