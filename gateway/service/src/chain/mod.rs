// Copyright (c) 2024 The Botho Foundation

//! Blockchain access.
//!
//! The monitor and forwarder only talk to chains through [`ChainClient`], so
//! a full node, a hosted RPC endpoint or the in-memory [`mock::MockChain`]
//! are interchangeable.

pub mod evm;
pub mod mock;

use async_trait::async_trait;
use bth_gateway_core::{coin::same_address, Amount, ConfigError, Cryptocurrency};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ChainError, GatewayError};

pub use evm::EvmChainClient;
pub use mock::MockChain;

/// Direction of a transfer relative to a watched address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// A native-coin transfer touching an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransfer {
    pub hash: String,
    pub from: String,
    pub to: String,
    pub value: Amount,
    /// Zero while the transaction is unmined
    pub confirmations: u64,
    pub block_number: Option<u64>,
    /// False when the transaction was mined but reverted
    pub success: bool,
}

impl ChainTransfer {
    /// Direction relative to `address`, or `None` if it does not touch it.
    pub fn direction(&self, address: &str) -> Option<Direction> {
        if same_address(&self.to, address) {
            Some(Direction::Incoming)
        } else if same_address(&self.from, address) {
            Some(Direction::Outgoing)
        } else {
            None
        }
    }
}

/// Inclusion state of a transaction looked up by hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStatus {
    /// Zero while the transaction sits in the mempool
    pub confirmations: u64,
    /// `None` until mined; `Some(false)` if execution reverted
    pub success: Option<bool>,
}

impl TransactionStatus {
    pub fn is_mined(&self) -> bool {
        self.success.is_some()
    }
}

/// Inputs for signing a transfer from an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    pub nonce: u64,
    pub gas_price: u128,
    pub chain_id: u64,
}

/// Read and write access to one chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn coin(&self) -> Cryptocurrency;

    /// Confirmed balance of an address.
    async fn balance(&self, address: &str) -> Result<Amount, ChainError>;

    /// Transfers to and from an address, oldest first.
    async fn transactions_for_address(&self, address: &str)
        -> Result<Vec<ChainTransfer>, ChainError>;

    /// Submit a signed transaction (`0x` hex) and return its hash.
    async fn broadcast(&self, raw_tx: &str) -> Result<String, ChainError>;

    /// Look up a transaction; `None` means the chain does not know it.
    async fn transaction(&self, hash: &str) -> Result<Option<TransactionStatus>, ChainError>;

    /// Nonce, gas price and chain id for the next transfer from `from`.
    async fn transfer_params(&self, from: &str) -> Result<TransferParams, ChainError>;
}

/// Chain clients by coin.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    clients: HashMap<Cryptocurrency, Arc<dyn ChainClient>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client: Arc<dyn ChainClient>) {
        self.clients.insert(client.coin(), client);
    }

    pub fn with(mut self, client: Arc<dyn ChainClient>) -> Self {
        self.insert(client);
        self
    }

    pub fn get(&self, coin: Cryptocurrency) -> Result<Arc<dyn ChainClient>, GatewayError> {
        self.clients
            .get(&coin)
            .cloned()
            .ok_or(GatewayError::Config(ConfigError::UnknownCoin(coin)))
    }
}
