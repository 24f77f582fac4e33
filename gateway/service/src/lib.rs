// Copyright (c) 2024 The Botho Foundation

//! Deposit-address payment gateway service.
//!
//! Persists payment sessions in SQLite, watches their addresses on-chain and
//! forwards confirmed deposits to the consolidation address of each coin.

pub mod allocator;
pub mod backoff;
pub mod chain;
pub mod engine;
pub mod error;
pub mod forwarder;
pub mod monitor;
pub mod price;
pub mod store;

pub use allocator::AddressAllocator;
pub use chain::{ChainClient, ChainRegistry, EvmChainClient, MockChain};
pub use engine::{Engine, TickSummary};
pub use error::{ChainError, GatewayError, StoreError};
pub use forwarder::ForwardingEngine;
pub use monitor::DepositMonitor;
pub use price::{HttpPriceOracle, PriceOracle, StaticPriceOracle};
pub use store::{SessionStore, StoredSession};
