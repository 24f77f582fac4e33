// Copyright (c) 2024 The Botho Foundation

//! Core types and logic for the deposit-address payment gateway.
//!
//! This crate holds everything that does not touch the network or disk:
//!
//! - Supported coins and exact base-unit amounts
//! - The payment session record and its state machine
//! - Configuration structures
//! - HD key derivation for payment addresses
//! - Platform fee computation
//! - EVM transfer encoding and signing

pub mod amount;
pub mod coin;
pub mod config;
pub mod fee;
pub mod keys;
pub mod session;
pub mod tx;

pub use amount::{format_amount, parse_amount, Amount, AmountError};
pub use coin::Cryptocurrency;
pub use config::{CoinConfig, ConfigError, FeeTier, GatewayConfig, RetrySettings};
pub use fee::{FeeEngine, FeeError, FeePolicy, FeeSplit};
pub use keys::{DerivedKey, KeyDeriver, KeyError, MasterSeed};
pub use session::{HistoryEvent, HistoryEventType, Session, SessionStatus};
pub use tx::{DecodedTransaction, LegacyTransaction, SignedTransaction, TxError};
