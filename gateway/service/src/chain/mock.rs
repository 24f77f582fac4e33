// Copyright (c) 2024 The Botho Foundation

//! In-memory chain for tests and dry runs.
//!
//! Broadcasts are decoded and validated (sender, nonce, balance) so the
//! forwarding engine is exercised against the same rules a node applies.
//! Tests drive the chain with deposits, confirmations, re-orgs, dropped
//! transactions and scripted failures.

use async_trait::async_trait;
use bth_gateway_core::{
    coin::same_address, keys::checksum_encode, Amount, Cryptocurrency, SignedTransaction,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{ChainClient, ChainTransfer, TransactionStatus, TransferParams};
use crate::error::ChainError;

#[derive(Debug, Clone)]
struct MockTx {
    transfer: ChainTransfer,
    /// Network fee charged to the sender
    fee: Amount,
    /// Sender nonce for outgoing transactions
    nonce: Option<u64>,
    mined: bool,
}

#[derive(Debug, Default)]
struct MockState {
    txs: Vec<MockTx>,
    balances: HashMap<String, Amount>,
    nonces: HashMap<String, u64>,
    gas_price: u128,
    next_id: u64,
    broadcast_failures: VecDeque<ChainError>,
    lost_responses: u32,
    query_failures: VecDeque<ChainError>,
    broadcast_attempts: u32,
}

impl MockState {
    fn credit(&mut self, address: &str, amount: Amount) {
        *self.balances.entry(address.to_lowercase()).or_default() += amount;
    }

    fn debit(&mut self, address: &str, amount: Amount) {
        let balance = self.balances.entry(address.to_lowercase()).or_default();
        *balance = balance.saturating_sub(amount);
    }

    fn balance(&self, address: &str) -> Amount {
        self.balances
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or_default()
    }

    fn take_query_failure(&mut self) -> Result<(), ChainError> {
        match self.query_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Undo the balance effects of a transaction leaving the chain.
    fn unwind(&mut self, tx: &MockTx) {
        self.debit(&tx.transfer.to, tx.transfer.value);
        if tx.nonce.is_some() {
            self.credit(&tx.transfer.from, tx.transfer.value + tx.fee);
            let nonce = self.nonces.entry(tx.transfer.from.to_lowercase()).or_default();
            *nonce = nonce.saturating_sub(1);
        }
    }
}

/// In-memory [`ChainClient`].
pub struct MockChain {
    coin: Cryptocurrency,
    chain_id: u64,
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(coin: Cryptocurrency) -> Self {
        Self {
            coin,
            chain_id: coin.default_chain_id(),
            state: Mutex::new(MockState {
                gas_price: 1_000_000_000,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_gas_price(&self, gas_price: u128) {
        self.state().gas_price = gas_price;
    }

    /// Send `value` from an outside wallet to `to`; returns the tx hash.
    ///
    /// A deposit with zero confirmations sits in the mempool and is not yet
    /// listed for the address.
    pub fn deposit(&self, to: &str, value: Amount, confirmations: u64) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let next_id = state.next_id;
        let hash = format!("0x{:064x}", next_id);
        state.txs.push(MockTx {
            transfer: ChainTransfer {
                hash: hash.clone(),
                from: "0x00000000000000000000000000000000000000ff".to_string(),
                to: to.to_string(),
                value,
                confirmations,
                block_number: (confirmations > 0).then_some(1_000 + next_id),
                success: true,
            },
            fee: 0,
            nonce: None,
            mined: confirmations > 0,
        });
        state.credit(to, value);
        hash
    }

    /// Set the confirmation count of one transaction, mining it if needed.
    pub fn set_confirmations(&self, hash: &str, confirmations: u64) {
        let mut state = self.state();
        if let Some(tx) = state.txs.iter_mut().find(|tx| tx.transfer.hash == hash) {
            tx.transfer.confirmations = confirmations;
            tx.mined = confirmations > 0;
        }
    }

    /// Mine every transaction and raise its confirmations to at least `n`.
    pub fn confirm_all(&self, confirmations: u64) {
        let mut state = self.state();
        for tx in state.txs.iter_mut() {
            tx.transfer.confirmations = tx.transfer.confirmations.max(confirmations);
            tx.mined = confirmations > 0;
        }
    }

    /// Remove a transaction as if a re-org or eviction dropped it.
    pub fn remove_transaction(&self, hash: &str) {
        let mut state = self.state();
        if let Some(pos) = state.txs.iter().position(|tx| tx.transfer.hash == hash) {
            let tx = state.txs.remove(pos);
            state.unwind(&tx);
        }
    }

    /// Mark a transaction as mined but reverted.
    pub fn revert_transaction(&self, hash: &str, confirmations: u64) {
        let mut state = self.state();
        if let Some(pos) = state.txs.iter().position(|tx| tx.transfer.hash == hash) {
            let tx = state.txs[pos].clone();
            state.debit(&tx.transfer.to, tx.transfer.value);
            state.credit(&tx.transfer.from, tx.transfer.value);
            let entry = &mut state.txs[pos];
            entry.transfer.success = false;
            entry.transfer.confirmations = confirmations;
            entry.mined = true;
        }
    }

    /// Fail the next broadcasts with these errors, in order.
    pub fn fail_broadcasts(&self, errors: impl IntoIterator<Item = ChainError>) {
        self.state().broadcast_failures.extend(errors);
    }

    /// Accept the next `n` broadcasts but report a timeout to the caller.
    pub fn lose_broadcast_responses(&self, n: u32) {
        self.state().lost_responses += n;
    }

    /// Fail the next `n` read queries with a transient error.
    pub fn fail_queries(&self, n: u32) {
        self.fail_queries_with(
            (0..n).map(|_| ChainError::Transient("mock endpoint unreachable".to_string())),
        );
    }

    /// Fail the next read queries with the given errors, in order.
    pub fn fail_queries_with(&self, errors: impl IntoIterator<Item = ChainError>) {
        self.state().query_failures.extend(errors);
    }

    /// Broadcast calls received, accepted or not.
    pub fn broadcast_attempts(&self) -> u32 {
        self.state().broadcast_attempts
    }

    /// Hashes of transactions sent from `address`.
    pub fn sent_from(&self, address: &str) -> Vec<String> {
        self.state()
            .txs
            .iter()
            .filter(|tx| tx.nonce.is_some() && same_address(&tx.transfer.from, address))
            .map(|tx| tx.transfer.hash.clone())
            .collect()
    }

    pub fn balance_of(&self, address: &str) -> Amount {
        self.state().balance(address)
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn coin(&self) -> Cryptocurrency {
        self.coin
    }

    async fn balance(&self, address: &str) -> Result<Amount, ChainError> {
        let mut state = self.state();
        state.take_query_failure()?;
        Ok(state.balance(address))
    }

    async fn transactions_for_address(
        &self,
        address: &str,
    ) -> Result<Vec<ChainTransfer>, ChainError> {
        let mut state = self.state();
        state.take_query_failure()?;
        Ok(state
            .txs
            .iter()
            .filter(|tx| tx.mined && tx.transfer.direction(address).is_some())
            .map(|tx| tx.transfer.clone())
            .collect())
    }

    async fn broadcast(&self, raw_tx: &str) -> Result<String, ChainError> {
        let mut state = self.state();
        state.broadcast_attempts += 1;
        if let Some(err) = state.broadcast_failures.pop_front() {
            return Err(err);
        }

        let signed = SignedTransaction::from_raw_hex(raw_tx)
            .map_err(|e| ChainError::Rejected(e.to_string()))?;
        let hash = signed.hash_hex();
        if state.txs.iter().any(|tx| tx.transfer.hash == hash) {
            // Already known; nodes answer with the same hash
            return Ok(hash);
        }

        let decoded = signed
            .decode()
            .map_err(|e| ChainError::Rejected(e.to_string()))?;
        if decoded.tx.chain_id() != Some(self.chain_id) {
            return Err(ChainError::Rejected(format!(
                "invalid chain id {:?}",
                decoded.tx.chain_id()
            )));
        }
        let Some(to) = decoded.tx.to() else {
            return Err(ChainError::Rejected("contract creation".to_string()));
        };

        let from = checksum_encode(&decoded.from);
        let to = checksum_encode(&to);
        let nonce = decoded.tx.nonce();
        let value = decoded.tx.value();
        let expected_nonce = state.nonces.get(&from.to_lowercase()).copied().unwrap_or(0);
        if nonce < expected_nonce {
            return Err(ChainError::Rejected("nonce too low".to_string()));
        }
        if nonce > expected_nonce {
            return Err(ChainError::Rejected("nonce too high".to_string()));
        }

        let fee = decoded.tx.max_network_fee();
        let cost = value.saturating_add(fee);
        if state.balance(&from) < cost {
            return Err(ChainError::InsufficientFundsForFee(format!(
                "balance {} below cost {}",
                state.balance(&from),
                cost
            )));
        }

        state.debit(&from, cost);
        state.credit(&to, value);
        state.nonces.insert(from.to_lowercase(), expected_nonce + 1);
        state.txs.push(MockTx {
            transfer: ChainTransfer {
                hash: hash.clone(),
                from,
                to,
                value,
                confirmations: 0,
                block_number: None,
                success: true,
            },
            fee,
            nonce: Some(nonce),
            mined: false,
        });

        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(ChainError::Transient("broadcast timed out".to_string()));
        }
        Ok(hash)
    }

    async fn transaction(&self, hash: &str) -> Result<Option<TransactionStatus>, ChainError> {
        let mut state = self.state();
        state.take_query_failure()?;
        Ok(state
            .txs
            .iter()
            .find(|tx| tx.transfer.hash.eq_ignore_ascii_case(hash))
            .map(|tx| TransactionStatus {
                confirmations: tx.transfer.confirmations,
                success: tx.mined.then_some(tx.transfer.success),
            }))
    }

    async fn transfer_params(&self, from: &str) -> Result<TransferParams, ChainError> {
        let mut state = self.state();
        state.take_query_failure()?;
        Ok(TransferParams {
            nonce: state.nonces.get(&from.to_lowercase()).copied().unwrap_or(0),
            gas_price: state.gas_price,
            chain_id: self.chain_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256};
    use alloy::signers::local::PrivateKeySigner;
    use bth_gateway_core::LegacyTransaction;

    const OUTSIDE: &str = "0x3333333333333333333333333333333333333333";

    #[tokio::test]
    async fn test_deposit_listing_and_confirmations() {
        let chain = MockChain::new(Cryptocurrency::Eth);
        let pending = chain.deposit(OUTSIDE, 5, 0);
        let mined = chain.deposit(OUTSIDE, 7, 2);

        let listed = chain.transactions_for_address(OUTSIDE).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].hash, mined);

        let status = chain.transaction(&pending).await.unwrap().unwrap();
        assert!(!status.is_mined());

        chain.confirm_all(3);
        assert_eq!(chain.transactions_for_address(OUTSIDE).await.unwrap().len(), 2);
        assert_eq!(chain.balance(OUTSIDE).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_broadcast_checks_nonce_and_balance() {
        let chain = MockChain::new(Cryptocurrency::Eth);
        chain.set_gas_price(1);
        let signer = PrivateKeySigner::from_bytes(&B256::repeat_byte(0x42)).unwrap();
        let from = checksum_encode(&signer.address());
        let outside: Address = OUTSIDE.parse().unwrap();
        chain.deposit(&from, 30_000, 1);

        let tx = LegacyTransaction::transfer(0, 1, 21_000, outside, 9_000, 1);
        let raw = tx.sign(&signer).unwrap().raw_hex();
        let hash = chain.broadcast(&raw).await.unwrap();

        // Same bytes again: same hash, no second spend
        assert_eq!(chain.broadcast(&raw).await.unwrap(), hash);
        assert_eq!(chain.sent_from(&from), vec![hash]);
        assert_eq!(chain.balance_of(&from), 0);
        assert_eq!(chain.balance_of(OUTSIDE), 9_000);

        let replay = LegacyTransaction::transfer(0, 1, 21_000, outside, 1, 1);
        let raw = replay.sign(&signer).unwrap().raw_hex();
        assert!(matches!(
            chain.broadcast(&raw).await,
            Err(ChainError::Rejected(_))
        ));

        let broke = LegacyTransaction::transfer(1, 1, 21_000, outside, 1, 1);
        let raw = broke.sign(&signer).unwrap().raw_hex();
        assert!(matches!(
            chain.broadcast(&raw).await,
            Err(ChainError::InsufficientFundsForFee(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_transaction_unwinds() {
        let chain = MockChain::new(Cryptocurrency::Eth);
        let hash = chain.deposit(OUTSIDE, 10, 4);
        chain.remove_transaction(&hash);

        assert_eq!(chain.balance_of(OUTSIDE), 0);
        assert!(chain.transaction(&hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let chain = MockChain::new(Cryptocurrency::Eth);
        chain.fail_queries(1);
        assert!(chain.balance(OUTSIDE).await.is_err());
        assert!(chain.balance(OUTSIDE).await.is_ok());

        chain.fail_queries_with([ChainError::Malformed("bad txlist".to_string())]);
        assert!(matches!(
            chain.transactions_for_address(OUTSIDE).await,
            Err(ChainError::Malformed(_))
        ));
        assert!(chain.transactions_for_address(OUTSIDE).await.is_ok());

        chain.fail_broadcasts([ChainError::Rejected("boom".to_string())]);
        assert!(chain.broadcast("0x00").await.is_err());
        assert_eq!(chain.broadcast_attempts(), 1);
    }
}
