// Copyright (c) 2024 The Botho Foundation

//! Forwarding engine.
//!
//! Moves the net deposit from the payment address to the coin's
//! consolidation address, at most once per session. A signed transaction is
//! persisted before it is broadcast; from then on only those exact bytes are
//! ever sent, so a lost response or a dropped transaction can be retried
//! without risking a second spend.

use bth_gateway_core::{
    coin::{parse_address, same_address},
    session::{HistoryEvent, HistoryEventType, Session, SessionStatus},
    Amount, DerivedKey, GatewayConfig, KeyDeriver, LegacyTransaction, SignedTransaction,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, ChainRegistry, TransferParams};
use crate::error::{ChainError, GatewayError};
use crate::store::{SessionStore, StoredSession};

/// Cap on the delay between forwarding attempts.
const MAX_RETRY_DELAY_SECS: u64 = 10 * 365 * 24 * 3600;

/// Why a forwarding attempt ended.
enum AttemptFailure {
    /// Worth another try after backoff
    Retryable(String),
    /// The balance cannot cover the network fee; retrying will not help
    InsufficientFunds(String),
}

impl From<ChainError> for AttemptFailure {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::InsufficientFundsForFee(msg) => AttemptFailure::InsufficientFunds(msg),
            other => AttemptFailure::Retryable(other.to_string()),
        }
    }
}

/// Builds, signs and broadcasts forwarding and fee sweep transactions.
#[derive(Clone)]
pub struct ForwardingEngine {
    store: SessionStore,
    chains: ChainRegistry,
    deriver: Arc<KeyDeriver>,
    config: Arc<GatewayConfig>,
}

impl ForwardingEngine {
    pub fn new(
        store: SessionStore,
        chains: ChainRegistry,
        deriver: Arc<KeyDeriver>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            store,
            chains,
            deriver,
            config,
        }
    }

    /// Advance the forward of a session by one step.
    ///
    /// Once `forwardingTxHash` is set this only checks confirmations; calling
    /// it again never produces a second transaction.
    pub async fn forward(&self, stored: StoredSession) -> Result<StoredSession, GatewayError> {
        let session = &stored.session;
        if session.forwarding.forwarding_tx_hash.is_some() {
            return self.check_forward(stored).await;
        }

        match (session.status, session.is_retry_due(Utc::now())) {
            (SessionStatus::Forwarding, _) => self.resolve_pending(stored).await,
            (SessionStatus::FeeComputed, _) | (SessionStatus::ForwardFailed, true) => {
                self.start_forward(stored).await
            }
            _ => Ok(stored),
        }
    }

    fn derive_key(&self, session: &Session) -> Result<DerivedKey, GatewayError> {
        let coin = session.cryptocurrency;
        let max_index = self.config.coin(coin)?.max_index;
        let key = self
            .deriver
            .derive_within(self.config.coin_type(coin), session.address_index, max_index)?;
        if !same_address(&key.address, &session.payment_address) {
            return Err(GatewayError::Validation(format!(
                "derived address {} does not match payment address {}",
                key.address, session.payment_address
            )));
        }
        Ok(key)
    }

    /// Check the chain id the node reports against the configured one.
    fn check_params(&self, session: &Session, params: &TransferParams) -> Result<(), GatewayError> {
        let expected = self.config.chain_id(session.cryptocurrency);
        if params.chain_id != expected {
            return Err(GatewayError::Validation(format!(
                "node reports chain id {}, expected {}",
                params.chain_id, expected
            )));
        }
        Ok(())
    }

    async fn start_forward(&self, stored: StoredSession) -> Result<StoredSession, GatewayError> {
        let session = &stored.session;
        let coin = session.cryptocurrency;
        let chain = self.chains.get(coin)?;
        let gas_limit = self.config.coin(coin)?.gas_limit;

        let prepared = match self.derive_key(session).and_then(|key| {
            parse_address(&session.forwarding_address)
                .map(|to| (key, to))
                .map_err(GatewayError::Validation)
        }) {
            Ok(prepared) => prepared,
            Err(err) => return self.flag(stored, err.to_string()),
        };
        let (key, to) = prepared;

        let params = match chain.transfer_params(&key.address).await {
            Ok(params) => params,
            Err(err) if err.is_transient() => {
                warn!("Session {}: transfer params unavailable: {}", session.id, err);
                return Ok(stored);
            }
            Err(err) => return self.fail_attempt(stored, err.into()),
        };
        if let Err(err) = self.check_params(session, &params) {
            return self.flag(stored, err.to_string());
        }

        let net = session.net_amount();
        let network_fee = params.gas_price.saturating_mul(gas_limit as u128);
        if network_fee >= net {
            return self.fail_attempt(
                stored,
                AttemptFailure::InsufficientFunds(format!(
                    "network fee {} leaves nothing of net amount {}",
                    network_fee, net
                )),
            );
        }
        let value = net - network_fee;

        let balance = match chain.balance(&key.address).await {
            Ok(balance) => balance,
            Err(err) if err.is_transient() => {
                warn!("Session {}: balance unavailable: {}", session.id, err);
                return Ok(stored);
            }
            Err(err) => return self.fail_attempt(stored, err.into()),
        };
        if balance < net {
            return self.fail_attempt(
                stored,
                AttemptFailure::InsufficientFunds(format!(
                    "balance {} below net amount {}",
                    balance, net
                )),
            );
        }

        let tx = LegacyTransaction::transfer(
            params.nonce,
            params.gas_price,
            gas_limit,
            to,
            value,
            params.chain_id,
        );
        let signed = match tx.sign(&key.signer) {
            Ok(signed) => signed,
            Err(err) => return self.fail_attempt(stored, AttemptFailure::Retryable(err.to_string())),
        };

        let mut next = session.clone();
        next.set_status(SessionStatus::Forwarding);
        next.forwarding.attempts += 1;
        next.forwarding.pending_tx_hash = Some(signed.hash_hex());
        next.forwarding.signed_tx = Some(signed.raw_hex());
        next.forwarding.forwarded_amount = value;
        next.forwarding.forwarding_error = None;
        next.forwarding.next_retry_at = None;
        let stored = self.store.update(&stored, next)?;

        info!(
            "Session {}: forwarding {} to {} (attempt {}, nonce {})",
            stored.session.id,
            value,
            stored.session.forwarding_address,
            stored.session.forwarding.attempts,
            params.nonce
        );

        self.broadcast_pending(stored, chain.as_ref()).await
    }

    /// Send the persisted forwarding transaction.
    async fn broadcast_pending(
        &self,
        stored: StoredSession,
        chain: &dyn ChainClient,
    ) -> Result<StoredSession, GatewayError> {
        let Some(raw) = stored.session.forwarding.signed_tx.clone() else {
            let reason = "forward in flight without signed transaction".to_string();
            return self.flag(stored, reason);
        };

        match chain.broadcast(&raw).await {
            Ok(hash) => {
                let expected = stored.session.forwarding.pending_tx_hash.clone();
                if expected
                    .as_deref()
                    .is_some_and(|expected| !expected.eq_ignore_ascii_case(&hash))
                {
                    warn!(
                        "Session {}: node returned hash {} for {:?}",
                        stored.session.id, hash, expected
                    );
                }
                self.mark_forwarded(stored, "broadcast")
            }
            Err(err) if err.is_transient() => {
                // The node may have the transaction; the hash is checked next pass
                warn!(
                    "Session {}: broadcast outcome unknown: {}",
                    stored.session.id, err
                );
                Ok(stored)
            }
            Err(err) => self.fail_attempt(stored, err.into()),
        }
    }

    /// Settle a broadcast whose outcome was never observed.
    async fn resolve_pending(&self, stored: StoredSession) -> Result<StoredSession, GatewayError> {
        let Some(hash) = stored.session.forwarding.pending_tx_hash.clone() else {
            let reason = "forwarding status without a pending transaction".to_string();
            return self.flag(stored, reason);
        };
        let chain = self.chains.get(stored.session.cryptocurrency)?;

        match chain.transaction(&hash).await {
            Ok(Some(_)) => {
                debug!("Session {}: pending forward {} is known", stored.session.id, hash);
                self.mark_forwarded(stored, "found on chain")
            }
            Ok(None) => self.broadcast_pending(stored, chain.as_ref()).await,
            Err(err) if err.is_transient() => {
                warn!("Session {}: lookup of {} failed: {}", stored.session.id, hash, err);
                Ok(stored)
            }
            Err(err) => self.flag(stored, format!("lookup of forward {} failed: {}", hash, err)),
        }
    }

    fn mark_forwarded(&self, stored: StoredSession, how: &str) -> Result<StoredSession, GatewayError> {
        let mut next = stored.session.clone();
        let hash = next.forwarding.pending_tx_hash.take();
        next.forwarding.forwarding_tx_hash = hash.clone();
        next.forwarding.auto_forwarded = true;
        next.set_status(SessionStatus::Forwarded);
        next.transaction_history.push(
            HistoryEvent::new(HistoryEventType::ForwardBroadcast).with_detail(format!(
                "{} {}",
                hash.as_deref().unwrap_or_default(),
                how
            )),
        );

        let stored = self.store.update(&stored, next)?;
        info!(
            "Session {}: forwarded in {}",
            stored.session.id,
            stored.session.forwarding.forwarding_tx_hash.as_deref().unwrap_or_default()
        );
        Ok(stored)
    }

    /// Record a failed attempt and schedule the retry or hand over to an
    /// operator.
    fn fail_attempt(
        &self,
        stored: StoredSession,
        failure: AttemptFailure,
    ) -> Result<StoredSession, GatewayError> {
        let mut next = stored.session.clone();
        let retry = &self.config.retry;

        // Attempts that reached signing were counted when persisted
        if next.status != SessionStatus::Forwarding {
            next.forwarding.attempts += 1;
        }
        let attempts = next.forwarding.attempts;

        let (reason, give_up) = match failure {
            AttemptFailure::Retryable(reason) => (reason, attempts >= retry.max_forward_attempts),
            AttemptFailure::InsufficientFunds(reason) => (
                GatewayError::InsufficientFundsForFee(reason).to_string(),
                true,
            ),
        };

        next.forwarding.forwarding_error = Some(reason.clone());
        next.forwarding.pending_tx_hash = None;
        next.forwarding.signed_tx = None;
        next.forwarding.forwarded_amount = 0;
        next.set_status(SessionStatus::ForwardFailed);
        next.transaction_history.push(
            HistoryEvent::new(HistoryEventType::ForwardFailed)
                .with_detail(format!("attempt {}: {}", attempts, reason)),
        );

        if give_up {
            let manual_reason = format!(
                "automatic forwarding stopped after {} attempt(s): {}",
                attempts, reason
            );
            warn!("Session {}: {}", next.id, manual_reason);
            next.forwarding.manual_forward = true;
            next.forwarding.manual_forward_reason = Some(manual_reason.clone());
            next.forwarding.next_retry_at = None;
            next.transaction_history.push(
                HistoryEvent::new(HistoryEventType::ManualForwardRequired)
                    .with_detail(manual_reason),
            );
        } else {
            let delay = retry.forward_retry_delay_secs(attempts);
            warn!(
                "Session {}: forward attempt {} failed, retry in {}s: {}",
                next.id, attempts, delay, reason
            );
            next.forwarding.next_retry_at =
                Some(Utc::now() + Duration::seconds(delay.min(MAX_RETRY_DELAY_SECS) as i64));
        }

        Ok(self.store.update(&stored, next)?)
    }

    fn flag(&self, stored: StoredSession, reason: String) -> Result<StoredSession, GatewayError> {
        warn!("Session {} needs review: {}", stored.session.id, reason);
        Ok(self.store.flag_for_review(&stored, reason)?)
    }

    /// Follow a broadcast forward until it reaches the confirmation
    /// threshold.
    async fn check_forward(&self, stored: StoredSession) -> Result<StoredSession, GatewayError> {
        let session = &stored.session;
        if session.status != SessionStatus::Forwarded {
            return Ok(stored);
        }
        let Some(hash) = session.forwarding.forwarding_tx_hash.clone() else {
            return Ok(stored);
        };
        let coin = session.cryptocurrency;
        let chain = self.chains.get(coin)?;

        let status = match chain.transaction(&hash).await {
            Ok(status) => status,
            Err(err) if err.is_transient() => {
                warn!("Session {}: lookup of {} failed: {}", session.id, hash, err);
                return Ok(stored);
            }
            Err(err) => {
                return self.flag(stored, format!("lookup of forward {} failed: {}", hash, err))
            }
        };

        match status {
            Some(status) if status.success == Some(false) => {
                self.flag(stored, format!("forwarding transaction {} reverted", hash))
            }
            Some(status) if status.is_mined()
                && status.confirmations >= self.config.confirmations_required(coin) =>
            {
                let mut next = session.clone();
                next.set_status(SessionStatus::Completed);
                next.transaction_history.push(
                    HistoryEvent::new(HistoryEventType::ForwardConfirmed)
                        .with_confirmations(status.confirmations)
                        .with_detail(hash),
                );
                let stored = self.store.update(&stored, next)?;
                info!(
                    "Session {} completed, forwarded {}",
                    stored.session.id, stored.session.forwarding.forwarded_amount
                );
                Ok(stored)
            }
            Some(_) => Ok(stored),
            None => self.rebroadcast_dropped(stored, chain.as_ref(), hash).await,
        }
    }

    /// Re-send the exact bytes of a forward the network dropped.
    async fn rebroadcast_dropped(
        &self,
        stored: StoredSession,
        chain: &dyn ChainClient,
        hash: String,
    ) -> Result<StoredSession, GatewayError> {
        let Some(raw) = stored.session.forwarding.signed_tx.clone() else {
            return self.flag(
                stored,
                format!("forwarding transaction {} dropped and no signed copy kept", hash),
            );
        };

        match chain.broadcast(&raw).await {
            Ok(_) => {
                info!("Session {}: rebroadcast dropped forward {}", stored.session.id, hash);
                if stored
                    .session
                    .has_event(HistoryEventType::ForwardRebroadcast, Some(hash.as_str()))
                {
                    return Ok(stored);
                }
                let mut next = stored.session.clone();
                next.transaction_history
                    .push(HistoryEvent::new(HistoryEventType::ForwardRebroadcast).with_detail(hash));
                Ok(self.store.update(&stored, next)?)
            }
            Err(err) if err.is_transient() => {
                warn!("Session {}: rebroadcast failed: {}", stored.session.id, err);
                Ok(stored)
            }
            Err(err) => self.flag(
                stored,
                format!("dropped forward {} was rejected on rebroadcast: {}", hash, err),
            ),
        }
    }

    /// Sweep the retained fee of a completed session to the fee address.
    pub async fn sweep_fees(&self, stored: StoredSession) -> Result<StoredSession, GatewayError> {
        let session = &stored.session;
        if session.status != SessionStatus::Completed
            || !session.fee.fee_taken
            || session.fee.fees_collected
        {
            return Ok(stored);
        }
        let coin = session.cryptocurrency;
        let coin_config = self.config.coin(coin)?;
        let Some(fee_address) = coin_config.fee_address.clone() else {
            return Ok(stored);
        };
        let chain = self.chains.get(coin)?;

        if let Some(hash) = session.fee.sweep_tx_hash.clone() {
            return self.check_sweep(stored, chain.as_ref(), hash).await;
        }

        let key = match self.derive_key(session) {
            Ok(key) => key,
            Err(err) => return self.flag(stored, err.to_string()),
        };
        let to = match parse_address(&fee_address) {
            Ok(to) => to,
            Err(err) => return self.flag(stored, format!("fee address {}", err)),
        };

        let (params, balance) = match tokio::try_join!(
            chain.transfer_params(&key.address),
            chain.balance(&key.address)
        ) {
            Ok(pair) => pair,
            Err(err) if err.is_transient() => {
                warn!("Session {}: sweep deferred: {}", session.id, err);
                return Ok(stored);
            }
            Err(err) => return self.flag(stored, format!("fee sweep failed: {}", err)),
        };
        if let Err(err) = self.check_params(session, &params) {
            return self.flag(stored, err.to_string());
        }

        let network_fee = params.gas_price.saturating_mul(coin_config.gas_limit as u128);
        if balance <= network_fee {
            warn!(
                "Session {}: balance {} cannot pay sweep fee {}",
                session.id, balance, network_fee
            );
            return Ok(stored);
        }
        let value: Amount = balance - network_fee;

        let signed = LegacyTransaction::transfer(
            params.nonce,
            params.gas_price,
            coin_config.gas_limit,
            to,
            value,
            params.chain_id,
        )
        .sign(&key.signer);
        let signed = match signed {
            Ok(signed) => signed,
            Err(err) => return self.flag(stored, format!("fee sweep signing failed: {}", err)),
        };

        let mut next = session.clone();
        next.fee.sweep_tx_hash = Some(signed.hash_hex());
        next.fee.sweep_signed_tx = Some(signed.raw_hex());
        let stored = self.store.update(&stored, next)?;

        self.broadcast_sweep(stored, chain.as_ref(), &signed).await
    }

    async fn broadcast_sweep(
        &self,
        stored: StoredSession,
        chain: &dyn ChainClient,
        signed: &SignedTransaction,
    ) -> Result<StoredSession, GatewayError> {
        let hash = signed.hash_hex();
        match chain.broadcast(&signed.raw_hex()).await {
            Ok(_) => {
                info!("Session {}: fee sweep {} sent", stored.session.id, hash);
                if stored
                    .session
                    .has_event(HistoryEventType::FeeSweepBroadcast, Some(hash.as_str()))
                {
                    return Ok(stored);
                }
                let mut next = stored.session.clone();
                next.transaction_history
                    .push(HistoryEvent::new(HistoryEventType::FeeSweepBroadcast).with_detail(hash));
                Ok(self.store.update(&stored, next)?)
            }
            Err(err) if err.is_transient() => {
                warn!("Session {}: sweep outcome unknown: {}", stored.session.id, err);
                Ok(stored)
            }
            Err(err) => {
                // Nothing left the address; the next pass builds a fresh sweep
                warn!("Session {}: sweep rejected: {}", stored.session.id, err);
                let mut next = stored.session.clone();
                next.fee.sweep_tx_hash = None;
                next.fee.sweep_signed_tx = None;
                Ok(self.store.update(&stored, next)?)
            }
        }
    }

    async fn check_sweep(
        &self,
        stored: StoredSession,
        chain: &dyn ChainClient,
        hash: String,
    ) -> Result<StoredSession, GatewayError> {
        let coin = stored.session.cryptocurrency;
        let status = match chain.transaction(&hash).await {
            Ok(status) => status,
            Err(err) if err.is_transient() => return Ok(stored),
            Err(err) => {
                return self.flag(stored, format!("lookup of fee sweep {} failed: {}", hash, err))
            }
        };

        match status {
            Some(status) if status.success == Some(false) => {
                self.flag(stored, format!("fee sweep {} reverted", hash))
            }
            Some(status) if status.is_mined()
                && status.confirmations >= self.config.confirmations_required(coin) =>
            {
                let mut next = stored.session.clone();
                next.fee.fees_collected = true;
                next.fee.fee_remaining = 0;
                next.transaction_history.push(
                    HistoryEvent::new(HistoryEventType::FeesCollected)
                        .with_confirmations(status.confirmations)
                        .with_detail(hash),
                );
                let stored = self.store.update(&stored, next)?;
                info!("Session {}: fees collected", stored.session.id);
                Ok(stored)
            }
            Some(_) => Ok(stored),
            None => {
                let Some(raw) = stored.session.fee.sweep_signed_tx.clone() else {
                    return self.flag(stored, format!("fee sweep {} lost", hash));
                };
                let signed = match SignedTransaction::from_raw_hex(&raw) {
                    Ok(signed) => signed,
                    Err(err) => {
                        return self.flag(stored, format!("stored fee sweep unreadable: {}", err))
                    }
                };
                self.broadcast_sweep(stored, chain, &signed).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainRegistry, MockChain};
    use bth_gateway_core::{Cryptocurrency, FeeEngine, MasterSeed};

    const PHRASE: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const TREASURY: &str = "0x2222222222222222222222222222222222222222";
    const ONE_ETH: Amount = 1_000_000_000_000_000_000;

    struct Harness {
        chain: Arc<MockChain>,
        store: SessionStore,
        forwarder: ForwardingEngine,
        deriver: Arc<KeyDeriver>,
        config: Arc<GatewayConfig>,
    }

    fn harness(max_attempts: u32) -> Harness {
        let mut config = GatewayConfig::default();
        config.retry.max_forward_attempts = max_attempts;
        config.retry.forward_retry_base_secs = 0;
        {
            let eth = config.coins.get_mut(&Cryptocurrency::Eth).unwrap();
            eth.forwarding_address = TREASURY.to_string();
            eth.confirmations_required = Some(2);
        }
        let config = Arc::new(config);
        let deriver = Arc::new(KeyDeriver::new(MasterSeed::from_mnemonic(PHRASE, "").unwrap()));
        let chain = Arc::new(MockChain::new(Cryptocurrency::Eth));
        let store = SessionStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        let forwarder = ForwardingEngine::new(
            store.clone(),
            ChainRegistry::new().with(chain.clone()),
            deriver.clone(),
            config.clone(),
        );
        Harness {
            chain,
            store,
            forwarder,
            deriver,
            config,
        }
    }

    /// A session with a confirmed, fee-computed deposit of one ETH.
    fn fee_computed(h: &Harness, index: u64) -> StoredSession {
        let key = h.deriver.derive(60, index).unwrap();
        let mut session = Session::new(
            Cryptocurrency::Eth,
            index,
            key.address.clone(),
            TREASURY.to_string(),
            ONE_ETH,
        );
        session.tx_hash = Some(h.chain.deposit(&key.address, ONE_ETH, 20));
        session.received_amount = ONE_ETH;
        session.confirmations = 20;
        session.fee.amount_usd = Some(2000.0);
        FeeEngine::from_config(&h.config).apply_fee(&mut session).unwrap();
        session.status = SessionStatus::FeeComputed;
        h.store.create(&session).unwrap()
    }

    #[tokio::test]
    async fn test_forward_then_complete() {
        let h = harness(3);
        let stored = fee_computed(&h, 0);
        let net = stored.session.net_amount();

        let forwarded = h.forwarder.forward(stored).await.unwrap();
        let session = &forwarded.session;
        assert_eq!(session.status, SessionStatus::Forwarded);
        assert!(session.forwarding.auto_forwarded);
        assert_eq!(session.forwarding.attempts, 1);
        assert_eq!(
            session.forwarding.forwarded_amount,
            net - 21_000 * 1_000_000_000
        );
        assert_eq!(h.chain.balance_of(TREASURY), session.forwarding.forwarded_amount);
        assert!(session.fee.fee_amount + session.forwarding.forwarded_amount <= ONE_ETH);

        h.chain.confirm_all(2);
        let completed = h.forwarder.forward(forwarded).await.unwrap();
        assert_eq!(completed.session.status, SessionStatus::Completed);
        assert!(completed.session.has_event(HistoryEventType::ForwardConfirmed, None));
    }

    #[tokio::test]
    async fn test_second_forward_is_confirmation_check() {
        let h = harness(3);
        let stored = fee_computed(&h, 1);
        let address = stored.session.payment_address.clone();

        let first = h.forwarder.forward(stored).await.unwrap();
        let hash = first.session.forwarding.forwarding_tx_hash.clone();
        let second = h.forwarder.forward(first).await.unwrap();

        assert_eq!(second.session.forwarding.forwarding_tx_hash, hash);
        assert_eq!(h.chain.sent_from(&address).len(), 1);
        assert_eq!(h.chain.broadcast_attempts(), 1);
    }

    #[tokio::test]
    async fn test_lost_response_resolved_without_second_send() {
        let h = harness(3);
        let stored = fee_computed(&h, 2);
        let address = stored.session.payment_address.clone();
        h.chain.lose_broadcast_responses(1);

        let pending = h.forwarder.forward(stored).await.unwrap();
        assert_eq!(pending.session.status, SessionStatus::Forwarding);
        assert!(pending.session.forwarding.pending_tx_hash.is_some());

        let resolved = h.forwarder.forward(pending.clone()).await.unwrap();
        assert_eq!(resolved.session.status, SessionStatus::Forwarded);
        assert_eq!(
            resolved.session.forwarding.forwarding_tx_hash,
            pending.session.forwarding.pending_tx_hash
        );
        assert_eq!(h.chain.sent_from(&address).len(), 1);
        assert_eq!(h.chain.broadcast_attempts(), 1);
    }

    #[tokio::test]
    async fn test_dropped_forward_rebroadcast_with_same_hash() {
        let h = harness(3);
        let stored = fee_computed(&h, 3);
        let forwarded = h.forwarder.forward(stored).await.unwrap();
        let hash = forwarded.session.forwarding.forwarding_tx_hash.clone().unwrap();

        h.chain.remove_transaction(&hash);
        let rebroadcast = h.forwarder.forward(forwarded).await.unwrap();

        assert_eq!(rebroadcast.session.status, SessionStatus::Forwarded);
        assert!(rebroadcast
            .session
            .has_event(HistoryEventType::ForwardRebroadcast, Some(hash.as_str())));
        assert_eq!(h.chain.sent_from(&rebroadcast.session.payment_address), vec![hash]);
    }

    #[tokio::test]
    async fn test_malformed_forward_lookup_needs_review() {
        let h = harness(3);
        let stored = fee_computed(&h, 6);
        let forwarded = h.forwarder.forward(stored).await.unwrap();

        h.chain
            .fail_queries_with([ChainError::Malformed("receipt missing status".to_string())]);
        let reviewed = h.forwarder.forward(forwarded).await.unwrap();

        assert_eq!(reviewed.session.status, SessionStatus::NeedsReview);
        let reason = reviewed.session.review_reason.clone().unwrap();
        assert!(reason.contains("receipt missing status"), "{}", reason);
        assert_eq!(
            h.store.list_by_status(SessionStatus::NeedsReview).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_reverted_forward_needs_review() {
        let h = harness(3);
        let stored = fee_computed(&h, 4);
        let forwarded = h.forwarder.forward(stored).await.unwrap();
        let hash = forwarded.session.forwarding.forwarding_tx_hash.clone().unwrap();

        h.chain.revert_transaction(&hash, 5);
        let reviewed = h.forwarder.forward(forwarded).await.unwrap();
        assert_eq!(reviewed.session.status, SessionStatus::NeedsReview);
        assert_eq!(
            reviewed.session.status_before_review,
            Some(SessionStatus::Forwarded)
        );
    }

    #[tokio::test]
    async fn test_repeated_rejection_requires_manual_forward() {
        let h = harness(3);
        let mut stored = fee_computed(&h, 5);
        h.chain.fail_broadcasts((0..3).map(|i| ChainError::Rejected(format!("boom {}", i))));

        for attempt in 1..=3 {
            stored = h.forwarder.forward(stored).await.unwrap();
            assert_eq!(stored.session.status, SessionStatus::ForwardFailed);
            assert_eq!(stored.session.forwarding.attempts, attempt);
            assert!(stored.session.forwarding.pending_tx_hash.is_none());
        }

        let forwarding = &stored.session.forwarding;
        assert!(forwarding.manual_forward);
        assert!(!forwarding.manual_forward_reason.clone().unwrap().is_empty());
        assert!(forwarding.forwarding_tx_hash.is_none());
        assert_eq!(forwarding.forwarded_amount, 0);
        assert!(!stored.session.is_open());

        // Automatic retry has stopped
        let again = h.forwarder.forward(stored.clone()).await.unwrap();
        assert_eq!(again, stored);
        assert_eq!(h.chain.broadcast_attempts(), 3);
        assert!(h.chain.sent_from(&stored.session.payment_address).is_empty());
    }

    #[tokio::test]
    async fn test_fee_above_net_goes_manual() {
        let h = harness(3);
        let stored = fee_computed(&h, 6);
        h.chain.set_gas_price(ONE_ETH);

        let failed = h.forwarder.forward(stored).await.unwrap();
        assert_eq!(failed.session.status, SessionStatus::ForwardFailed);
        assert!(failed.session.forwarding.manual_forward);
        assert_eq!(failed.session.forwarding.attempts, 1);
        assert_eq!(h.chain.broadcast_attempts(), 0);
    }

    #[tokio::test]
    async fn test_sweep_collects_fee() {
        let h = harness(3);
        let mut config = (*h.config).clone();
        let fee_wallet = "0x5555555555555555555555555555555555555555";
        config
            .coins
            .get_mut(&Cryptocurrency::Eth)
            .unwrap()
            .fee_address = Some(fee_wallet.to_string());
        let forwarder = ForwardingEngine::new(
            h.store.clone(),
            ChainRegistry::new().with(h.chain.clone()),
            h.deriver.clone(),
            Arc::new(config),
        );

        let stored = fee_computed(&h, 7);
        let fee = stored.session.fee.fee_amount;
        assert!(fee > 0);

        let forwarded = forwarder.forward(stored).await.unwrap();
        h.chain.confirm_all(2);
        let completed = forwarder.forward(forwarded).await.unwrap();
        assert!(completed.session.is_open());

        let sweeping = forwarder.sweep_fees(completed).await.unwrap();
        assert!(sweeping.session.fee.sweep_tx_hash.is_some());
        assert!(!sweeping.session.fee.fees_collected);
        assert_eq!(h.chain.balance_of(fee_wallet), fee - 21_000 * 1_000_000_000);

        h.chain.confirm_all(2);
        let swept = forwarder.sweep_fees(sweeping).await.unwrap();
        assert!(swept.session.fee.fees_collected);
        assert_eq!(swept.session.fee.fee_remaining, 0);
        assert!(!swept.session.is_open());
    }
}
