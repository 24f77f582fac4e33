// Copyright (c) 2024 The Botho Foundation

//! Deposit monitor.
//!
//! Each pass reads the payment address's history from the chain and moves
//! the session along `pending -> detected -> confirmed`. Everything is
//! derived from the current chain view, so replaying the same observation
//! is a no-op and a re-org simply shows up as a smaller view.

use bth_gateway_core::{
    amount::{format_amount, to_native_f64},
    session::{HistoryEvent, HistoryEventType, Session, SessionStatus},
    Amount, GatewayConfig,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chain::{ChainRegistry, ChainTransfer, Direction};
use crate::error::GatewayError;
use crate::price::PriceOracle;
use crate::store::{SessionStore, StoredSession};

/// Upper bound on state machine steps applied in one pass.
const MAX_STEPS: usize = 4;

/// Inbound deposits currently visible for a payment address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Sum over distinct inbound transactions
    pub received: Amount,
    /// Earliest inbound transaction
    pub earliest_hash: Option<String>,
    /// Lowest confirmation count among inbound transactions
    pub confirmations: u64,
    hashes: Vec<String>,
}

impl Observation {
    /// Reduce a transfer list to the successful, non-zero inbound deposits.
    pub fn from_transfers(address: &str, transfers: &[ChainTransfer]) -> Self {
        let mut inbound: BTreeMap<String, (usize, &ChainTransfer)> = BTreeMap::new();
        for (position, transfer) in transfers.iter().enumerate() {
            if transfer.direction(address) == Some(Direction::Incoming)
                && transfer.success
                && transfer.value > 0
            {
                inbound
                    .entry(transfer.hash.to_lowercase())
                    .or_insert((position, transfer));
            }
        }

        if inbound.is_empty() {
            return Self::default();
        }

        let received = inbound
            .values()
            .fold(0u128, |acc, (_, t)| acc.saturating_add(t.value));
        let confirmations = inbound
            .values()
            .map(|(_, t)| t.confirmations)
            .min()
            .unwrap_or(0);
        let earliest_hash = inbound
            .values()
            .min_by_key(|(position, t)| (t.block_number.unwrap_or(u64::MAX), *position))
            .map(|(_, t)| t.hash.clone());

        Self {
            received,
            earliest_hash,
            confirmations,
            hashes: inbound.into_keys().collect(),
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.iter().any(|h| h.eq_ignore_ascii_case(hash))
    }

    /// Check whether deposits counted on `session` are gone from the chain.
    pub fn lost_deposit(&self, session: &Session) -> bool {
        session.tx_hash.as_deref().is_some_and(|hash| !self.contains(hash))
            || self.received < session.received_amount
    }
}

/// Record under- or over-payment against the expected amount.
fn record_payment_variance(session: &mut Session) {
    let (expected, received) = (session.expected_amount, session.received_amount);
    if expected == 0 || received == expected {
        return;
    }
    let kind = if received < expected {
        HistoryEventType::Underpaid
    } else {
        HistoryEventType::Overpaid
    };
    let decimals = session.cryptocurrency.decimals();
    let detail = format!(
        "expected {} received {}",
        format_amount(expected, decimals),
        format_amount(received, decimals)
    );
    if !session.has_event(kind, Some(detail.as_str())) {
        session
            .transaction_history
            .push(HistoryEvent::new(kind).with_detail(detail));
    }
}

/// Compute the next state of `session` given what the chain shows.
///
/// Returns `None` when the stored session already matches the observation.
/// `unit_price` is the USD price of one whole coin, used to value a new
/// deposit.
pub fn next_step(
    session: &Session,
    obs: &Observation,
    required_confirmations: u64,
    unit_price: Option<f64>,
) -> Option<Session> {
    let decimals = session.cryptocurrency.decimals();
    let value_at = |amount: Amount| unit_price.map(|price| to_native_f64(amount, decimals) * price);
    let mut next = session.clone();

    match session.status {
        SessionStatus::Pending => {
            if obs.received == 0 {
                return None;
            }
            next.received_amount = obs.received;
            next.tx_hash = obs.earliest_hash.clone();
            next.confirmations = obs.confirmations;
            next.fee.amount_usd = value_at(obs.received);
            next.set_status(SessionStatus::Detected);
            next.transaction_history.push(
                HistoryEvent::new(HistoryEventType::DepositDetected)
                    .with_confirmations(obs.confirmations)
                    .with_detail(format!(
                        "{} received in {}",
                        format_amount(obs.received, decimals),
                        obs.earliest_hash.as_deref().unwrap_or("unknown tx")
                    )),
            );
            record_payment_variance(&mut next);
            Some(next)
        }

        SessionStatus::Detected | SessionStatus::Confirmed => {
            if obs.lost_deposit(session) {
                next.received_amount = 0;
                next.tx_hash = None;
                next.confirmations = 0;
                next.fee.amount_usd = None;
                next.set_status(SessionStatus::Pending);
                next.transaction_history.push(
                    HistoryEvent::new(HistoryEventType::ReorgDetected).with_detail(format!(
                        "deposit {} no longer on chain",
                        session.tx_hash.as_deref().unwrap_or("unknown tx")
                    )),
                );
                return Some(next);
            }

            if obs.received > session.received_amount {
                // Top-ups are valued at the unit price seen at detection
                next.fee.amount_usd = match session.fee.amount_usd {
                    Some(usd) if session.received_amount > 0 => {
                        Some(usd * (obs.received as f64 / session.received_amount as f64))
                    }
                    _ => value_at(obs.received),
                };
                next.received_amount = obs.received;
                next.confirmations = obs.confirmations;
                next.updated_at = Utc::now();
                next.transaction_history.push(
                    HistoryEvent::new(HistoryEventType::DepositUpdated)
                        .with_confirmations(obs.confirmations)
                        .with_detail(format!(
                            "received now {}",
                            format_amount(obs.received, decimals)
                        )),
                );
                record_payment_variance(&mut next);
                return Some(next);
            }

            if session.fee.amount_usd.is_none() && unit_price.is_some() {
                next.fee.amount_usd = value_at(session.received_amount);
                return Some(next);
            }

            if session.status == SessionStatus::Detected
                && obs.confirmations >= required_confirmations
            {
                next.confirmations = obs.confirmations;
                next.set_status(SessionStatus::Confirmed);
                next.transaction_history.push(
                    HistoryEvent::new(HistoryEventType::DepositConfirmed)
                        .with_confirmations(obs.confirmations),
                );
                return Some(next);
            }

            if obs.confirmations != session.confirmations {
                next.confirmations = obs.confirmations;
                return Some(next);
            }
            None
        }

        SessionStatus::FeeComputed => {
            if obs.lost_deposit(session) || obs.received != session.received_amount {
                let reason = GatewayError::ReorgDetected(format!(
                    "deposit changed after fee computation: recorded {}, chain shows {}",
                    format_amount(session.received_amount, decimals),
                    format_amount(obs.received, decimals)
                ))
                .to_string();
                next.flag_for_review(reason.clone());
                next.transaction_history
                    .push(HistoryEvent::new(HistoryEventType::NeedsReview).with_detail(reason));
                return Some(next);
            }
            if obs.confirmations != session.confirmations {
                next.confirmations = obs.confirmations;
                return Some(next);
            }
            None
        }

        _ => None,
    }
}

/// Watches payment addresses for deposits.
#[derive(Clone)]
pub struct DepositMonitor {
    store: SessionStore,
    chains: ChainRegistry,
    prices: Arc<dyn PriceOracle>,
    config: Arc<GatewayConfig>,
}

impl DepositMonitor {
    pub fn new(
        store: SessionStore,
        chains: ChainRegistry,
        prices: Arc<dyn PriceOracle>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            store,
            chains,
            prices,
            config,
        }
    }

    fn watch_expired(&self, session: &Session) -> bool {
        session.status == SessionStatus::Pending
            && session.received_amount == 0
            && Utc::now() - session.created_at
                > chrono::Duration::hours(self.config.gateway.max_watch_hours)
    }

    /// Run one monitoring pass over a session.
    ///
    /// Transient chain failures leave the session untouched; it is picked
    /// up again on the next pass.
    pub async fn check(&self, stored: StoredSession) -> Result<StoredSession, GatewayError> {
        let session = &stored.session;
        if !matches!(
            session.status,
            SessionStatus::Pending
                | SessionStatus::Detected
                | SessionStatus::Confirmed
                | SessionStatus::FeeComputed
        ) {
            return Ok(stored);
        }

        if self.watch_expired(session) {
            if session.has_event(HistoryEventType::WatchExpired, None) {
                return Ok(stored);
            }
            info!(
                "Session {} saw no deposit in {}h, no longer watched",
                session.id, self.config.gateway.max_watch_hours
            );
            let mut next = session.clone();
            next.transaction_history.push(
                HistoryEvent::new(HistoryEventType::WatchExpired).with_detail(format!(
                    "no deposit after {} hours",
                    self.config.gateway.max_watch_hours
                )),
            );
            return Ok(self.store.update(&stored, next)?);
        }

        let coin = session.cryptocurrency;
        let chain = self.chains.get(coin)?;
        let transfers = match chain.transactions_for_address(&session.payment_address).await {
            Ok(transfers) => transfers,
            Err(err) if err.is_transient() => {
                warn!("Session {}: deposit lookup failed: {}", session.id, err);
                return Ok(stored);
            }
            Err(err) => {
                warn!("Session {} needs review: deposit lookup failed: {}", session.id, err);
                let reason = format!("deposit lookup failed: {}", err);
                return Ok(self.store.flag_for_review(&stored, reason)?);
            }
        };

        let obs = Observation::from_transfers(&session.payment_address, &transfers);
        let unit_price = if obs.received > 0
            && (session.fee.amount_usd.is_none() || obs.lost_deposit(session))
        {
            match self.prices.usd_price(coin).await {
                Ok(price) => Some(price),
                Err(err) => {
                    warn!("Session {}: valuation deferred: {}", session.id, err);
                    None
                }
            }
        } else {
            None
        };

        let required = self.config.confirmations_required(coin);
        let mut current = stored;
        for _ in 0..MAX_STEPS {
            let Some(next) = next_step(&current.session, &obs, required, unit_price) else {
                break;
            };
            let from = current.session.status;
            current = self.store.update(&current, next)?;
            let session = &current.session;
            if from != session.status {
                info!(
                    "Session {} {} -> {} (received {}, {} confirmations)",
                    session.id,
                    from,
                    session.status,
                    format_amount(session.received_amount, coin.decimals()),
                    session.confirmations
                );
            }
        }

        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChain;
    use crate::error::ChainError;
    use crate::price::StaticPriceOracle;
    use bth_gateway_core::{parse_amount, Cryptocurrency};

    const PAY: &str = "0x1111111111111111111111111111111111111111";
    const OTHER: &str = "0x4444444444444444444444444444444444444444";

    fn transfer(hash: &str, to: &str, value: Amount, confirmations: u64, block: u64) -> ChainTransfer {
        ChainTransfer {
            hash: hash.to_string(),
            from: OTHER.to_string(),
            to: to.to_string(),
            value,
            confirmations,
            block_number: Some(block),
            success: true,
        }
    }

    fn pending_session(expected: Amount) -> Session {
        Session::new(
            Cryptocurrency::Eth,
            0,
            PAY.to_string(),
            "0x2222222222222222222222222222222222222222".to_string(),
            expected,
        )
    }

    #[test]
    fn test_observation_dedupes_and_filters() {
        let mut reverted = transfer("0x03", PAY, 50, 9, 12);
        reverted.success = false;
        let transfers = vec![
            transfer("0x02", PAY, 30, 4, 11),
            transfer("0x01", PAY, 20, 9, 10),
            transfer("0x01", PAY, 20, 9, 10),
            transfer("0x04", OTHER, 70, 9, 13),
            reverted,
        ];

        let obs = Observation::from_transfers(PAY, &transfers);
        assert_eq!(obs.received, 50);
        assert_eq!(obs.earliest_hash.as_deref(), Some("0x01"));
        assert_eq!(obs.confirmations, 4);
        assert!(obs.contains("0x02"));
        assert!(!obs.contains("0x03"));
    }

    #[test]
    fn test_detection_then_confirmation() {
        let session = pending_session(100);
        let obs = Observation::from_transfers(PAY, &[transfer("0xaa", PAY, 100, 3, 1)]);

        let detected = next_step(&session, &obs, 12, Some(2.0)).unwrap();
        assert_eq!(detected.status, SessionStatus::Detected);
        assert_eq!(detected.received_amount, 100);
        assert_eq!(detected.tx_hash.as_deref(), Some("0xaa"));
        assert!(detected.has_event(HistoryEventType::DepositDetected, None));
        assert!(!detected.has_event(HistoryEventType::Underpaid, None));

        // Same observation again: nothing to do
        assert!(next_step(&detected, &obs, 12, None).is_none());

        let obs = Observation::from_transfers(PAY, &[transfer("0xaa", PAY, 100, 12, 1)]);
        let confirmed = next_step(&detected, &obs, 12, None).unwrap();
        assert_eq!(confirmed.status, SessionStatus::Confirmed);
        assert_eq!(confirmed.confirmations, 12);
    }

    #[test]
    fn test_underpayment_uses_actual_amount() {
        let session = pending_session(1_000);
        let obs = Observation::from_transfers(PAY, &[transfer("0xaa", PAY, 600, 1, 1)]);

        let detected = next_step(&session, &obs, 12, None).unwrap();
        assert_eq!(detected.received_amount, 600);
        assert!(detected.has_event(HistoryEventType::Underpaid, None));
        assert!(detected.fee.amount_usd.is_none());
    }

    #[test]
    fn test_top_up_revalued_at_detection_price() {
        let session = pending_session(0);
        let received = parse_amount("1", 18).unwrap();
        let obs = Observation::from_transfers(PAY, &[transfer("0xaa", PAY, received, 1, 1)]);
        let detected = next_step(&session, &obs, 12, Some(2000.0)).unwrap();
        assert_eq!(detected.fee.amount_usd, Some(2000.0));

        let obs = Observation::from_transfers(
            PAY,
            &[
                transfer("0xaa", PAY, received, 2, 1),
                transfer("0xbb", PAY, received, 1, 2),
            ],
        );
        // The oracle moved, but the top-up keeps the detection-time price
        let topped = next_step(&detected, &obs, 12, Some(9999.0)).unwrap();
        assert_eq!(topped.received_amount, 2 * received);
        assert_eq!(topped.fee.amount_usd, Some(4000.0));
        assert_eq!(topped.tx_hash.as_deref(), Some("0xaa"));
        assert!(topped.has_event(HistoryEventType::DepositUpdated, None));
    }

    #[test]
    fn test_reorg_reverts_to_pending() {
        let session = pending_session(100);
        let obs = Observation::from_transfers(PAY, &[transfer("0xaa", PAY, 100, 20, 1)]);
        let detected = next_step(&session, &obs, 12, None).unwrap();
        let confirmed = next_step(&detected, &obs, 12, None).unwrap();
        assert_eq!(confirmed.status, SessionStatus::Confirmed);

        let reverted = next_step(&confirmed, &Observation::default(), 12, None).unwrap();
        assert_eq!(reverted.status, SessionStatus::Pending);
        assert!(reverted.tx_hash.is_none());
        assert_eq!(reverted.received_amount, 0);
        assert_eq!(reverted.confirmations, 0);
        assert!(reverted.has_event(HistoryEventType::ReorgDetected, None));
    }

    #[test]
    fn test_deposit_lost_after_fee_needs_review() {
        let mut session = pending_session(100);
        session.status = SessionStatus::FeeComputed;
        session.received_amount = 100;
        session.tx_hash = Some("0xaa".to_string());

        let next = next_step(&session, &Observation::default(), 12, None).unwrap();
        assert_eq!(next.status, SessionStatus::NeedsReview);
        assert_eq!(next.status_before_review, Some(SessionStatus::FeeComputed));
        assert!(next.review_reason.unwrap().contains("re-org"));
    }

    fn monitor(chain: Arc<MockChain>, store: SessionStore) -> DepositMonitor {
        let mut config = GatewayConfig::default();
        config
            .coins
            .get_mut(&Cryptocurrency::Eth)
            .unwrap()
            .confirmations_required = Some(3);
        DepositMonitor::new(
            store,
            ChainRegistry::new().with(chain),
            Arc::new(StaticPriceOracle::default().with_price(Cryptocurrency::Eth, 2000.0)),
            Arc::new(config),
        )
    }

    fn test_store() -> SessionStore {
        let store = SessionStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        store
    }

    #[tokio::test]
    async fn test_check_detects_and_confirms_in_one_pass() {
        let chain = Arc::new(MockChain::new(Cryptocurrency::Eth));
        let store = test_store();
        let stored = store.create(&pending_session(500)).unwrap();
        chain.deposit(PAY, 500, 5);

        let monitor = monitor(chain, store.clone());
        let checked = monitor.check(stored).await.unwrap();

        assert_eq!(checked.session.status, SessionStatus::Confirmed);
        assert_eq!(checked.session.received_amount, 500);
        assert!(checked.session.fee.amount_usd.is_some());
        assert_eq!(store.get(&checked.session.id).unwrap().unwrap(), checked);
    }

    #[tokio::test]
    async fn test_check_replay_does_not_double_count() {
        let chain = Arc::new(MockChain::new(Cryptocurrency::Eth));
        let store = test_store();
        let stored = store.create(&pending_session(500)).unwrap();
        chain.deposit(PAY, 500, 1);

        let monitor = monitor(chain, store);
        let first = monitor.check(stored).await.unwrap();
        let second = monitor.check(first.clone()).await.unwrap();

        assert_eq!(second.session.received_amount, 500);
        assert_eq!(second.version, first.version);
        assert_eq!(
            second
                .session
                .transaction_history
                .iter()
                .filter(|e| e.event_type == HistoryEventType::DepositDetected)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_check_leaves_session_on_transient_failure() {
        let chain = Arc::new(MockChain::new(Cryptocurrency::Eth));
        let store = test_store();
        let stored = store.create(&pending_session(500)).unwrap();
        chain.deposit(PAY, 500, 1);
        chain.fail_queries(1);

        let monitor = monitor(chain, store);
        let unchanged = monitor.check(stored.clone()).await.unwrap();
        assert_eq!(unchanged, stored);
    }

    #[tokio::test]
    async fn test_watch_expiry_recorded_once() {
        let chain = Arc::new(MockChain::new(Cryptocurrency::Eth));
        let store = test_store();
        let mut session = pending_session(500);
        session.created_at = Utc::now() - chrono::Duration::hours(100);
        let stored = store.create(&session).unwrap();

        let monitor = monitor(chain, store.clone());
        assert_eq!(store.list_open().unwrap().len(), 1);
        let expired = monitor.check(stored).await.unwrap();
        assert_eq!(expired.session.status, SessionStatus::Pending);
        assert!(expired.session.has_event(HistoryEventType::WatchExpired, None));
        assert!(store.list_open().unwrap().is_empty());

        let again = monitor.check(expired.clone()).await.unwrap();
        assert_eq!(again.version, expired.version);
    }

    #[tokio::test]
    async fn test_malformed_lookup_flags_for_review() {
        let chain = Arc::new(MockChain::new(Cryptocurrency::Eth));
        let store = test_store();
        let stored = store.create(&pending_session(500)).unwrap();
        chain.deposit(PAY, 500, 1);
        chain.fail_queries_with([ChainError::Malformed("txlist is not an array".to_string())]);

        let monitor = monitor(chain, store.clone());
        let flagged = monitor.check(stored).await.unwrap();

        assert_eq!(flagged.session.status, SessionStatus::NeedsReview);
        let reason = flagged.session.review_reason.clone().unwrap();
        assert!(reason.contains("txlist is not an array"), "{}", reason);
        assert!(flagged.session.has_event(HistoryEventType::NeedsReview, None));
        assert!(store.list_open().unwrap().is_empty());
    }
}
