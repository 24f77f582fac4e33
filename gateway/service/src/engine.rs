// Copyright (c) 2024 The Botho Foundation

//! Gateway engine - opens sessions and drives open ones through the
//! monitor, the fee engine and the forwarder.

use bth_gateway_core::{
    amount::{format_amount, to_native_f64},
    session::{HistoryEvent, HistoryEventType, Session, SessionStatus},
    Amount, Cryptocurrency, FeeEngine, GatewayConfig, KeyDeriver,
};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::allocator::AddressAllocator;
use crate::chain::ChainRegistry;
use crate::error::GatewayError;
use crate::forwarder::ForwardingEngine;
use crate::monitor::DepositMonitor;
use crate::price::PriceOracle;
use crate::store::{SessionStore, StoredSession};

/// Outcome of one pass over the open sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub processed: usize,
    pub failed: usize,
}

/// The gateway engine.
pub struct Engine {
    config: Arc<GatewayConfig>,
    store: SessionStore,
    allocator: AddressAllocator,
    deriver: Arc<KeyDeriver>,
    prices: Arc<dyn PriceOracle>,
    fees: FeeEngine,
    monitor: DepositMonitor,
    forwarder: ForwardingEngine,
    shutdown_tx: broadcast::Sender<()>,
}

impl Engine {
    pub fn new(
        config: Arc<GatewayConfig>,
        store: SessionStore,
        chains: ChainRegistry,
        prices: Arc<dyn PriceOracle>,
        deriver: Arc<KeyDeriver>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            allocator: AddressAllocator::from_config(store.clone(), &config),
            fees: FeeEngine::from_config(&config),
            monitor: DepositMonitor::new(
                store.clone(),
                chains.clone(),
                prices.clone(),
                config.clone(),
            ),
            forwarder: ForwardingEngine::new(store.clone(), chains, deriver.clone(), config.clone()),
            config,
            store,
            deriver,
            prices,
            shutdown_tx,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Sender that stops [`Engine::run`] after the current tick.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Issue a fresh payment address and persist a pending session for it.
    pub fn open_session(
        &self,
        coin: Cryptocurrency,
        expected_amount: Amount,
    ) -> Result<StoredSession, GatewayError> {
        let coin_config = self.config.coin(coin)?;
        let index = self.allocator.allocate(coin)?;
        let key = self
            .deriver
            .derive_within(self.config.coin_type(coin), index, coin_config.max_index)?;

        let mut session = Session::new(
            coin,
            index,
            key.address,
            coin_config.forwarding_address.clone(),
            expected_amount,
        );
        session.transaction_history.push(
            HistoryEvent::new(HistoryEventType::SessionCreated).with_detail(format!(
                "index {} expecting {} {}",
                index,
                format_amount(expected_amount, coin.decimals()),
                coin
            )),
        );

        let stored = self.store.create(&session)?;
        info!(
            "Opened session {} for {} at {} (index {})",
            stored.session.id, coin, stored.session.payment_address, index
        );
        Ok(stored)
    }

    /// Record the fee split once the deposit is final.
    async fn compute_fee(&self, stored: StoredSession) -> Result<StoredSession, GatewayError> {
        let session = &stored.session;
        let coin = session.cryptocurrency;
        if session.status != SessionStatus::Confirmed
            || session.confirmations < self.config.confirmations_required(coin)
        {
            return Ok(stored);
        }

        let mut next = session.clone();
        if next.fee.amount_usd.is_none() {
            match self.prices.usd_price(coin).await {
                Ok(price) => {
                    next.fee.amount_usd =
                        Some(to_native_f64(next.received_amount, coin.decimals()) * price)
                }
                Err(err) => {
                    warn!("Session {}: fee deferred, no valuation: {}", session.id, err);
                    return Ok(stored);
                }
            }
        }

        let split = match self.fees.apply_fee(&mut next) {
            Ok(split) => split,
            Err(err) => {
                warn!("Session {} needs review: {}", session.id, err);
                let reason = format!("fee computation failed: {}", err);
                return Ok(self.store.flag_for_review(&stored, reason)?);
            }
        };
        next.set_status(SessionStatus::FeeComputed);
        let stored = self.store.update(&stored, next)?;

        info!(
            "Session {}: fee {} net {} {}",
            stored.session.id,
            format_amount(split.fee_amount, coin.decimals()),
            format_amount(split.net_amount, coin.decimals()),
            coin
        );
        Ok(stored)
    }

    /// Drive one session as far as the chain allows right now.
    pub async fn process_session(
        &self,
        stored: StoredSession,
    ) -> Result<StoredSession, GatewayError> {
        let stored = self.monitor.check(stored).await?;
        let stored = self.compute_fee(stored).await?;
        let stored = self.forwarder.forward(stored).await?;
        self.forwarder.sweep_fees(stored).await
    }

    /// Hand a session whose step failed definitively to an operator, so
    /// later ticks stop retrying it.
    fn flag_failed(&self, id: &Uuid, err: &GatewayError) -> Result<(), GatewayError> {
        let Some(current) = self.store.get(id)? else {
            return Ok(());
        };
        if current.session.status == SessionStatus::NeedsReview {
            return Ok(());
        }
        self.store.flag_for_review(&current, err.to_string())?;
        Ok(())
    }

    /// Process every open session, at most `max_concurrent_sessions` at a
    /// time.
    pub async fn tick(&self) -> Result<TickSummary, GatewayError> {
        let open = self.store.list_open()?;
        let processed = open.len();
        let failed = AtomicUsize::new(0);

        futures::stream::iter(open)
            .for_each_concurrent(self.config.gateway.max_concurrent_sessions.max(1), |stored| {
                let failed = &failed;
                async move {
                    let id = stored.session.id;
                    match self.process_session(stored).await {
                        Ok(_) => {}
                        Err(GatewayError::StaleWrite(msg)) => {
                            // Someone else moved the session; next tick rereads it
                            debug!("Session {} changed concurrently: {}", id, msg);
                        }
                        Err(err) if err.needs_review() => {
                            warn!("Session {} needs review: {}", id, err);
                            if let Err(flag_err) = self.flag_failed(&id, &err) {
                                failed.fetch_add(1, Ordering::Relaxed);
                                error!("Session {} could not be flagged: {}", id, flag_err);
                            }
                        }
                        Err(err) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            error!("Session {} processing failed: {}", id, err);
                        }
                    }
                }
            })
            .await;

        Ok(TickSummary {
            processed,
            failed: failed.into_inner(),
        })
    }

    /// Run ticks every `poll_interval_secs` until shutdown.
    ///
    /// A tick in progress always finishes before shutdown is observed.
    pub async fn run(&self) -> Result<(), GatewayError> {
        info!(
            "Starting gateway engine (poll every {}s, {} concurrent sessions)",
            self.config.gateway.poll_interval_secs, self.config.gateway.max_concurrent_sessions
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.gateway.poll_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Gateway engine shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(summary) if summary.processed > 0 => debug!(
                            "Tick processed {} sessions, {} failed",
                            summary.processed, summary.failed
                        ),
                        Ok(_) => {}
                        Err(err) => error!("Tick failed: {}", err),
                    }
                }
            }
        }

        info!("Gateway engine stopped");
        Ok(())
    }
}
