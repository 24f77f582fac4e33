// Copyright (c) 2024 The Botho Foundation

//! Platform fee computation.
//!
//! The fee is a pure function of `(cryptocurrency, receivedAmount,
//! amountUSD)` and the configured tier table, so an auditor recomputing it
//! from a stored session always gets the same split.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::amount::Amount;
use crate::coin::Cryptocurrency;
use crate::config::{FeeTier, GatewayConfig};
use crate::session::{HistoryEvent, HistoryEventType, Session};

const BPS_DENOMINATOR: u128 = 10_000;

/// Errors from fee computation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeeError {
    #[error("session {0} has no USD valuation")]
    MissingValuation(String),
}

/// Result of splitting a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub fee_amount: Amount,
    pub net_amount: Amount,
}

/// Fee table for a single coin.
#[derive(Debug, Clone, PartialEq)]
pub struct FeePolicy {
    tiers: Vec<FeeTier>,
}

impl FeePolicy {
    /// Build a policy from tiers in ascending `min_usd` order.
    pub fn new(tiers: Vec<FeeTier>) -> Self {
        Self { tiers }
    }

    /// Tier that applies to a valuation, if any.
    pub fn tier_for(&self, amount_usd: f64) -> Option<&FeeTier> {
        self.tiers
            .iter()
            .rev()
            .find(|tier| amount_usd >= tier.min_usd)
    }

    /// Split `received` into fee and net amount.
    ///
    /// The proportional part rounds up, so any sub-unit remainder stays with
    /// the fee. The flat part is converted through integer cents of the
    /// valuation. The fee never exceeds `received`.
    pub fn compute(&self, received: Amount, amount_usd: f64) -> FeeSplit {
        let fee = match self.tier_for(amount_usd) {
            Some(tier) => {
                let proportional = proportional_fee(received, tier.fee_bps);
                let flat = flat_fee(received, tier.flat_usd, amount_usd);
                proportional.saturating_add(flat).min(received)
            }
            None => 0,
        };

        FeeSplit {
            fee_amount: fee,
            net_amount: received - fee,
        }
    }
}

fn proportional_fee(received: Amount, fee_bps: u32) -> Amount {
    let bps = fee_bps as u128;
    match received.checked_mul(bps) {
        Some(scaled) => scaled.div_ceil(BPS_DENOMINATOR),
        // Only reachable for absurd balances; fall back to coarser rounding
        None => (received / BPS_DENOMINATOR).saturating_mul(bps).saturating_add(bps),
    }
}

fn flat_fee(received: Amount, flat_usd: f64, amount_usd: f64) -> Amount {
    let flat_cents = to_cents(flat_usd);
    let value_cents = to_cents(amount_usd);
    if flat_cents == 0 {
        return 0;
    }
    if value_cents == 0 || flat_cents >= value_cents {
        return received;
    }
    match received.checked_mul(flat_cents) {
        Some(scaled) => scaled.div_ceil(value_cents),
        None => (received / value_cents).saturating_mul(flat_cents),
    }
}

fn to_cents(usd: f64) -> u128 {
    if usd.is_finite() && usd > 0.0 {
        (usd * 100.0).round() as u128
    } else {
        0
    }
}

/// Computes and records platform fees for confirmed sessions.
#[derive(Debug, Clone)]
pub struct FeeEngine {
    default_policy: FeePolicy,
    overrides: BTreeMap<Cryptocurrency, FeePolicy>,
}

impl FeeEngine {
    pub fn new(default_policy: FeePolicy) -> Self {
        Self {
            default_policy,
            overrides: BTreeMap::new(),
        }
    }

    /// Build the engine from the global table and per-coin overrides.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut engine = Self::new(FeePolicy::new(config.fees.tiers.clone()));
        for (coin, coin_config) in &config.coins {
            if let Some(tiers) = &coin_config.fee_tiers {
                engine.overrides.insert(*coin, FeePolicy::new(tiers.clone()));
            }
        }
        engine
    }

    /// Use a dedicated table for one coin.
    pub fn with_override(mut self, coin: Cryptocurrency, policy: FeePolicy) -> Self {
        self.overrides.insert(coin, policy);
        self
    }

    pub fn policy(&self, coin: Cryptocurrency) -> &FeePolicy {
        self.overrides.get(&coin).unwrap_or(&self.default_policy)
    }

    /// Fee split for a deposit.
    pub fn compute_fee(
        &self,
        coin: Cryptocurrency,
        received: Amount,
        amount_usd: f64,
    ) -> FeeSplit {
        self.policy(coin).compute(received, amount_usd)
    }

    /// Compute the fee for a session and write it into the fee record.
    ///
    /// Does not touch the status; the caller moves the session to
    /// `fee_computed` in the same store write.
    pub fn apply_fee(&self, session: &mut Session) -> Result<FeeSplit, FeeError> {
        let amount_usd = session
            .fee
            .amount_usd
            .ok_or_else(|| FeeError::MissingValuation(session.id.to_string()))?;

        let split = self.compute_fee(session.cryptocurrency, session.received_amount, amount_usd);

        session.fee.fee_taken = split.fee_amount > 0;
        session.fee.fee_amount = split.fee_amount;
        session.fee.fee_remaining = split.fee_amount;
        session.fee.fees_collected = split.fee_amount == 0;
        session.transaction_history.push(
            HistoryEvent::new(HistoryEventType::FeeComputed).with_detail(format!(
                "fee {} net {} at ${:.2}",
                split.fee_amount, split.net_amount, amount_usd
            )),
        );

        Ok(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::parse_amount;
    use crate::session::SessionStatus;

    fn one_percent_over_ten() -> FeePolicy {
        FeePolicy::new(vec![FeeTier {
            min_usd: 10.0,
            fee_bps: 100,
            flat_usd: 0.0,
        }])
    }

    fn confirmed_session(received: Amount, amount_usd: Option<f64>) -> Session {
        let mut session = Session::new(
            Cryptocurrency::Eth,
            1,
            "0x1111111111111111111111111111111111111111".to_string(),
            "0x2222222222222222222222222222222222222222".to_string(),
            received,
        );
        session.received_amount = received;
        session.fee.amount_usd = amount_usd;
        session.status = SessionStatus::Confirmed;
        session
    }

    #[test]
    fn test_below_threshold_no_fee() {
        let engine = FeeEngine::new(one_percent_over_ten());
        let received = parse_amount("0.002", 18).unwrap();
        let mut session = confirmed_session(received, Some(5.0));

        let split = engine.apply_fee(&mut session).unwrap();

        assert_eq!(split.fee_amount, 0);
        assert_eq!(split.net_amount, received);
        assert!(!session.fee.fee_taken);
        assert!(session.fee.fees_collected);
        assert_eq!(session.fee.fee_remaining, 0);
        assert!(session.check_invariants().is_ok());
    }

    #[test]
    fn test_above_threshold_fee_sums_exactly() {
        let engine = FeeEngine::new(one_percent_over_ten());
        let received = parse_amount("0.27942715", 18).unwrap();
        let mut session = confirmed_session(received, Some(260.0));

        let split = engine.apply_fee(&mut session).unwrap();

        assert!(session.fee.fee_taken);
        assert_eq!(split.fee_amount, 2_794_271_500_000_000);
        assert_eq!(split.fee_amount + split.net_amount, received);
        assert_eq!(session.fee.fee_remaining, split.fee_amount);
        assert!(!session.fee.fees_collected);
        assert!(session.has_event(HistoryEventType::FeeComputed, None));
    }

    #[test]
    fn test_rounding_remainder_stays_with_fee() {
        let policy = one_percent_over_ten();
        let split = policy.compute(199, 50.0);
        // 1% of 199 is 1.99 units
        assert_eq!(split.fee_amount, 2);
        assert_eq!(split.net_amount, 197);
    }

    #[test]
    fn test_highest_matching_tier_applies() {
        let policy = FeePolicy::new(vec![
            FeeTier { min_usd: 10.0, fee_bps: 200, flat_usd: 0.0 },
            FeeTier { min_usd: 1000.0, fee_bps: 50, flat_usd: 0.0 },
        ]);
        assert_eq!(policy.compute(10_000, 500.0).fee_amount, 200);
        assert_eq!(policy.compute(10_000, 1000.0).fee_amount, 50);
        assert_eq!(policy.compute(10_000, 9.99).fee_amount, 0);
    }

    #[test]
    fn test_flat_fee_converted_through_valuation() {
        let policy = FeePolicy::new(vec![FeeTier {
            min_usd: 0.0,
            fee_bps: 0,
            flat_usd: 1.0,
        }]);
        // $1 of a $100 deposit is 1%
        let split = policy.compute(1_000_000, 100.0);
        assert_eq!(split.fee_amount, 10_000);
        assert_eq!(split.net_amount, 990_000);
    }

    #[test]
    fn test_fee_capped_at_received() {
        let policy = FeePolicy::new(vec![FeeTier {
            min_usd: 0.0,
            fee_bps: 100,
            flat_usd: 50.0,
        }]);
        let split = policy.compute(1_000, 20.0);
        assert_eq!(split.fee_amount, 1_000);
        assert_eq!(split.net_amount, 0);
    }

    #[test]
    fn test_missing_valuation() {
        let engine = FeeEngine::new(one_percent_over_ten());
        let mut session = confirmed_session(1_000, None);
        assert!(matches!(
            engine.apply_fee(&mut session),
            Err(FeeError::MissingValuation(_))
        ));
    }

    #[test]
    fn test_coin_override() {
        let engine = FeeEngine::new(one_percent_over_ten()).with_override(
            Cryptocurrency::Matic,
            FeePolicy::new(vec![FeeTier { min_usd: 0.0, fee_bps: 300, flat_usd: 0.0 }]),
        );
        assert_eq!(engine.compute_fee(Cryptocurrency::Matic, 10_000, 5.0).fee_amount, 300);
        assert_eq!(engine.compute_fee(Cryptocurrency::Eth, 10_000, 5.0).fee_amount, 0);
    }

    #[test]
    fn test_split_is_deterministic() {
        let engine = FeeEngine::new(one_percent_over_ten());
        let received = parse_amount("1.23456789", 18).unwrap();
        let first = engine.compute_fee(Cryptocurrency::Eth, received, 3000.0);
        let second = engine.compute_fee(Cryptocurrency::Eth, received, 3000.0);
        assert_eq!(first, second);
        assert_eq!(first.fee_amount + first.net_amount, received);
    }
}
