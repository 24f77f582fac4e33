// Copyright (c) 2024 The Botho Foundation

//! Payment session record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::{amount_serde, option_amount_serde, Amount};
use crate::coin::Cryptocurrency;

/// The status of a payment session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Address issued, waiting for a deposit
    Pending,

    /// Value observed on-chain, waiting for confirmations
    Detected,

    /// Deposit reached the coin's confirmation threshold
    Confirmed,

    /// Platform fee split recorded, ready to forward
    FeeComputed,

    /// Forwarding transaction signed and handed to the network
    Forwarding,

    /// Forwarding transaction accepted, waiting for confirmations
    Forwarded,

    /// Last forwarding attempt failed
    ForwardFailed,

    /// Forwarding transaction confirmed, session complete
    Completed,

    /// Data anomaly, automatic processing halted
    NeedsReview,
}

impl SessionStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [SessionStatus; 9] = [
        SessionStatus::Pending,
        SessionStatus::Detected,
        SessionStatus::Confirmed,
        SessionStatus::FeeComputed,
        SessionStatus::Forwarding,
        SessionStatus::Forwarded,
        SessionStatus::ForwardFailed,
        SessionStatus::Completed,
        SessionStatus::NeedsReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Detected => "detected",
            SessionStatus::Confirmed => "confirmed",
            SessionStatus::FeeComputed => "fee_computed",
            SessionStatus::Forwarding => "forwarding",
            SessionStatus::Forwarded => "forwarded",
            SessionStatus::ForwardFailed => "forward_failed",
            SessionStatus::Completed => "completed",
            SessionStatus::NeedsReview => "needs_review",
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed)
    }

    /// Statuses the deposit monitor watches.
    pub fn is_monitored(&self) -> bool {
        matches!(
            self,
            SessionStatus::Pending | SessionStatus::Detected | SessionStatus::Confirmed
        )
    }

    /// Check whether moving from `self` to `next` is a legal transition.
    ///
    /// Writing the same status again is always allowed so that field-only
    /// updates go through the same path.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        if *self == next || next == NeedsReview {
            return true;
        }

        matches!(
            (*self, next),
            (Pending, Detected)
                | (Detected, Confirmed)
                | (Detected, Pending)
                | (Confirmed, FeeComputed)
                | (Confirmed, Pending)
                | (FeeComputed, Forwarding)
                | (FeeComputed, ForwardFailed)
                | (Forwarding, Forwarded)
                | (Forwarding, ForwardFailed)
                | (ForwardFailed, Forwarding)
                | (Forwarded, Completed)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown session status: {}", s))
    }
}

/// Kind of an entry in a session's transaction history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    SessionCreated,
    DepositDetected,
    DepositUpdated,
    Underpaid,
    Overpaid,
    DepositConfirmed,
    ReorgDetected,
    WatchExpired,
    FeeComputed,
    ForwardBroadcast,
    ForwardRebroadcast,
    ForwardFailed,
    ManualForwardRequired,
    ForwardConfirmed,
    FeeSweepBroadcast,
    FeesCollected,
    NeedsReview,
    ReviewReleased,
    /// Event written by tooling this version does not know about
    #[serde(other)]
    Other,
}

/// One append-only entry of a session's transaction history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "type")]
    pub event_type: HistoryEventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HistoryEvent {
    pub fn new(event_type: HistoryEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            confirmations: None,
            detail: None,
        }
    }

    pub fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = Some(confirmations);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Platform fee bookkeeping for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeRecord {
    /// Whether a fee was applicable
    pub fee_taken: bool,

    /// Fee retained from the deposit, in base units
    #[serde(with = "amount_serde")]
    pub fee_amount: Amount,

    /// Fee still sitting at the payment address
    #[serde(with = "amount_serde")]
    pub fee_remaining: Amount,

    /// Whether the fee has been swept out of the payment address
    pub fees_collected: bool,

    /// USD valuation of the deposit at detection time
    #[serde(rename = "amountUSD", default)]
    pub amount_usd: Option<f64>,

    /// Fee sweep transaction, once signed
    #[serde(default)]
    pub sweep_tx_hash: Option<String>,

    /// Raw signed fee sweep transaction (hex)
    #[serde(default)]
    pub sweep_signed_tx: Option<String>,
}

/// Forwarding bookkeeping for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRecord {
    /// Set when the gateway forwarded the funds itself
    pub auto_forwarded: bool,

    /// Amount that left the payment address, after the network fee
    #[serde(with = "amount_serde")]
    pub forwarded_amount: Amount,

    /// Accepted forwarding transaction; written at most once
    #[serde(default)]
    pub forwarding_tx_hash: Option<String>,

    /// Last forwarding error, if any
    #[serde(default)]
    pub forwarding_error: Option<String>,

    /// Automatic forwarding gave up; an operator must act
    pub manual_forward: bool,

    #[serde(default)]
    pub manual_forward_reason: Option<String>,

    /// Number of forwarding attempts so far
    #[serde(default)]
    pub attempts: u32,

    /// Earliest time of the next automatic attempt
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Hash of a signed transaction whose broadcast outcome is unknown
    #[serde(default)]
    pub pending_tx_hash: Option<String>,

    /// Raw signed forwarding transaction (hex), kept for rebroadcast
    #[serde(default)]
    pub signed_tx: Option<String>,
}

/// A payment session: one deposit address, one deposit, one forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique session identifier
    pub id: Uuid,

    pub cryptocurrency: Cryptocurrency,

    /// HD derivation index of the payment address
    pub address_index: u64,

    /// One-time deposit address
    pub payment_address: String,

    /// Consolidation address the net amount is forwarded to
    pub forwarding_address: String,

    #[serde(with = "amount_serde")]
    pub expected_amount: Amount,

    /// Observed on-chain by the deposit monitor
    #[serde(with = "amount_serde")]
    pub received_amount: Amount,

    /// Credited amount after a manual correction
    #[serde(default, with = "option_amount_serde")]
    pub final_amount: Option<Amount>,

    pub status: SessionStatus,

    /// Inbound deposit transaction
    #[serde(default)]
    pub tx_hash: Option<String>,

    /// Current confirmation count of the deposit
    #[serde(default)]
    pub confirmations: u64,

    #[serde(default)]
    pub fee: FeeRecord,

    #[serde(default)]
    pub forwarding: ForwardingRecord,

    /// Why the session was moved to `needs_review`
    #[serde(default)]
    pub review_reason: Option<String>,

    /// Status held before `needs_review`, restored on release
    #[serde(default)]
    pub status_before_review: Option<SessionStatus>,

    #[serde(default)]
    pub transaction_history: Vec<HistoryEvent>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new pending session.
    pub fn new(
        cryptocurrency: Cryptocurrency,
        address_index: u64,
        payment_address: String,
        forwarding_address: String,
        expected_amount: Amount,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            cryptocurrency,
            address_index,
            payment_address,
            forwarding_address,
            expected_amount,
            received_amount: 0,
            final_amount: None,
            status: SessionStatus::Pending,
            tx_hash: None,
            confirmations: 0,
            fee: FeeRecord::default(),
            forwarding: ForwardingRecord::default(),
            review_reason: None,
            status_before_review: None,
            transaction_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the session status.
    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Halt automatic processing and remember where the session was.
    pub fn flag_for_review(&mut self, reason: impl Into<String>) {
        if self.status != SessionStatus::NeedsReview {
            self.status_before_review = Some(self.status);
        }
        self.review_reason = Some(reason.into());
        self.set_status(SessionStatus::NeedsReview);
    }

    /// Return a reviewed session to the status it held before review.
    pub fn release_review(&mut self) -> Result<SessionStatus, String> {
        if self.status != SessionStatus::NeedsReview {
            return Err(format!("session {} is not under review", self.id));
        }
        let previous = self
            .status_before_review
            .take()
            .ok_or_else(|| format!("session {} has no status to restore", self.id))?;
        self.review_reason = None;
        self.set_status(previous);
        Ok(previous)
    }

    /// Amount left for the consolidation address after the platform fee.
    pub fn net_amount(&self) -> Amount {
        self.received_amount.saturating_sub(self.fee.fee_amount)
    }

    /// Amount credited to the payer: the manual correction if any.
    pub fn credited_amount(&self) -> Amount {
        self.final_amount.unwrap_or(self.received_amount)
    }

    /// Check if a failed forward may be retried at `now`.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        if self.forwarding.manual_forward {
            return false;
        }
        self.forwarding
            .next_retry_at
            .map_or(true, |retry_at| retry_at <= now)
    }

    /// Check if the engine still has work to do on this session.
    ///
    /// Sessions under review or waiting for a manual forward are left to the
    /// operator; completed sessions stay open until their fee is swept.
    /// Pending sessions whose watch window expired are no longer polled.
    pub fn is_open(&self) -> bool {
        match self.status {
            SessionStatus::NeedsReview => false,
            SessionStatus::Pending => !self.has_event(HistoryEventType::WatchExpired, None),
            SessionStatus::Completed => self.fee.fee_taken && !self.fee.fees_collected,
            _ => !self.forwarding.manual_forward,
        }
    }

    /// Check if the history already holds an event of this type and detail.
    pub fn has_event(&self, event_type: HistoryEventType, detail: Option<&str>) -> bool {
        self.transaction_history
            .iter()
            .any(|e| e.event_type == event_type && (detail.is_none() || e.detail.as_deref() == detail))
    }

    /// Validate the monetary invariants of the record.
    pub fn check_invariants(&self) -> Result<(), String> {
        let spent = self
            .fee
            .fee_amount
            .checked_add(self.forwarding.forwarded_amount)
            .ok_or_else(|| "fee plus forwarded amount overflows".to_string())?;
        if spent > self.received_amount {
            return Err(format!(
                "fee {} plus forwarded {} exceeds received {}",
                self.fee.fee_amount, self.forwarding.forwarded_amount, self.received_amount
            ));
        }
        if self.fee.fee_remaining > self.fee.fee_amount {
            return Err(format!(
                "fee remaining {} exceeds fee {}",
                self.fee.fee_remaining, self.fee.fee_amount
            ));
        }
        if self.fee.fee_taken != (self.fee.fee_amount > 0) {
            return Err("feeTaken disagrees with feeAmount".to_string());
        }
        Ok(())
    }
}
