// Copyright (c) 2024 The Botho Foundation

//! EVM value transfers signed as EIP-155 legacy transactions.
//!
//! Forwarding only ever moves the native coin from a payment address to a
//! consolidation address, so a legacy transaction with empty calldata
//! covers every supported chain.

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::{Decodable2718, Encodable2718};
use alloy::network::TxSignerSync;
use alloy::primitives::{keccak256, Address, Bytes, TxKind, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use thiserror::Error;

use crate::amount::Amount;

/// Errors from building, signing or decoding a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    #[error("invalid hex: {0}")]
    Hex(String),

    #[error("invalid encoding: {0}")]
    Encoding(String),

    #[error("invalid signature: {0}")]
    Signature(String),
}

/// An unsigned legacy value transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyTransaction(TxLegacy);

impl LegacyTransaction {
    /// Plain value transfer with no calldata.
    pub fn transfer(
        nonce: u64,
        gas_price: u128,
        gas_limit: u64,
        to: Address,
        value: Amount,
        chain_id: u64,
    ) -> Self {
        Self(TxLegacy {
            chain_id: Some(chain_id),
            nonce,
            gas_price,
            gas_limit,
            to: TxKind::Call(to),
            value: U256::from(value),
            input: Bytes::new(),
        })
    }

    pub fn nonce(&self) -> u64 {
        self.0.nonce
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.0.chain_id
    }

    /// Recipient, `None` for contract creation.
    pub fn to(&self) -> Option<Address> {
        self.0.to.to().copied()
    }

    pub fn value(&self) -> Amount {
        u128::try_from(self.0.value).unwrap_or(Amount::MAX)
    }

    /// Network fee reserved by this transaction.
    pub fn max_network_fee(&self) -> Amount {
        self.0.gas_price.saturating_mul(self.0.gas_limit as u128)
    }

    /// Hash the signer commits to.
    pub fn signing_hash(&self) -> B256 {
        self.0.signature_hash()
    }

    /// Sign and encode for `eth_sendRawTransaction`.
    pub fn sign(&self, signer: &PrivateKeySigner) -> Result<SignedTransaction, TxError> {
        let mut tx = self.0.clone();
        let signature = signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| TxError::Signature(e.to_string()))?;
        let envelope = TxEnvelope::from(tx.into_signed(signature));
        Ok(SignedTransaction::from_raw(envelope.encoded_2718()))
    }
}

/// A signed transaction decoded back into its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTransaction {
    pub tx: LegacyTransaction,
    /// Sender recovered from the signature
    pub from: Address,
}

/// A signed, encoded transaction and its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    raw: Vec<u8>,
    hash: B256,
}

impl SignedTransaction {
    pub fn from_raw(raw: Vec<u8>) -> Self {
        let hash = keccak256(&raw);
        Self { raw, hash }
    }

    /// Rebuild from the `0x`-prefixed hex stored on the session.
    pub fn from_raw_hex(raw_hex: &str) -> Result<Self, TxError> {
        let raw = hex::decode(raw_hex.trim_start_matches("0x"))
            .map_err(|e| TxError::Hex(e.to_string()))?;
        Ok(Self::from_raw(raw))
    }

    /// Decode the fields and recover the sender.
    ///
    /// Only EIP-155 legacy transfers are accepted; the gateway never signs
    /// anything else.
    pub fn decode(&self) -> Result<DecodedTransaction, TxError> {
        let mut buf = self.raw.as_slice();
        let envelope =
            TxEnvelope::decode_2718(&mut buf).map_err(|e| TxError::Encoding(e.to_string()))?;
        if !buf.is_empty() {
            return Err(TxError::Encoding(format!(
                "{} trailing bytes after transaction",
                buf.len()
            )));
        }

        let TxEnvelope::Legacy(signed) = envelope else {
            return Err(TxError::Encoding(
                "only legacy transactions are supported".to_string(),
            ));
        };
        if signed.tx().chain_id.is_none() {
            return Err(TxError::Signature("transaction is not EIP-155".to_string()));
        }

        let from = signed
            .recover_signer()
            .map_err(|e| TxError::Signature(e.to_string()))?;
        Ok(DecodedTransaction {
            tx: LegacyTransaction(signed.tx().clone()),
            from,
        })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn hash(&self) -> B256 {
        self.hash
    }

    pub fn raw_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.raw))
    }

    pub fn hash_hex(&self) -> String {
        format!("0x{}", hex::encode(self.hash))
    }
}
