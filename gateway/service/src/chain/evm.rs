// Copyright (c) 2024 The Botho Foundation

//! EVM chain client over alloy HTTP providers.
//!
//! Reads and broadcasts go to a list of RPC endpoints with failover: the
//! primary endpoint is tried first and whichever endpoint answers becomes
//! the new primary. Address history comes from an Etherscan-compatible
//! explorer (`module=account&action=txlist`), since plain JSON-RPC cannot
//! list the transactions of an address.

use alloy::network::ReceiptResponse;
use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::client::RpcClient;
use alloy::transports::http::Http;
use alloy::transports::{RpcError, TransportError, TransportResult};
use async_trait::async_trait;
use bth_gateway_core::{
    Amount, CoinConfig, Cryptocurrency, GatewayConfig, RetrySettings, SignedTransaction,
};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ChainClient, ChainTransfer, TransactionStatus, TransferParams};
use crate::backoff::{retry_transient, rpc_delays};
use crate::error::ChainError;

type HttpProvider = RootProvider<Http<reqwest::Client>>;

/// Etherscan-style API envelope
#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    message: String,
    result: Value,
}

/// One entry of an explorer `txlist` result
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExplorerTx {
    hash: String,
    from: String,
    #[serde(default)]
    to: String,
    value: String,
    #[serde(default)]
    confirmations: String,
    #[serde(default)]
    block_number: String,
    #[serde(default)]
    is_error: String,
    #[serde(default, rename = "txreceipt_status")]
    txreceipt_status: String,
}

impl ExplorerTx {
    fn into_transfer(self) -> Result<ChainTransfer, ChainError> {
        let value = self
            .value
            .parse::<u128>()
            .map_err(|e| ChainError::Malformed(format!("value {}: {}", self.value, e)))?;
        let confirmations = self.confirmations.parse::<u64>().unwrap_or(0);
        let block_number = self.block_number.parse::<u64>().ok();
        let success = self.is_error != "1" && self.txreceipt_status != "0";

        Ok(ChainTransfer {
            hash: self.hash,
            from: self.from,
            to: self.to,
            value,
            confirmations,
            block_number,
            success,
        })
    }
}

/// Map a node's JSON-RPC error onto the gateway taxonomy.
fn classify_rpc_error(code: i64, message: &str) -> ChainError {
    let lower = message.to_lowercase();
    if lower.contains("insufficient funds") {
        ChainError::InsufficientFundsForFee(message.to_string())
    } else if lower.contains("rate limit") || lower.contains("timeout") || code == -32005 {
        ChainError::Transient(format!("RPC error {}: {}", code, message))
    } else {
        ChainError::Rejected(format!("RPC error {}: {}", code, message))
    }
}

fn classify_transport_error(err: TransportError) -> ChainError {
    match err {
        RpcError::ErrorResp(payload) => classify_rpc_error(payload.code, &payload.message),
        RpcError::Transport(kind) => ChainError::Transient(kind.to_string()),
        err @ (RpcError::NullResp | RpcError::DeserError { .. } | RpcError::SerError(_)) => {
            ChainError::Malformed(err.to_string())
        }
        other => ChainError::Transient(other.to_string()),
    }
}

/// Errors that mean "the node already has this transaction".
fn is_already_known(err: &ChainError) -> bool {
    match err {
        ChainError::Rejected(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("already known") || msg.contains("known transaction")
        }
        _ => false,
    }
}

fn parse_address(address: &str) -> Result<Address, ChainError> {
    address
        .parse()
        .map_err(|e| ChainError::Malformed(format!("address {}: {}", address, e)))
}

fn parse_hash(hash: &str) -> Result<B256, ChainError> {
    hash.parse()
        .map_err(|e| ChainError::Malformed(format!("hash {}: {}", hash, e)))
}

/// Query of an explorer `txlist` call. No block range is given, so the
/// explorer returns the address history up to its current head.
fn txlist_query(address: &str, api_key: Option<&str>) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("module", "account".to_string()),
        ("action", "txlist".to_string()),
        ("address", address.to_string()),
        ("startblock", "0".to_string()),
        ("sort", "asc".to_string()),
    ];
    if let Some(key) = api_key {
        query.push(("apikey", key.to_string()));
    }
    query
}

struct Endpoint {
    url: String,
    provider: HttpProvider,
}

/// [`ChainClient`] over JSON-RPC endpoints and an explorer API.
pub struct EvmChainClient {
    coin: Cryptocurrency,
    chain_id: u64,
    endpoints: Vec<Endpoint>,
    primary: AtomicUsize,
    explorer_url: String,
    explorer_api_key: Option<String>,
    retry: RetrySettings,
    client: reqwest::Client,
}

impl EvmChainClient {
    pub fn new(
        coin: Cryptocurrency,
        chain_id: u64,
        coin_config: &CoinConfig,
        retry: RetrySettings,
        timeout: Duration,
    ) -> Result<Self, ChainError> {
        if coin_config.rpc_endpoints.is_empty() {
            return Err(ChainError::Malformed(format!("{}: no RPC endpoints", coin)));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Malformed(format!("HTTP client: {}", e)))?;

        let endpoints = coin_config
            .rpc_endpoints
            .iter()
            .map(|url| {
                let parsed = url
                    .parse::<reqwest::Url>()
                    .map_err(|e| ChainError::Malformed(format!("{}: {}", url, e)))?;
                let transport = Http::with_client(client.clone(), parsed);
                Ok(Endpoint {
                    url: url.clone(),
                    provider: RootProvider::new(RpcClient::new(transport, false)),
                })
            })
            .collect::<Result<Vec<_>, ChainError>>()?;

        Ok(Self {
            coin,
            chain_id,
            endpoints,
            primary: AtomicUsize::new(0),
            explorer_url: coin_config.explorer_url.clone(),
            explorer_api_key: coin_config.explorer_api_key.clone(),
            retry,
            client,
        })
    }

    /// Build the client for `coin` from the gateway config.
    pub fn from_config(config: &GatewayConfig, coin: Cryptocurrency) -> Result<Self, ChainError> {
        let coin_config = config
            .coin(coin)
            .map_err(|e| ChainError::Malformed(e.to_string()))?;
        Self::new(
            coin,
            config.chain_id(coin),
            coin_config,
            config.retry.clone(),
            Duration::from_secs(config.gateway.rpc_timeout_secs),
        )
    }

    /// One provider call with endpoint failover.
    ///
    /// Transport failures move on to the next endpoint; an answer from any
    /// node, error or not, is final.
    async fn rpc<T, F, Fut>(&self, method: &str, call: &F) -> Result<T, ChainError>
    where
        F: Fn(HttpProvider) -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let start = self.primary.load(Ordering::Relaxed) % self.endpoints.len();
        let mut last_err = None;

        for offset in 0..self.endpoints.len() {
            let idx = (start + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[idx];

            match call(endpoint.provider.clone()).await.map_err(classify_transport_error) {
                Err(err) if err.is_transient() => {
                    warn!("{} {} via {} failed: {}", self.coin, method, endpoint.url, err);
                    last_err = Some(err);
                }
                result => {
                    if idx != start {
                        debug!("{} promoting endpoint {} to primary", self.coin, endpoint.url);
                        self.primary.store(idx, Ordering::Relaxed);
                    }
                    return result;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ChainError::Transient("no endpoints".to_string())))
    }

    /// Provider call with failover, retried with backoff while transient.
    async fn rpc_retry<T, F, Fut>(&self, method: &str, call: F) -> Result<T, ChainError>
    where
        F: Fn(HttpProvider) -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        retry_transient(rpc_delays(&self.retry), method, || self.rpc(method, &call)).await
    }

    async fn explorer_txlist(&self, address: &str) -> Result<Vec<ChainTransfer>, ChainError> {
        let query = txlist_query(address, self.explorer_api_key.as_deref());

        let response = self
            .client
            .get(&self.explorer_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ChainError::Transient(format!("explorer: {}", e)))?;

        if !response.status().is_success() {
            return Err(ChainError::Transient(format!(
                "explorer: HTTP {}",
                response.status()
            )));
        }

        let body: ExplorerResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Malformed(format!("explorer: {}", e)))?;

        parse_txlist(body)
    }
}

fn parse_txlist(body: ExplorerResponse) -> Result<Vec<ChainTransfer>, ChainError> {
    if body.status != "1" {
        // "No transactions found" is an empty history, not a failure
        if body.message.starts_with("No transactions") {
            return Ok(Vec::new());
        }
        return Err(ChainError::Transient(format!(
            "explorer: {} ({})",
            body.message, body.result
        )));
    }

    let txs: Vec<ExplorerTx> = serde_json::from_value(body.result)
        .map_err(|e| ChainError::Malformed(format!("explorer txlist: {}", e)))?;
    txs.into_iter().map(ExplorerTx::into_transfer).collect()
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn coin(&self) -> Cryptocurrency {
        self.coin
    }

    async fn balance(&self, address: &str) -> Result<Amount, ChainError> {
        let address = parse_address(address)?;
        let balance = self
            .rpc_retry("eth_getBalance", |p| async move { p.get_balance(address).await })
            .await?;
        u128::try_from(balance).map_err(|e| ChainError::Malformed(format!("balance: {}", e)))
    }

    async fn transactions_for_address(
        &self,
        address: &str,
    ) -> Result<Vec<ChainTransfer>, ChainError> {
        retry_transient(rpc_delays(&self.retry), "txlist", || {
            self.explorer_txlist(address)
        })
        .await
    }

    async fn broadcast(&self, raw_tx: &str) -> Result<String, ChainError> {
        let signed =
            SignedTransaction::from_raw_hex(raw_tx).map_err(|e| ChainError::Rejected(e.to_string()))?;
        let local_hash = signed.hash_hex();

        let result = self
            .rpc_retry("eth_sendRawTransaction", |p| {
                let raw = signed.raw().to_vec();
                async move {
                    let pending = p.send_raw_transaction(&raw).await?;
                    Ok::<_, TransportError>(*pending.tx_hash())
                }
            })
            .await;

        match result {
            Ok(hash) => {
                if hash != signed.hash() {
                    warn!(
                        "{} node returned hash {} for transaction {}",
                        self.coin, hash, local_hash
                    );
                }
                Ok(local_hash)
            }
            Err(err) if is_already_known(&err) => {
                debug!("{} transaction {} already known", self.coin, local_hash);
                Ok(local_hash)
            }
            Err(err) => Err(err),
        }
    }

    async fn transaction(&self, hash: &str) -> Result<Option<TransactionStatus>, ChainError> {
        let hash = parse_hash(hash)?;
        let receipt = self
            .rpc_retry("eth_getTransactionReceipt", |p| async move {
                p.get_transaction_receipt(hash).await
            })
            .await?;

        if let Some(receipt) = receipt {
            if let Some(block) = ReceiptResponse::block_number(&receipt) {
                let head = self
                    .rpc_retry("eth_blockNumber", |p| async move { p.get_block_number().await })
                    .await?;
                return Ok(Some(TransactionStatus {
                    confirmations: head.saturating_sub(block) + 1,
                    success: Some(ReceiptResponse::status(&receipt)),
                }));
            }
        }

        // No receipt yet: still in the mempool, or unknown to the node
        let tx = self
            .rpc_retry("eth_getTransactionByHash", |p| async move {
                p.get_transaction_by_hash(hash).await
            })
            .await?;
        Ok(tx.map(|_| TransactionStatus {
            confirmations: 0,
            success: None,
        }))
    }

    async fn transfer_params(&self, from: &str) -> Result<TransferParams, ChainError> {
        let from = parse_address(from)?;
        let (nonce, gas_price, chain_id) = tokio::try_join!(
            self.rpc_retry("eth_getTransactionCount", |p| async move {
                p.get_transaction_count(from).pending().await
            }),
            self.rpc_retry("eth_gasPrice", |p| async move { p.get_gas_price().await }),
            self.rpc_retry("eth_chainId", |p| async move { p.get_chain_id().await }),
        )?;

        if chain_id != self.chain_id {
            debug!(
                "{} node reports chain id {}, configured {}",
                self.coin, chain_id, self.chain_id
            );
        }
        Ok(TransferParams {
            nonce,
            gas_price,
            chain_id,
        })
    }
}
