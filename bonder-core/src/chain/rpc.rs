//! Ethereum JSON-RPC implementation of [`ChainAccess`].
//!
//! Transactions are sent with `eth_sendTransaction`, so the node (or a
//! signing proxy in front of it) holds the bonder key. Transport failures
//! rotate to the next configured RPC url.

use crate::chain::types::{
    Address, BlockHeader, BlockRange, H256, LogFilter, RawLog, TxHash, TxReceipt, TxRequest,
    decode_bytes, encode_bytes, format_quantity, parse_quantity, parse_u64_quantity,
};
use crate::chain::{ChainAccess, ChainError};
use async_trait::async_trait;
use bonder_sdk::objects::ChainId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: serde_json::Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    number: String,
    hash: String,
    parent_hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
    block_number: String,
    block_hash: String,
    transaction_hash: String,
    log_index: String,
    #[serde(default)]
    removed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: String,
    status: String,
    #[serde(default)]
    gas_used: Option<String>,
}

pub struct RpcChainClient {
    chain_id: ChainId,
    http: reqwest::Client,
    urls: Vec<Url>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
    receipt_poll_interval: Duration,
}

impl RpcChainClient {
    pub fn new(chain_id: ChainId, urls: Vec<Url>) -> Result<Self, ChainError> {
        if urls.is_empty() {
            return Err(ChainError::NoEndpoint);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            chain_id,
            http,
            urls,
            cursor: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            receipt_poll_interval: Duration::from_secs(2),
        })
    }

    pub fn with_receipt_poll_interval(mut self, interval: Duration) -> Self {
        self.receipt_poll_interval = interval;
        self
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, ChainError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let start = self.cursor.load(Ordering::Relaxed);
        let mut last_error = ChainError::NoEndpoint;
        for offset in 0..self.urls.len() {
            let index = (start + offset) % self.urls.len();
            let url = &self.urls[index];
            let sent = self.http.post(url.clone()).json(&request).send().await;
            let response = match sent {
                Ok(resp) => resp.error_for_status(),
                Err(e) => Err(e),
            };
            let body: JsonRpcResponse<T> = match response {
                Ok(resp) => match resp.json().await {
                    Ok(body) => body,
                    Err(e) => {
                        last_error = ChainError::Transport(e);
                        continue;
                    }
                },
                Err(e) => {
                    warn!(
                        chain = %self.chain_id,
                        url = %url,
                        method,
                        error = %e,
                        "RPC endpoint failed, rotating"
                    );
                    self.cursor
                        .store((index + 1) % self.urls.len(), Ordering::Relaxed);
                    last_error = ChainError::Transport(e);
                    continue;
                }
            };
            if let Some(error) = body.error {
                return Err(ChainError::Rpc {
                    code: error.code,
                    message: error.message,
                });
            }
            return Ok(body.result);
        }
        Err(last_error)
    }

    async fn call_required<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ChainError> {
        self.call(method, params)
            .await?
            .ok_or_else(|| ChainError::Decode(format!("{method} returned null")))
    }
}

fn convert_log(log: RpcLog) -> Result<RawLog, ChainError> {
    Ok(RawLog {
        address: log.address.parse::<Address>()?,
        topics: log
            .topics
            .iter()
            .map(|t| t.parse::<H256>())
            .collect::<Result<_, _>>()?,
        data: decode_bytes(&log.data)?,
        block_number: parse_u64_quantity(&log.block_number)?,
        block_hash: log.block_hash.parse()?,
        tx_hash: log.transaction_hash.parse()?,
        log_index: parse_u64_quantity(&log.log_index)?,
    })
}

#[async_trait]
impl ChainAccess for RpcChainClient {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn current_block_height(&self) -> Result<u64, ChainError> {
        let height: String = self
            .call_required("eth_blockNumber", serde_json::json!([]))
            .await?;
        Ok(parse_u64_quantity(&height)?)
    }

    async fn block_header(&self, number: u64) -> Result<BlockHeader, ChainError> {
        let block: Option<RpcBlock> = self
            .call(
                "eth_getBlockByNumber",
                serde_json::json!([format_quantity(number.into()), false]),
            )
            .await?;
        let block = block.ok_or_else(|| ChainError::NotFound(format!("block {number}")))?;
        Ok(BlockHeader {
            number: parse_u64_quantity(&block.number)?,
            hash: block.hash.parse()?,
            parent_hash: block.parent_hash.parse()?,
        })
    }

    async fn logs(&self, range: BlockRange, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        let addresses: Vec<String> = filter.addresses.iter().map(|a| a.to_string()).collect();
        let topics0: Vec<String> = filter.topics0.iter().map(|t| t.to_string()).collect();
        let params = serde_json::json!([{
            "fromBlock": format_quantity((*range.start()).into()),
            "toBlock": format_quantity((*range.end()).into()),
            "address": addresses,
            "topics": [topics0],
        }]);
        let logs: Vec<RpcLog> = self.call("eth_getLogs", params).await?.unwrap_or_default();
        debug!(
            chain = %self.chain_id,
            from = range.start(),
            to = range.end(),
            count = logs.len(),
            "Fetched logs"
        );
        logs.into_iter()
            .filter(|log| !log.removed)
            .map(convert_log)
            .collect()
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        let price: String = self
            .call_required("eth_gasPrice", serde_json::json!([]))
            .await?;
        Ok(parse_quantity(&price)?)
    }

    async fn submit_transaction(&self, tx: TxRequest) -> Result<TxHash, ChainError> {
        let mut object = serde_json::json!({
            "from": tx.from.to_string(),
            "to": tx.to.to_string(),
            "data": encode_bytes(&tx.data),
            "value": format_quantity(tx.value),
        });
        if let (Some(gas), Some(map)) = (tx.gas_limit, object.as_object_mut()) {
            map.insert("gas".to_owned(), format_quantity(gas.into()).into());
        }
        let hash: String = self
            .call_required("eth_sendTransaction", serde_json::json!([object]))
            .await?;
        Ok(hash.parse()?)
    }

    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<TxReceipt, ChainError> {
        loop {
            let receipt: Option<RpcReceipt> = self
                .call(
                    "eth_getTransactionReceipt",
                    serde_json::json!([tx_hash.to_string()]),
                )
                .await?;
            if let Some(receipt) = receipt {
                return Ok(TxReceipt {
                    tx_hash: receipt.transaction_hash.parse()?,
                    block_number: parse_u64_quantity(&receipt.block_number)?,
                    success: parse_quantity(&receipt.status)? == 1,
                    gas_used: match receipt.gas_used {
                        Some(g) => parse_u64_quantity(&g)?,
                        None => 0,
                    },
                });
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }
}
