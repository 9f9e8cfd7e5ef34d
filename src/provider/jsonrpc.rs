use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{instrument, trace};
use url::Url;

use super::{Error, Provider, Result, Transaction};
use crate::config::RpcConfig;

/// Message returned by the node when asked for the transactions of an empty block
const EMPTY_BLOCK: &str = "TxBlock has no transactions";

/// JSON-RPC 2.0 client for the ledger's HTTP API
#[derive(Debug)]
pub struct JsonRpcProvider {
    url: Url,
    client: Client,
    next_id: AtomicU64,
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,

    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

impl JsonRpcProvider {
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            url: config.url.clone(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let request = Request {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        trace!(event = "request", method, id = request.id);
        let body = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        parse_response(&body)
    }
}

#[async_trait]
impl Provider for JsonRpcProvider {
    #[instrument(skip(self))]
    async fn transaction_hashes_for_block(&self, height: u64) -> Result<Vec<Option<Vec<String>>>> {
        match self
            .call("GetTransactionsForTxBlock", json!([height.to_string()]))
            .await
        {
            Err(Error::Rpc { message, .. }) if message == EMPTY_BLOCK => Ok(vec![]),
            res => res,
        }
    }

    #[instrument(skip(self))]
    async fn receipt(&self, hash: &str) -> Result<Transaction> {
        self.call("GetTransaction", json!([hash])).await
    }

    async fn block_height(&self) -> Result<u64> {
        let count: String = self.call("GetNumTxBlocks", json!([])).await?;
        parse_block_count(&count)
    }
}

fn parse_response<T: DeserializeOwned>(body: &str) -> Result<T> {
    let response: Response = serde_json::from_str(body)?;

    if let Some(err) = response.error {
        return Err(Error::Rpc {
            code: err.code,
            message: err.message,
        });
    }

    match response.result {
        Some(result) => Ok(serde_json::from_value(result)?),
        None => Err(Error::MissingResult),
    }
}

/// The node reports the number of blocks. The latest height is one less
fn parse_block_count(count: &str) -> Result<u64> {
    count
        .parse::<u64>()
        .map(|n| n.saturating_sub(1))
        .map_err(|_| Error::InvalidHeight(count.to_owned()))
}
