mod jsonrpc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use jsonrpc::JsonRpcProvider;

/// Ledger query collaborator used by the walker
///
/// Abstracted so the walker can be driven by an in-memory fixture in tests
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Transaction hashes included in a block, one inner list per shard.
    /// Absent shards are `None`
    async fn transaction_hashes_for_block(&self, height: u64) -> Result<Vec<Option<Vec<String>>>>;

    /// The transaction and its execution receipt
    async fn receipt(&self, hash: &str) -> Result<Transaction>;

    /// Height of the most recent block
    async fn block_height(&self) -> Result<u64>;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("response has neither a result nor an error")]
    MissingResult,

    #[error("invalid block height {0:?}")]
    InvalidHeight(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A transaction as returned by the ledger, reduced to what the walker inspects
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Transaction {
    #[serde(rename = "ID", default)]
    pub id: String,

    /// Recipient address, lowercase hex without prefix
    #[serde(rename = "toAddr")]
    pub to_addr: String,

    pub receipt: Receipt,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Receipt {
    #[serde(default)]
    pub success: Option<bool>,

    #[serde(default)]
    pub event_logs: Option<Vec<EventLog>>,
}

/// An event emitted during contract execution
///
/// Keys other than the ones named here are kept in `extra`, so the event serializes back to
/// what the ledger returned
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EventLog {
    /// Events without a name never match, but don't invalidate the receipt
    #[serde(rename = "_eventname", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.success == Some(true)
    }

    pub fn events(&self) -> &[EventLog] {
        self.event_logs.as_deref().unwrap_or_default()
    }
}

/// Flattens per-shard hash lists into a single list, in order, skipping absent shards
pub fn flatten_hashes(shards: Vec<Option<Vec<String>>>) -> Vec<String> {
    shards.into_iter().flatten().flatten().collect()
}
