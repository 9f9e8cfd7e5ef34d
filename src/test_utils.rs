#![cfg(test)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::provider::{Error, EventLog, Provider, Receipt, Result, Transaction};

/// Target contract, in its prefixed, mixed case form
pub const ADDRESS: &str = "0x9EE5E3b5fC2d1AD4b7B9a1a7Ac72E88D4E40d5d2";

/// What the ledger reports as `toAddr` for the target contract
pub const TO_ADDR: &str = "9ee5e3b5fc2d1ad4b7b9a1a7ac72e88d4e40d5d2";

pub const EVENT: &str = "Minted";

pub fn event(name: &str) -> EventLog {
    EventLog {
        name: Some(name.to_owned()),
        address: Some(ADDRESS.to_lowercase()),
        params: json!([{ "vname": "amount", "type": "Uint128", "value": "10" }]),
        extra: Default::default(),
    }
}

/// A transaction sent to the target contract
pub fn transaction(hash: &str, success: bool, events: &[&str]) -> Transaction {
    Transaction {
        id: hash.to_owned(),
        to_addr: TO_ADDR.to_owned(),
        receipt: Receipt {
            success: Some(success),
            event_logs: Some(events.iter().map(|name| event(name)).collect()),
        },
    }
}

/// In-memory ledger
///
/// Unknown blocks are empty, unknown transactions fail to fetch. Clones share the call log
#[derive(Debug, Clone, Default)]
pub struct FixtureProvider {
    blocks: HashMap<u64, Vec<Option<Vec<String>>>>,
    txs: HashMap<String, Transaction>,
    failing_blocks: HashSet<u64>,
    delay: Duration,
    state: Arc<CallState>,
}

#[derive(Debug, Default)]
struct CallState {
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FixtureProvider {
    pub fn with_block(mut self, height: u64, shards: Vec<Option<Vec<&str>>>) -> Self {
        let shards = shards
            .into_iter()
            .map(|shard| shard.map(|hashes| hashes.into_iter().map(str::to_owned).collect()))
            .collect();
        self.blocks.insert(height, shards);
        self
    }

    pub fn with_tx(mut self, tx: Transaction) -> Self {
        self.txs.insert(tx.id.clone(), tx);
        self
    }

    pub fn failing_block(mut self, height: u64) -> Self {
        self.failing_blocks.insert(height);
        self
    }

    /// Delays every receipt fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every call made so far, as `list:<height>` or `tx:<hash>`, in completion order
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Highest number of receipt fetches that were running at once
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.state.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Provider for FixtureProvider {
    async fn transaction_hashes_for_block(&self, height: u64) -> Result<Vec<Option<Vec<String>>>> {
        self.record(format!("list:{}", height));

        if self.failing_blocks.contains(&height) {
            return Err(Error::Rpc {
                code: -5,
                message: format!("block {} unavailable", height),
            });
        }

        Ok(self.blocks.get(&height).cloned().unwrap_or_default())
    }

    async fn receipt(&self, hash: &str) -> Result<Transaction> {
        let in_flight = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.record(format!("tx:{}", hash));

        self.txs.get(hash).cloned().ok_or(Error::Rpc {
            code: -20,
            message: "Txn Hash not Present".to_owned(),
        })
    }

    async fn block_height(&self) -> Result<u64> {
        Ok(self.blocks.keys().max().copied().unwrap_or_default())
    }
}
