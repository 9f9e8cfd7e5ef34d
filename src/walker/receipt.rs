use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, trace};

use super::Inner;
use crate::pool::{CompletionCounter, Outcome, Task};
use crate::provider::{EventLog, Transaction};

/// A matched event. `payload` is the event as the ledger returned it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Log {
    pub hash: String,
    pub event_name: String,
    pub address: String,
    pub payload: EventLog,
}

/// Fetches a single transaction, and records a [`Log`] for its block if it emitted the
/// target event
pub struct ReceiptFetchTask {
    hash: String,
    block: u64,
    counter: Arc<CompletionCounter>,
    walker: Arc<Inner>,
}

impl ReceiptFetchTask {
    pub(super) fn new(
        hash: String,
        block: u64,
        counter: Arc<CompletionCounter>,
        walker: Arc<Inner>,
    ) -> Self {
        Self {
            hash,
            block,
            counter,
            walker,
        }
    }

    async fn fetch(&self) -> Outcome {
        let tx = match self.walker.provider.receipt(&self.hash).await {
            Ok(tx) => tx,
            Err(err) => {
                debug!(block = self.block, hash = %self.hash, %err, "receipt fetch failed");
                return Outcome::Failed;
            }
        };

        let event = match matching_event(&tx, &self.walker.address, &self.walker.event_name) {
            Some(event) => event,
            None => return Outcome::NoMatch,
        };

        trace!(event = "match", block = self.block, hash = %self.hash);
        let log = Log {
            hash: self.hash.clone(),
            event_name: self.walker.event_name.clone(),
            address: self.walker.address.clone(),
            payload: event.clone(),
        };
        self.walker.logs.write().await.insert(self.block, log);

        Outcome::Matched
    }
}

#[async_trait]
impl Task for ReceiptFetchTask {
    fn id(&self) -> &str {
        &self.hash
    }

    async fn run(&self) {
        let started = self.counter.start();
        let outcome = self.fetch().await;
        started.finish(outcome);
    }
}

/// Returns the event a transaction emitted under the given name, if the transaction
/// succeeded and was sent to `address`
///
/// `address` carries a 2 character prefix that the ledger omits from `toAddr`. When several
/// events match, the last one is returned
pub fn matching_event<'a>(
    tx: &'a Transaction,
    address: &str,
    event_name: &str,
) -> Option<&'a EventLog> {
    if !tx.receipt.succeeded() {
        return None;
    }

    let target = address.get(2..).unwrap_or_default();
    if !tx.to_addr.eq_ignore_ascii_case(target) {
        return None;
    }

    tx.receipt
        .events()
        .iter()
        .filter(|event| event.name.as_deref() == Some(event_name))
        .last()
}
