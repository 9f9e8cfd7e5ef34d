mod receipt;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ScanConfig;
use crate::pool::{self, CompletionCounter, PoolError, WorkerPool};
use crate::provider::{flatten_hashes, Provider};

pub use receipt::{matching_event, Log, ReceiptFetchTask};

/// Walks a range of blocks, looking for a single event emitted by a single contract
///
/// Each block's transactions are fetched concurrently, through a pool of `workers` slots.
/// Blocks are processed one at a time: the next block is only listed once every receipt of
/// the current one has been fetched
#[derive(Clone)]
pub struct Walker {
    inner: Arc<Inner>,

    /// How long each block's pool sleeps when its queue is empty
    idle_interval: Duration,
}

/// Walker state shared with its tasks
pub(crate) struct Inner {
    provider: Arc<dyn Provider>,

    /// Inclusive
    from_block: u64,

    /// Exclusive
    to_block: u64,

    /// Contract address, including its 2 character prefix
    address: String,
    event_name: String,

    workers: usize,

    /// Matched event per block. A later match on the same block replaces an earlier one
    logs: RwLock<BTreeMap<u64, Log>>,

    reports: RwLock<BTreeMap<u64, BlockReport>>,
}

/// What happened to a single block
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockReport {
    pub transactions: usize,

    /// Transactions that emitted the target event. Only one of them is kept in the log map
    pub matches: usize,

    /// Transactions whose receipt could not be fetched
    pub failed_fetches: usize,

    /// The block's transaction list could not be fetched
    pub listing_failed: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub blocks: u64,
    pub transactions: usize,
    pub matches: usize,
    pub failed_fetches: usize,
    pub failed_blocks: u64,
    pub cancelled: bool,
}

impl Walker {
    pub fn new(
        provider: Arc<dyn Provider>,
        from_block: u64,
        to_block: u64,
        address: impl Into<String>,
        workers: usize,
        event_name: impl Into<String>,
    ) -> Result<Self, PoolError> {
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                provider,
                from_block,
                to_block,
                address: address.into(),
                event_name: event_name.into(),
                workers,
                logs: Default::default(),
                reports: Default::default(),
            }),
            idle_interval: pool::default_idle_interval(),
        })
    }

    /// Builds a walker for `[config.from_block, to_block)`
    pub fn from_config(
        provider: Arc<dyn Provider>,
        config: &ScanConfig,
        to_block: u64,
    ) -> Result<Self, PoolError> {
        let walker = Self::new(
            provider,
            config.from_block,
            to_block,
            config.address.clone(),
            config.workers,
            config.event_name.clone(),
        )?;

        Ok(walker.with_idle_interval(config.idle_interval()))
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    pub fn range(&self) -> std::ops::Range<u64> {
        self.inner.from_block..self.inner.to_block
    }

    /// Scans the whole range
    ///
    /// Returns once every block has been processed, or `token` is cancelled. A cancellation
    /// is only observed between blocks. Failures are logged and counted, never returned
    #[instrument(
        name = "walker",
        skip(self, token),
        fields(from = self.inner.from_block, to = self.inner.to_block)
    )]
    pub async fn start_traversal_block(&self, token: CancellationToken) -> ScanSummary {
        let mut summary = ScanSummary::default();

        for block in self.range() {
            if token.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let report = match self.process_block(block).await {
                Ok(report) => report,
                Err(err) => {
                    error!(block, %err, "could not dispatch block");
                    BlockReport {
                        listing_failed: true,
                        ..Default::default()
                    }
                }
            };

            summary.add(&report);
            self.inner.reports.write().await.insert(block, report);
        }

        info!(
            blocks = summary.blocks,
            matches = summary.matches,
            failed_fetches = summary.failed_fetches,
            failed_blocks = summary.failed_blocks,
            "scan finished"
        );
        summary
    }

    async fn process_block(&self, block: u64) -> Result<BlockReport, PoolError> {
        let shards = match self.inner.provider.transaction_hashes_for_block(block).await {
            Ok(shards) => shards,
            Err(err) => {
                warn!(block, %err, "could not list transactions");
                return Ok(BlockReport {
                    listing_failed: true,
                    ..Default::default()
                });
            }
        };

        let hashes = flatten_hashes(shards);
        debug!(block, txs = hashes.len());

        let counter = Arc::new(CompletionCounter::new());
        let mut pool =
            WorkerPool::new(self.inner.workers)?.with_idle_interval(self.idle_interval);
        for hash in hashes {
            pool.add_task(ReceiptFetchTask::new(
                hash,
                block,
                counter.clone(),
                self.inner.clone(),
            ));
        }

        // repeated hashes are queued once
        let total = pool.len();
        if total == 0 {
            return Ok(BlockReport::default());
        }

        let quit = CancellationToken::new();
        let (_, progress) = tokio::try_join!(pool.poll(quit.clone()), async {
            let progress = counter.wait_for(total).await;
            quit.cancel();
            Ok::<_, PoolError>(progress)
        })?;
        pool.wait().await;

        Ok(BlockReport {
            transactions: total,
            matches: progress.matched,
            failed_fetches: progress.failed,
            listing_failed: false,
        })
    }

    /// Snapshot of the logs matched so far, by block
    pub async fn logs(&self) -> BTreeMap<u64, Log> {
        self.inner.logs.read().await.clone()
    }

    pub async fn log(&self, block: u64) -> Option<Log> {
        self.inner.logs.read().await.get(&block).cloned()
    }

    /// Per-block reports, for every block processed so far
    pub async fn reports(&self) -> BTreeMap<u64, BlockReport> {
        self.inner.reports.read().await.clone()
    }
}

impl ScanSummary {
    fn add(&mut self, report: &BlockReport) {
        self.blocks += 1;
        self.transactions += report.transactions;
        self.matches += report.matches;
        self.failed_fetches += report.failed_fetches;
        if report.listing_failed {
            self.failed_blocks += 1;
        }
    }
}
