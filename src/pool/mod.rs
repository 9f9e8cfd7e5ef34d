mod completion;
mod task;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, trace};

pub use completion::{CompletionCounter, Outcome, Progress, Started};
pub use task::Task;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("a worker pool needs at least one worker")]
    NoWorkers,

    #[error("permit pool closed, no further tasks can be dispatched")]
    Closed,
}

/// FIFO task queue, executed with at most `workers` tasks in flight
///
/// Tasks are queued with `add_task`, and dispatched by `poll` in submission order. Both take
/// `&mut self`, so the queue can't be mutated while a poll loop is draining it
pub struct WorkerPool {
    workers: usize,
    semaphore: Arc<Semaphore>,

    /// Pending ids, in submission order
    ids: VecDeque<String>,

    /// Pending tasks, keyed by id
    tasks: HashMap<String, Box<dyn Task>>,

    /// Tracks dispatched tasks so they can be joined
    tracker: TaskTracker,

    /// How long to sleep when the queue is empty
    idle_interval: Duration,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        Ok(Self {
            workers,
            semaphore: Arc::new(Semaphore::new(workers)),
            ids: Default::default(),
            tasks: Default::default(),
            tracker: TaskTracker::new(),
            idle_interval: default_idle_interval(),
        })
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Queues a task. A task with an id that is already pending replaces the queued one,
    /// keeping its original position
    pub fn add_task<T: Task>(&mut self, task: T) {
        self.add_boxed(Box::new(task))
    }

    pub fn add_boxed(&mut self, task: Box<dyn Task>) {
        let id = task.id().to_owned();
        if self.tasks.insert(id.clone(), task).is_none() {
            self.ids.push_back(id);
        }
    }

    /// Removes and returns the oldest pending task
    pub fn top(&mut self) -> Option<Box<dyn Task>> {
        while let Some(id) = self.ids.pop_front() {
            if let Some(task) = self.tasks.remove(&id) {
                return Some(task);
            }
        }

        None
    }

    /// Closes the permit pool. Any poll loop still running stops with [`PoolError::Closed`]
    /// on its next dispatch attempt
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Dispatch loop
    ///
    /// Runs until `token` is cancelled. Cancelling only stops further dispatch: tasks already
    /// spawned keep running, and can be joined with [`WorkerPool::wait`]
    #[instrument(name = "pool", skip(self, token), fields(workers = self.workers))]
    pub async fn poll(&mut self, token: CancellationToken) -> Result<(), PoolError> {
        loop {
            if token.is_cancelled() {
                break;
            }

            if self.is_empty() {
                select! {
                    _ = token.cancelled() => break,
                    _ = sleep(self.idle_interval) => continue,
                }
            }

            // the permit is acquired before the task leaves the queue, so a cancellation
            // while waiting for a free slot never drops a task
            let permit = select! {
                _ = token.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| PoolError::Closed)?
                }
            };

            let task = match self.top() {
                Some(task) => task,
                None => continue,
            };

            trace!(event = "dispatch", task = task.id());
            self.tracker.spawn(async move {
                let _permit = permit;
                task.run().await;
            });
        }

        trace!(event = "quit", pending = self.len());
        Ok(())
    }

    /// Waits for every dispatched task to finish
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

pub fn default_idle_interval() -> Duration {
    Duration::from_secs(3)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rstest::rstest;
    use tokio::time::timeout;

    use super::*;

    /// Records how many tasks run at once, and the order in which they started
    #[derive(Debug, Default)]
    struct Probe {
        running: AtomicUsize,
        max_running: AtomicUsize,
        order: Mutex<Vec<String>>,
        done: CompletionCounter,
    }

    struct ProbeTask {
        id: String,
        probe: Arc<Probe>,
        delay: Duration,
    }

    #[async_trait]
    impl Task for ProbeTask {
        fn id(&self) -> &str {
            &self.id
        }

        async fn run(&self) {
            let started = self.probe.done.start();
            self.probe.order.lock().unwrap().push(self.id.clone());

            let running = self.probe.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_running.fetch_max(running, Ordering::SeqCst);

            sleep(self.delay).await;

            self.probe.running.fetch_sub(1, Ordering::SeqCst);
            started.finish(Outcome::NoMatch);
        }
    }

    fn pool_with(workers: usize, probe: &Arc<Probe>, ids: &[&str], delay: Duration) -> WorkerPool {
        let mut pool = WorkerPool::new(workers)
            .unwrap()
            .with_idle_interval(Duration::from_millis(10));

        for id in ids {
            pool.add_task(ProbeTask {
                id: id.to_string(),
                probe: probe.clone(),
                delay,
            });
        }

        pool
    }

    async fn drain(mut pool: WorkerPool, probe: &Arc<Probe>, total: usize) -> WorkerPool {
        let token = CancellationToken::new();
        let handle = {
            let token = token.clone();
            tokio::spawn(async move {
                let res = pool.poll(token).await;
                (pool, res)
            })
        };

        timeout(Duration::from_secs(5), probe.done.wait_for(total))
            .await
            .expect("tasks did not finish in time");
        token.cancel();

        let (pool, res) = handle.await.unwrap();
        assert_eq!(res, Ok(()));
        pool
    }

    #[test]
    fn test_zero_workers() {
        assert_eq!(WorkerPool::new(0).err(), Some(PoolError::NoWorkers));
    }

    #[test]
    fn test_top_is_fifo() {
        let probe = Arc::new(Probe::default());
        let mut pool = pool_with(1, &probe, &["a", "b", "c"], Duration::ZERO);

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.top().unwrap().id(), "a");
        assert_eq!(pool.top().unwrap().id(), "b");
        assert_eq!(pool.top().unwrap().id(), "c");
        assert!(pool.top().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_duplicate_id_is_queued_once() {
        let probe = Arc::new(Probe::default());
        let mut pool = pool_with(1, &probe, &["a", "b", "a"], Duration::ZERO);

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.top().unwrap().id(), "a");
        assert_eq!(pool.top().unwrap().id(), "b");
        assert!(pool.top().is_none());
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(8)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded(#[case] workers: usize) {
        let probe = Arc::new(Probe::default());
        let ids: Vec<String> = (0..24).map(|i| format!("tx{}", i)).collect();
        let ids: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();

        let pool = pool_with(workers, &probe, &ids, Duration::from_millis(15));
        let pool = drain(pool, &probe, ids.len()).await;
        pool.wait().await;

        let max = probe.max_running.load(Ordering::SeqCst);
        assert!(max <= workers, "{} tasks ran at once with {} workers", max, workers);
        assert!(max >= 1);
        assert_eq!(probe.done.snapshot().finished, ids.len());
    }

    #[tokio::test]
    async fn test_dispatch_order() {
        let probe = Arc::new(Probe::default());
        let pool = pool_with(1, &probe, &["a", "b", "c"], Duration::from_millis(1));

        drain(pool, &probe, 3).await;

        assert_eq!(*probe.order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_cancelled_poll_dispatches_nothing() {
        let probe = Arc::new(Probe::default());
        let mut pool = pool_with(2, &probe, &["a", "b"], Duration::ZERO);

        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(pool.poll(token).await, Ok(()));
        assert_eq!(pool.len(), 2);
        assert_eq!(probe.done.snapshot().started, 0);
    }

    #[tokio::test]
    async fn test_cancel_does_not_abort_running_tasks() {
        let probe = Arc::new(Probe::default());
        let mut pool = pool_with(1, &probe, &["slow", "queued"], Duration::from_millis(100));

        let token = CancellationToken::new();
        let poll = {
            let token = token.clone();
            tokio::spawn(async move {
                let res = pool.poll(token).await;
                (pool, res)
            })
        };

        // "slow" holds the only permit, "queued" waits for it
        sleep(Duration::from_millis(30)).await;
        token.cancel();

        let (pool, res) = poll.await.unwrap();
        assert_eq!(res, Ok(()));
        assert_eq!(pool.len(), 1);

        pool.wait().await;
        assert_eq!(probe.done.snapshot().finished, 1);
        assert_eq!(*probe.order.lock().unwrap(), vec!["slow"]);
    }

    #[tokio::test]
    async fn test_closed_pool_stops_polling() {
        let probe = Arc::new(Probe::default());
        let mut pool = pool_with(2, &probe, &["a"], Duration::ZERO);
        pool.close();

        let res = timeout(Duration::from_secs(1), pool.poll(CancellationToken::new()))
            .await
            .expect("poll loop did not terminate");

        assert_eq!(res, Err(PoolError::Closed));
        assert_eq!(pool.len(), 1);
        assert_eq!(probe.done.snapshot().started, 0);
    }
}
