use std::sync::Mutex;

use tokio::sync::Notify;

/// How a single task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Matched,
    NoMatch,
    Failed,
}

/// Point-in-time copy of a [`CompletionCounter`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub started: usize,
    pub finished: usize,
    pub matched: usize,
    pub failed: usize,
}

/// Join barrier shared by every task of a single block
///
/// Counts only ever go up. `wait_for` is released by finished tasks, not by dispatched ones
#[derive(Debug, Default)]
pub struct CompletionCounter {
    progress: Mutex<Progress>,
    notify: Notify,
}

/// A started task. Must be finished with an [`Outcome`]. If dropped without one (e.g. the
/// task panicked), it counts as [`Outcome::Failed`]
#[must_use = "dropping a started task marks it as failed"]
#[derive(Debug)]
pub struct Started<'a> {
    counter: &'a CompletionCounter,
    finished: bool,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn start(&self) -> Started<'_> {
        self.with_progress(|p| p.started += 1);
        Started {
            counter: self,
            finished: false,
        }
    }

    pub fn snapshot(&self) -> Progress {
        self.with_progress(|p| *p)
    }

    /// Resolves once at least `total` tasks have finished
    pub async fn wait_for(&self, total: usize) -> Progress {
        loop {
            // register interest before checking, so a completion in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let progress = self.snapshot();
            if progress.finished >= total {
                return progress;
            }

            notified.await;
        }
    }

    fn finish(&self, outcome: Outcome) {
        self.with_progress(|p| {
            p.finished += 1;
            match outcome {
                Outcome::Matched => p.matched += 1,
                Outcome::Failed => p.failed += 1,
                Outcome::NoMatch => {}
            }
        });
        self.notify.notify_waiters();
    }

    fn with_progress<R>(&self, f: impl FnOnce(&mut Progress) -> R) -> R {
        // poisoning only means a panic happened mid-increment, the counts are still usable
        let mut guard = match self.progress.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl Started<'_> {
    pub fn finish(mut self, outcome: Outcome) {
        self.finished = true;
        self.counter.finish(outcome);
    }
}

impl Drop for Started<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.counter.finish(Outcome::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_wait_for_nothing() {
        let counter = CompletionCounter::new();
        let progress = counter.wait_for(0).await;
        assert_eq!(progress, Progress::default());
    }

    #[tokio::test]
    async fn test_start_does_not_release_barrier() {
        let counter = CompletionCounter::new();
        let _a = counter.start();
        let _b = counter.start();

        let res = timeout(Duration::from_millis(50), counter.wait_for(2)).await;
        assert!(res.is_err());
        assert_eq!(counter.snapshot().started, 2);
        assert_eq!(counter.snapshot().finished, 0);
    }

    #[test]
    fn test_dropped_task_counts_as_failed() {
        let counter = CompletionCounter::new();
        drop(counter.start());

        assert_eq!(
            counter.snapshot(),
            Progress {
                started: 1,
                finished: 1,
                matched: 0,
                failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_wait_for_completions() {
        let counter = Arc::new(CompletionCounter::new());

        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.wait_for(3).await })
        };

        for outcome in [Outcome::Matched, Outcome::NoMatch, Outcome::Failed] {
            let started = counter.start();
            tokio::time::sleep(Duration::from_millis(5)).await;
            started.finish(outcome);
        }

        let progress = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            progress,
            Progress {
                started: 3,
                finished: 3,
                matched: 1,
                failed: 1,
            }
        );
    }
}
