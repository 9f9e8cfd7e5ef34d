use async_trait::async_trait;

/// A unit of work that can be queued on a [`WorkerPool`](super::WorkerPool)
///
/// The pool never inspects the outcome of `run`. Tasks that need to report back do so through
/// their own shared state
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Stable identity, used for queue bookkeeping
    fn id(&self) -> &str;

    async fn run(&self);
}
