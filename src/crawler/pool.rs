use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, instrument::WithSubscriber};

use crate::error::CrawlError;

/// A resizable pool of tokio workers
///
/// The pool does not queue work: callers check [`WorkerPool::free`] before
/// submitting and wait on [`WorkerPool::notified`] when it is full.
pub struct WorkerPool {
    name: &'static str,
    capacity: AtomicUsize,
    running: AtomicUsize,
    closed: AtomicBool,
    changed: Notify,
}

/// Holds one running slot; released on drop so a panicking worker still frees it
struct Slot(Arc<WorkerPool>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
        self.0.changed.notify_waiters();
    }
}

impl WorkerPool {
    pub fn new(name: &'static str, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            capacity: AtomicUsize::new(capacity),
            running: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            changed: Notify::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn free(&self) -> usize {
        self.capacity().saturating_sub(self.running())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Change the number of workers allowed to run at once
    pub fn tune(&self, capacity: usize) {
        debug!("Resizing {} pool to {}", self.name, capacity);
        self.capacity.store(capacity, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// A future resolved the next time a worker finishes or the pool is
    /// resized. Enable it before checking pool state to avoid a lost wakeup.
    pub fn notified(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Spawn `work` on the runtime, under the caller's tracing subscriber
    pub fn submit<F>(self: &Arc<Self>, work: F) -> Result<(), CrawlError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(CrawlError::PoolClosed(self.name));
        }

        self.running.fetch_add(1, Ordering::SeqCst);
        let slot = Slot(self.clone());
        tokio::spawn(
            async move {
                let _slot = slot;
                work.await;
            }
            .with_current_subscriber(),
        );
        Ok(())
    }

    /// Wait until no worker is running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.running() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Refuse any further submissions
    pub fn release(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_submit_and_wait_idle() {
        let pool = WorkerPool::new("test", 2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let done = done.clone();
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(pool.free(), 0);

        pool.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(pool.free(), 2);
    }

    #[tokio::test]
    async fn test_panicking_worker_frees_slot() {
        let pool = WorkerPool::new("test", 1);
        pool.submit(async { panic!("boom") }).unwrap();
        pool.wait_idle().await;
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test]
    async fn test_release_rejects_work() {
        let pool = WorkerPool::new("items", 1);
        pool.tune(4);
        assert_eq!(pool.capacity(), 4);

        pool.release();
        let err = pool.submit(async {}).unwrap_err();
        assert!(matches!(err, CrawlError::PoolClosed("items")));
    }
}
