use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::types::DashMap;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

type JobQueue = Arc<Mutex<VecDeque<Job>>>;

/// Runs deferred engine work.
///
/// One-shot timers and background tasks use the tokio runtime captured at
/// construction, falling back to a dedicated thread when there is none.
/// Threads that call [`Executor::register_thread`] get a job queue that
/// other threads can post to; the owner drains it with [`Executor::process_jobs`].
pub struct Executor {
    handle: Option<Handle>,
    queues: DashMap<ThreadId, JobQueue>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self { handle: Handle::try_current().ok(), queues: DashMap::default() }
    }

    #[inline]
    pub fn has_runtime(&self) -> bool {
        self.handle.is_some()
    }

    pub fn spawn(&self, job: Job) {
        match &self.handle {
            Some(h) => {
                h.spawn_blocking(job);
            }
            None => {
                std::thread::spawn(job);
            }
        }
    }

    pub fn schedule_after(&self, delay: Duration, job: Job) {
        match &self.handle {
            Some(h) => {
                h.spawn(async move {
                    tokio::time::sleep(delay).await;
                    job();
                });
            }
            None => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    job();
                });
            }
        }
    }

    /// Run `job` every `interval` until it returns false
    pub fn spawn_interval<F>(&self, interval: Duration, mut job: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        match &self.handle {
            Some(h) => {
                h.spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        if !job() {
                            break;
                        }
                    }
                });
            }
            None => {
                std::thread::spawn(move || loop {
                    std::thread::sleep(interval);
                    if !job() {
                        break;
                    }
                });
            }
        }
    }

    pub fn register_thread(&self) -> ThreadId {
        let id = std::thread::current().id();
        self.queues.entry(id).or_default();
        id
    }

    pub fn unregister_thread(&self) {
        self.queues.remove(&std::thread::current().id());
    }

    #[inline]
    pub fn is_registered(&self, id: ThreadId) -> bool {
        self.queues.contains_key(&id)
    }

    /// Hand `job` to the owning thread, or run it here if that is this
    /// thread or the owner never registered a queue
    pub fn submit_to(&self, owner: ThreadId, job: Job) {
        if owner == std::thread::current().id() {
            job();
            return;
        }
        let queue = self.queues.get(&owner).map(|q| q.value().clone());
        match queue {
            Some(q) => q.lock().push_back(job),
            None => job(),
        }
    }

    /// Drain the calling thread's job queue, returns the number of jobs run
    pub fn process_jobs(&self) -> usize {
        let queue = match self.queues.get(&std::thread::current().id()) {
            Some(q) => q.value().clone(),
            None => return 0,
        };
        let mut n = 0;
        loop {
            let job = queue.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_submit_to_owner_thread() {
        let exec = Arc::new(Executor::new());
        let owner = exec.register_thread();
        let hits = Arc::new(AtomicUsize::new(0));

        let e = exec.clone();
        let h = hits.clone();
        std::thread::spawn(move || {
            e.submit_to(
                owner,
                Box::new(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            );
        })
        .join()
        .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(exec.process_jobs(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregistered_owner_runs_inline() {
        let exec = Executor::new();
        let other = std::thread::spawn(|| std::thread::current().id()).join().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        exec.submit_to(
            other,
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_schedule_after() {
        let exec = Executor::new();
        assert!(exec.has_runtime());
        let (tx, rx) = tokio::sync::oneshot::channel();
        exec.schedule_after(
            Duration::from_millis(5),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        assert!(rx.await.is_ok());
    }
}
