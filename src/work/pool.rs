//! Bounded worker pool with priorities.
//!
//! A rayon `ThreadPool` provides the threads; which job runs next is decided
//! by a shared binary heap. Every submission pushes the job onto the heap and
//! spawns one token on the pool. A token pops whatever job is most urgent at
//! the time it gets a thread, so a crop submitted after a batch of previews
//! still runs before them.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};

/// Scheduling class. Higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Preview,
    Crop,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queued {
    priority: Priority,
    seq: u64,
    job: Job,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence number (FIFO)
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct WorkPool {
    threads: rayon::ThreadPool,
    queue: Arc<Mutex<BinaryHeap<Queued>>>,
    seq: AtomicU64,
}

impl WorkPool {
    /// Build a pool with `threads` workers (at least one).
    pub fn new(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("cropper-{i}"))
            .build()?;
        Ok(Self {
            threads,
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            seq: AtomicU64::new(0),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.threads.current_num_threads()
    }

    /// Queue `job` at `priority`.
    pub fn submit(&self, priority: Priority, job: impl FnOnce() + Send + 'static) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Queued {
                priority,
                seq,
                job: Box::new(job),
            });

        let queue = Arc::clone(&self.queue);
        self.threads.spawn(move || {
            let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop();
            if let Some(queued) = next {
                (queued.job)();
            }
        });
    }

    /// Jobs submitted but not yet picked up by a thread.
    pub fn queued(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
