//! Bounded worker pool with one-instance-per-job admission.
//!
//! Two limits apply to every execution:
//! - a global cap on concurrent jobs (semaphore permits)
//! - at most one running instance per job key
//!
//! RAM: one HashSet entry per running job.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Shared pool state.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
    running: Arc<Mutex<HashSet<String>>>,
    active: Arc<AtomicUsize>,
    total_processed: Arc<AtomicU64>,
}

/// Marks a job key as running until dropped.
pub struct RunSlot {
    key: String,
    running: Arc<Mutex<HashSet<String>>>,
}

impl RunSlot {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.key);
        }
    }
}

/// Holds a worker permit; updates counters on drop.
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
    total_processed: Arc<AtomicU64>,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.total_processed.fetch_add(1, Ordering::Relaxed);
    }
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            running: Arc::new(Mutex::new(HashSet::new())),
            active: Arc::new(AtomicUsize::new(0)),
            total_processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Claim the single run slot for `key`. `None` if an instance is already running.
    pub fn try_claim(&self, key: &str) -> Option<RunSlot> {
        let mut running = self.running.lock().ok()?;
        if !running.insert(key.to_string()) {
            return None;
        }
        Some(RunSlot {
            key: key.to_string(),
            running: self.running.clone(),
        })
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.running
            .lock()
            .map(|r| r.contains(key))
            .unwrap_or(false)
    }

    /// Wait for a free worker.
    pub async fn acquire(&self) -> Option<WorkerPermit> {
        let permit = self.permits.clone().acquire_owned().await.ok()?;
        self.active.fetch_add(1, Ordering::Relaxed);
        Some(WorkerPermit {
            _permit: permit,
            active: self.active.clone(),
            total_processed: self.total_processed.clone(),
        })
    }

    /// Wait until every worker is idle, then refuse new work.
    pub async fn drain(&self) {
        if let Ok(all) = self
            .permits
            .clone()
            .acquire_many_owned(self.max_workers as u32)
            .await
        {
            self.permits.close();
            drop(all);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_workers: self.max_workers,
            active: self.active.load(Ordering::Relaxed),
            running_jobs: self.running.lock().map(|r| r.len()).unwrap_or(0),
            total_processed: self.total_processed.load(Ordering::Relaxed),
        }
    }
}

/// Pool statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub max_workers: usize,
    pub active: usize,
    pub running_jobs: usize,
    pub total_processed: u64,
}
