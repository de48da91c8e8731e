use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkItem {
    job: Job,
    enqueued_ms: u64,
}

struct PoolShared {
    extant: AtomicUsize,
    extant_limit: AtomicUsize,
    shutting_down: AtomicBool,
    stop_workers: AtomicBool,
    // Signalled whenever a job finishes so a drain wait can re-check.
    drained: std::sync::Condvar,
    drain_lock: Mutex<()>,
}

/// Bounded cooperative worker pool for short CPU-bound jobs. One shared FIFO,
/// a fixed thread group, and a hard cap on queued+running ("extant") jobs.
/// Blocking work must never be scheduled here.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    tx: Sender<WorkItem>,
    rx: Receiver<WorkItem>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    max_threads: AtomicUsize,
}

impl WorkerPool {
    pub fn new(max_threads: usize, extant_limit: usize) -> Arc<Self> {
        let n_cpus = detected_cpus();
        let max_threads = if max_threads == 0 {
            n_cpus
        } else {
            max_threads.min(n_cpus)
        };
        let (tx, rx) = unbounded::<WorkItem>();
        Arc::new(Self {
            shared: Arc::new(PoolShared {
                extant: AtomicUsize::new(0),
                extant_limit: AtomicUsize::new(extant_limit),
                shutting_down: AtomicBool::new(false),
                stop_workers: AtomicBool::new(false),
                drained: std::sync::Condvar::new(),
                drain_lock: Mutex::new(()),
            }),
            tx,
            rx,
            threads: Mutex::new(Vec::new()),
            max_threads: AtomicUsize::new(max_threads.max(1)),
        })
    }

    /// Spawn the worker thread group. Threads are started lazily so sizing
    /// options can still be applied between construction and start.
    pub fn start(self: &Arc<Self>) {
        let mut threads = match self.threads.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if !threads.is_empty() {
            return;
        }
        let count = self.max_threads.load(Ordering::Relaxed);
        for i in 0..count {
            let rx = self.rx.clone();
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("Worker{}", i + 1))
                .spawn(move || worker_main(rx, shared));
            match handle {
                Ok(handle) => threads.push(handle),
                Err(err) => log_critical!("failed to spawn worker thread: {err}"),
            }
        }
        log_debug!(
            "worker pool started ({} {})",
            threads.len(),
            crate::util::pluralize("thread", threads.len() as i64)
        );
    }

    /// Submit a job. Returns false (and does not run the job) when the
    /// extant-job cap is reached or the pool is shutting down. An accepted
    /// job runs exactly once unless shutdown intercedes first.
    pub fn submit(&self, job: Job) -> bool {
        if self.shared.shutting_down.load(Ordering::Acquire) || crate::block_new_tasks() {
            return false;
        }
        let limit = self.shared.extant_limit.load(Ordering::Relaxed);
        // Reserve a slot first so concurrent submitters cannot overshoot.
        let prev = self.shared.extant.fetch_add(1, Ordering::AcqRel);
        if prev >= limit {
            self.shared.extant.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        let item = WorkItem {
            job,
            enqueued_ms: crate::logging::now_ms(),
        };
        if self.tx.send(item).is_err() {
            self.shared.extant.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Queued + running job count.
    pub fn extant_jobs(&self) -> usize {
        self.shared.extant.load(Ordering::Acquire)
    }

    pub fn extant_job_limit(&self) -> usize {
        self.shared.extant_limit.load(Ordering::Relaxed)
    }

    /// Raise/lower the extant-job cap. Refused (false) for values below the
    /// documented minimum; never silently clamped.
    pub fn set_extant_job_limit(&self, limit: usize) -> bool {
        if limit < crate::options::MIN_WORK_QUEUE {
            return false;
        }
        self.shared.extant_limit.store(limit, Ordering::Relaxed);
        true
    }

    pub fn max_thread_count(&self) -> usize {
        self.max_threads.load(Ordering::Relaxed)
    }

    /// Change the thread-group size. Bounded by the detected virtual
    /// processor count and refused once the group is running.
    pub fn set_max_thread_count(&self, count: usize) -> bool {
        if count == 0 || count > detected_cpus() {
            return false;
        }
        let threads = match self.threads.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        if !threads.is_empty() {
            return false;
        }
        self.max_threads.store(count, Ordering::Relaxed);
        true
    }

    pub fn active_threads(&self) -> usize {
        self.threads.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Block new submissions and wait up to `timeout_ms` for the queue to
    /// drain. Returns whether the pool quiesced; on timeout the caller can
    /// read the leftover count via [`extant_jobs`](Self::extant_jobs).
    pub fn shutdown_wait_for_jobs(&self, timeout_ms: u64) -> bool {
        self.shared.shutting_down.store(true, Ordering::Release);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut guard = match self.shared.drain_lock.lock() {
            Ok(guard) => guard,
            Err(_) => return self.extant_jobs() == 0,
        };
        while self.extant_jobs() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, timed_out) = match self.shared.drained.wait_timeout(guard, deadline - now) {
                Ok((next, wait)) => (next, wait.timed_out()),
                Err(_) => return self.extant_jobs() == 0,
            };
            guard = next;
            if timed_out && self.extant_jobs() > 0 {
                return false;
            }
        }
        true
    }

    /// Stop and join the worker threads. Call after a successful (or
    /// timed-out) drain.
    pub fn join(self: &Arc<Self>) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.stop_workers.store(true, Ordering::Release);
        let threads = match self.threads.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        for handle in threads {
            let _ = handle.join();
        }
    }
}

fn worker_main(rx: Receiver<WorkItem>, shared: Arc<PoolShared>) {
    loop {
        let item = match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(item) => item,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if shared.stop_workers.load(Ordering::Acquire) {
                    return;
                }
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        };
        let waited_ms = crate::logging::now_ms().saturating_sub(item.enqueued_ms);
        if waited_ms > 1000 {
            log_trace!("work item waited {waited_ms}ms in queue");
        }
        let result = catch_unwind(AssertUnwindSafe(item.job));
        if let Err(panic) = result {
            let what = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log_critical!("worker job faulted: {what}");
        }
        shared.extant.fetch_sub(1, Ordering::AcqRel);
        let _guard = shared.drain_lock.lock();
        shared.drained.notify_all();
    }
}

pub fn detected_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn accepted_jobs_run_exactly_once() {
        let pool = WorkerPool::new(2, 100);
        pool.start();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            assert!(pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })));
        }
        assert!(pool.shutdown_wait_for_jobs(5000));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn submissions_beyond_the_cap_are_rejected() {
        let pool = WorkerPool::new(1, 10);
        // Not started: nothing consumes, so the queue holds all accepted jobs.
        let mut accepted = 0;
        for _ in 0..11 {
            if pool.submit(Box::new(|| {})) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(pool.extant_jobs(), 10);
    }

    #[test]
    fn rejected_submission_does_not_run() {
        let pool = WorkerPool::new(1, 10);
        for _ in 0..10 {
            assert!(pool.submit(Box::new(|| {})));
        }
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = Arc::clone(&ran);
        assert!(!pool.submit(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        })));
        pool.start();
        assert!(pool.shutdown_wait_for_jobs(5000));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_blocks_new_submissions() {
        let pool = WorkerPool::new(1, 10);
        pool.start();
        assert!(pool.shutdown_wait_for_jobs(1000));
        assert!(!pool.submit(Box::new(|| {})));
    }

    #[test]
    fn faulting_job_does_not_kill_the_pool() {
        let pool = WorkerPool::new(1, 10);
        pool.start();
        assert!(pool.submit(Box::new(|| panic!("boom"))));
        let ok = Arc::new(AtomicU32::new(0));
        let ok2 = Arc::clone(&ok);
        assert!(pool.submit(Box::new(move || {
            ok2.fetch_add(1, Ordering::SeqCst);
        })));
        assert!(pool.shutdown_wait_for_jobs(5000));
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn extant_limit_refuses_small_values() {
        let pool = WorkerPool::new(1, 100);
        assert!(!pool.set_extant_job_limit(9));
        assert_eq!(pool.extant_job_limit(), 100);
        assert!(pool.set_extant_job_limit(10));
        assert_eq!(pool.extant_job_limit(), 10);
    }

    #[test]
    fn thread_count_bounded_and_frozen_after_start() {
        let pool = WorkerPool::new(1, 100);
        assert!(!pool.set_max_thread_count(0));
        assert!(!pool.set_max_thread_count(detected_cpus() + 1));
        assert!(pool.set_max_thread_count(1));
        pool.start();
        assert!(!pool.set_max_thread_count(1));
    }

    #[test]
    fn drain_timeout_reports_leftovers() {
        let pool = WorkerPool::new(1, 10);
        pool.start();
        let (hold_tx, hold_rx) = crossbeam_channel::bounded::<()>(0);
        assert!(pool.submit(Box::new(move || {
            let _ = hold_rx.recv();
        })));
        assert!(!pool.shutdown_wait_for_jobs(50));
        assert!(pool.extant_jobs() >= 1);
        drop(hold_tx);
        assert!(pool.shutdown_wait_for_jobs(5000));
    }
}
