use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Msg {
    Job(Job),
    Stop,
}

struct Inner {
    name: String,
    tx: Sender<Msg>,
    thread_id: Mutex<Option<ThreadId>>,
    running: AtomicBool,
}

/// An object-owning event loop: jobs posted from any thread run on the
/// owner's thread, in per-source submit order. Dropping the loop (or sending
/// stop) discards still-queued jobs without running them.
pub struct EventLoop {
    inner: Arc<Inner>,
    rx: Receiver<Msg>,
}

/// Cheap cloneable address of an [`EventLoop`]. Holds only a weak reference:
/// a handle never keeps a dead owner alive.
#[derive(Clone)]
pub struct Handle {
    inner: Weak<Inner>,
}

impl EventLoop {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                tx,
                thread_id: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
            rx,
        }
    }

    pub fn handle(&self) -> Handle {
        Handle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Run the loop on the calling thread until stopped.
    pub fn run(self) {
        if let Ok(mut id) = self.inner.thread_id.lock() {
            *id = Some(std::thread::current().id());
        }
        self.inner.running.store(true, Ordering::Release);
        while let Ok(msg) = self.rx.recv() {
            match msg {
                Msg::Job(job) => job(),
                Msg::Stop => break,
            }
        }
        self.inner.running.store(false, Ordering::Release);
        // Anything still queued is discarded unrun; pending callers observe
        // their completion channel closing and report false.
        while self.rx.try_recv().is_ok() {}
    }

    /// Run the loop on a new named thread.
    pub fn spawn(self) -> std::io::Result<std::thread::JoinHandle<()>> {
        let name = self.inner.name.clone();
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
    }
}

impl Handle {
    pub fn name(&self) -> Option<String> {
        self.inner.upgrade().map(|inner| inner.name.clone())
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .upgrade()
            .map(|inner| inner.running.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Enqueue `job` on the owner's thread. Best-effort: silently dropped
    /// when the owner is being (or has been) torn down.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let _ = inner.tx.send(Msg::Job(Box::new(job)));
    }

    /// Synchronous variant: runs `job` inline when the caller is already on
    /// the owner thread, otherwise enqueues and waits for completion. Returns
    /// false on timeout, or when the owner thread is not running at submit
    /// time; the job never executes against a dead owner.
    pub fn call(&self, job: impl FnOnce() + Send + 'static, timeout_ms: u64) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        if !inner.running.load(Ordering::Acquire) {
            return false;
        }
        let owner = inner.thread_id.lock().ok().and_then(|id| *id);
        if owner == Some(std::thread::current().id()) {
            job();
            return true;
        }
        let (done_tx, done_rx) = bounded::<()>(1);
        let wrapped = Box::new(move || {
            job();
            let _ = done_tx.send(());
        });
        if inner.tx.send(Msg::Job(wrapped)).is_err() {
            return false;
        }
        done_rx.recv_timeout(Duration::from_millis(timeout_ms)).is_ok()
    }

    /// Ask the loop to exit. Jobs already queued ahead of the stop still run.
    pub fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let _ = inner.tx.send(Msg::Stop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn post_runs_on_owner_thread_in_order() {
        let lp = EventLoop::new("test-loop");
        let handle = lp.handle();
        let join = lp.spawn().expect("spawn");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10u32 {
            let seen = Arc::clone(&seen);
            handle.post(move || {
                seen.lock().expect("lock").push(i);
            });
        }
        assert!(handle.call(|| {}, 1000));
        assert_eq!(*seen.lock().expect("lock"), (0..10).collect::<Vec<_>>());
        handle.stop();
        let _ = join.join();
    }

    #[test]
    fn call_returns_true_only_on_completion() {
        let lp = EventLoop::new("test-loop");
        let handle = lp.handle();
        let join = lp.spawn().expect("spawn");
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = Arc::clone(&ran);
        assert!(handle.call(
            move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            },
            1000
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // A slow job times out; the caller observes false.
        let ok = handle.call(
            || {
                std::thread::sleep(Duration::from_millis(200));
            },
            10,
        );
        assert!(!ok);
        handle.stop();
        let _ = join.join();
    }

    #[test]
    fn call_against_dead_owner_is_false_and_never_runs() {
        let lp = EventLoop::new("test-loop");
        let handle = lp.handle();
        // Never started: not running, so call refuses to enqueue.
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = Arc::clone(&ran);
        assert!(!handle.call(
            move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            },
            100
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        let join = lp.spawn().expect("spawn");
        handle.stop();
        let _ = join.join();
        let ran2 = Arc::clone(&ran);
        assert!(!handle.call(
            move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            },
            100
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn inline_call_when_already_on_owner_thread() {
        let lp = EventLoop::new("test-loop");
        let handle = lp.handle();
        let inner_handle = handle.clone();
        let join = lp.spawn().expect("spawn");
        let ok = Arc::new(AtomicU32::new(0));
        let ok2 = Arc::clone(&ok);
        assert!(handle.call(
            move || {
                // Re-entrant call from the owner thread must not deadlock.
                let ok3 = Arc::clone(&ok2);
                assert!(inner_handle.call(
                    move || {
                        ok3.fetch_add(1, Ordering::SeqCst);
                    },
                    10
                ));
            },
            1000
        ));
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        handle.stop();
        let _ = join.join();
    }

    #[test]
    fn post_to_dead_owner_is_silently_dropped() {
        let handle = {
            let lp = EventLoop::new("gone");
            lp.handle()
        };
        handle.post(|| panic!("must never run"));
        assert!(!handle.is_running());
        assert_eq!(handle.name(), None);
    }
}
