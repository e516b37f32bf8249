//! A cancellable fixed-interval background task backed by a dedicated thread.
//!
//! The worker waits `interval - last_run_duration` between runs so the pace
//! stays close to the nominal interval even when the callback is slow.
//! Changing the interval from another thread joins and restarts the worker,
//! which is why a tick may be skipped across an update; the worker retuning
//! its own pace just stores the new interval for the next lap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant as StdInstant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

pub(crate) struct PeriodicCallback {
    callback: Arc<dyn Fn() + Send + Sync + 'static>,
    interval_millis: Arc<AtomicU64>,
    worker: Mutex<Option<Worker>>,
}

struct Worker {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
    thread_id: ThreadId,
}

impl PeriodicCallback {
    pub(crate) fn new(callback: Arc<dyn Fn() + Send + Sync + 'static>, interval: Duration) -> Self {
        let this = Self {
            callback,
            interval_millis: Arc::new(AtomicU64::new(interval.as_millis() as u64)),
            worker: Mutex::new(None),
        };
        *this.worker.lock() = Some(this.spawn());
        this
    }

    fn spawn(&self) -> Worker {
        let (cancel, cancelled) = bounded::<()>(1);
        let callback = Arc::clone(&self.callback);
        let interval_millis = Arc::clone(&self.interval_millis);
        let handle = thread::Builder::new()
            .name("cachette-timer".into())
            .spawn(move || {
                let mut last_proc = Duration::ZERO;
                loop {
                    let interval = Duration::from_millis(interval_millis.load(Ordering::Acquire));
                    let wait = interval.saturating_sub(last_proc);
                    match cancelled.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let started = StdInstant::now();
                    callback();
                    last_proc = started.elapsed();
                }
            })
            .expect("failed to spawn timer thread");
        let thread_id = handle.thread().id();
        Worker {
            cancel,
            handle,
            thread_id,
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis.load(Ordering::Acquire))
    }

    pub(crate) fn set_interval(&self, interval: Duration) {
        self.interval_millis
            .store(interval.as_millis() as u64, Ordering::Release);

        let mut worker = self.worker.lock();
        if let Some(w) = worker.as_ref() {
            if w.thread_id == thread::current().id() {
                // The worker is retuning itself mid-tick; the loop reads the
                // interval fresh each lap.
                return;
            }
        }
        if let Some(w) = worker.take() {
            let _ = w.cancel.try_send(());
            let _ = w.handle.join();
        }
        *worker = Some(self.spawn());
    }
}

impl Drop for PeriodicCallback {
    fn drop(&mut self) {
        let worker = self.worker.get_mut().take();
        if let Some(w) = worker {
            let _ = w.cancel.try_send(());
            if w.thread_id != thread::current().id() {
                let _ = w.handle.join();
            }
        }
    }
}
