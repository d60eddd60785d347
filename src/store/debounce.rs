use log::debug;
use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

/// Runs a job once things have been quiet for `delay`.
///
/// Each [`schedule`](Debouncer::schedule) aborts the pending job, if any,
/// and starts a fresh timer.
pub struct Debouncer {
    name: &'static str,
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(name: &'static str, delay: Duration) -> Self {
        Self {
            name,
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn schedule<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let name = self.name;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            debug!(target: "Client/Store", "Debounced {name} job firing after {delay:?}");
            job.await;
        });

        let previous = self
            .pending
            .lock()
            .expect("debouncer mutex should not be poisoned")
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Drops the pending job without running it. Returns whether one was
    /// pending.
    pub fn cancel(&self) -> bool {
        let previous = self
            .pending
            .lock()
            .expect("debouncer mutex should not be poisoned")
            .take();
        match previous {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                was_pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .expect("debouncer mutex should not be poisoned")
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock()
            && let Some(handle) = pending.take()
        {
            handle.abort();
        }
    }
}
