//! Periodic Tasks
//!
//! A named thread that runs a closure on a fixed interval until stopped.
//! Used for the rotation check and the stale file sweep.

use crossbeam::channel::{bounded, select, tick, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

pub struct PeriodicTask {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl PeriodicTask {
    /// Run `task` every `interval`. The first run happens one interval
    /// after spawning.
    pub fn spawn<F>(name: &str, interval: Duration, mut task: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(task = %thread_name, ?interval, "Periodic task started");
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => task(),
                    }
                }
                debug!(task = %thread_name, "Periodic task stopped");
            })?;

        Ok(PeriodicTask {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the task and wait for a run in progress to finish. Idempotent.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the stop channel
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            // Stopped from inside its own run: the loop exits on its own
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(task = %self.name, "Periodic task panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
