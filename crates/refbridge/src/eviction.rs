//! Background eviction worker.

use std::{
    io,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Sender, select};

use crate::handle::HandleTable;

const THREAD_NAME: &str = "refbridge-eviction";

/// Periodically prunes a [`HandleTable`] on its own thread.
///
/// The worker holds only a weak reference to the table and exits on its own
/// once the table is dropped. Dropping the worker stops and joins the thread.
#[derive(Debug)]
pub struct EvictionWorker {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EvictionWorker {
    /// Starts a worker that calls [`HandleTable::prune`] every `interval`.
    pub fn spawn(table: &Arc<HandleTable>, interval: Duration) -> io::Result<Self> {
        let table: Weak<HandleTable> = Arc::downgrade(table);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let ticker = crossbeam_channel::tick(interval);

        let thread = thread::Builder::new().name(THREAD_NAME.to_owned()).spawn(move || {
            tracing::info!(?interval, "eviction worker started");
            loop {
                select! {
                    recv(ticker) -> _ => {
                        let Some(table) = table.upgrade() else {
                            break;
                        };
                        let report = table.prune();
                        if !report.is_empty() {
                            tracing::debug!(expired = report.expired, evicted = report.evicted, "periodic prune");
                        }
                    }
                    // a message or a disconnect both mean stop
                    recv(stop_rx) -> _ => break,
                }
            }
            tracing::info!("eviction worker stopped");
        })?;

        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stops the worker and waits for its thread to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("eviction worker panicked");
        }
    }
}

impl Drop for EvictionWorker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
