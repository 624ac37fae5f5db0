//! Debounced persistence of the host index
//!
//! The processor never touches the disk. When it changes the host set and no
//! save is pending it sets the index's queued flag and pokes the save worker,
//! which waits out the delay and then persists whatever the index holds at
//! that moment. Changes arriving during the wait ride along with that save.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::index::HostIndex;
use crate::metrics::Metrics;
use crate::persist::{PersistError, Persister};

/// Map a failed blocking task onto the persistence error space
pub(crate) fn join_error(e: tokio::task::JoinError) -> PersistError {
    PersistError::Io(std::io::Error::other(e))
}

/// Everything needed to take and write one snapshot
#[derive(Clone)]
struct SaveTask {
    index: Arc<RwLock<HostIndex>>,
    persister: Arc<dyn Persister>,
    metrics: Metrics,
    in_flight: Arc<Mutex<()>>,
    completed: Arc<watch::Sender<u64>>,
}

impl SaveTask {
    /// Persist the index if a save is queued; returns whether one ran
    ///
    /// A failed save leaves the save queued.
    async fn save_queued(&self) -> Result<bool, PersistError> {
        let _in_flight = self.in_flight.lock().await;

        let snapshot = self.index.write().take_queued_snapshot();
        let Some(snapshot) = snapshot else {
            return Ok(false);
        };
        let height = snapshot.height;
        let hosts = snapshot.hosts.len();

        let persister = self.persister.clone();
        let result = tokio::task::spawn_blocking(move || persister.save(&snapshot))
            .await
            .map_err(join_error)
            .and_then(|saved| saved);

        match result {
            Ok(()) => {
                self.metrics.save_completed();
                self.completed.send_modify(|count| *count += 1);
                info!(height, hosts, "Saved host index");
                Ok(true)
            }
            Err(e) => {
                self.index.write().requeue_save();
                self.metrics.save_failed();
                Err(e)
            }
        }
    }
}

/// Handle to the save worker
pub(crate) struct Saver {
    requests: mpsc::UnboundedSender<()>,
    task: SaveTask,
    completed: watch::Receiver<u64>,
}

impl Saver {
    /// Spawn the worker; it stops once the handle is dropped
    pub(crate) fn spawn(
        index: Arc<RwLock<HostIndex>>,
        persister: Arc<dyn Persister>,
        metrics: Metrics,
        delay: Duration,
    ) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let (completed_tx, completed) = watch::channel(0);
        let task = SaveTask {
            index,
            persister,
            metrics,
            in_flight: Arc::new(Mutex::new(())),
            completed: Arc::new(completed_tx),
        };

        tokio::spawn(run_worker(task.clone(), rx, delay));

        Self {
            requests,
            task,
            completed,
        }
    }

    /// Ask for a save after the delay; never blocks
    pub(crate) fn request(&self) {
        if self.requests.send(()).is_err() {
            warn!("Save worker has stopped, dropping save request");
        }
    }

    /// Save now if a save is queued
    pub(crate) async fn flush(&self) -> Result<bool, PersistError> {
        self.task.save_queued().await
    }

    /// Count of completed saves, updated after each one
    pub(crate) fn completed(&self) -> watch::Receiver<u64> {
        self.completed.clone()
    }
}

async fn run_worker(task: SaveTask, mut requests: mpsc::UnboundedReceiver<()>, delay: Duration) {
    debug!(?delay, "Save worker started");

    while requests.recv().await.is_some() {
        // a failed save stays queued, so keep retrying until one lands
        loop {
            tokio::time::sleep(delay).await;

            match task.save_queued().await {
                Ok(true) => break,
                Ok(false) => {
                    debug!("Queued save already flushed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, retry_in = ?delay, "Failed to save host index");
                    if requests.is_closed() {
                        break;
                    }
                }
            }
        }
    }

    debug!("Save worker stopped");
}
