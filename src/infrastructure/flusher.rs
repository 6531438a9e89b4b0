//! Flushing snapshots off the caller's thread.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::persistence::{FlushOutcome, KeyValueStore, PersistenceAdapter, lock};
use crate::application::SnapshotSink;
use crate::domain::{DomainError, DomainResult, Workspace};

/// Hands snapshots to a worker thread that writes them through a
/// [`PersistenceAdapter`].
///
/// Snapshots queued while a write is in progress are coalesced: only the
/// newest one is written. Dropping the flusher writes whatever is still queued
/// and joins the worker.
pub struct BackgroundFlusher<S: KeyValueStore + Send + 'static> {
    adapter: Arc<Mutex<PersistenceAdapter<S>>>,
    sender: Option<Sender<Workspace>>,
    worker: Option<JoinHandle<()>>,
    last_error: Arc<Mutex<Option<DomainError>>>,
}

impl<S: KeyValueStore + Send + 'static> BackgroundFlusher<S> {
    pub fn spawn(adapter: PersistenceAdapter<S>) -> Self {
        let adapter = Arc::new(Mutex::new(adapter));
        let last_error = Arc::new(Mutex::new(None));
        let (sender, receiver) = mpsc::channel();

        let worker = {
            let adapter = Arc::clone(&adapter);
            let last_error = Arc::clone(&last_error);
            thread::spawn(move || run_worker(receiver, adapter, last_error))
        };

        Self {
            adapter,
            sender: Some(sender),
            worker: Some(worker),
            last_error,
        }
    }

    /// Queues `snapshot` without waiting for it to be written.
    pub fn submit(&self, snapshot: Workspace) -> DomainResult<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| {
                DomainError::Persistence("background flusher is shut down".to_string())
            })?
            .send(snapshot)
            .map_err(|_| DomainError::Persistence("background flusher stopped".to_string()))
    }

    /// Version of the last snapshot the worker fully wrote.
    pub fn last_written_version(&self) -> Option<u64> {
        lock(&self.adapter).last_version()
    }

    /// Writes everything still queued, stops the worker and returns the last
    /// unreported error.
    pub fn finish(mut self) -> Option<DomainError> {
        self.shutdown();
        lock(&self.last_error).take()
    }

    fn shutdown(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("flush worker panicked");
            }
        }
    }
}

impl<S: KeyValueStore + Send + 'static> Drop for BackgroundFlusher<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S: KeyValueStore + Send + 'static> SnapshotSink for BackgroundFlusher<S> {
    fn hydrate(&mut self) -> DomainResult<Workspace> {
        let mut adapter = lock(&self.adapter);
        let workspace = adapter.hydrate()?;
        if let Some(err) = adapter.take_error() {
            *lock(&self.last_error) = Some(err);
        }
        Ok(workspace)
    }

    fn flush(&mut self, snapshot: &Workspace) -> DomainResult<()> {
        self.submit(snapshot.clone())
    }

    fn take_error(&mut self) -> Option<DomainError> {
        lock(&self.last_error).take()
    }
}

fn run_worker<S: KeyValueStore>(
    receiver: Receiver<Workspace>,
    adapter: Arc<Mutex<PersistenceAdapter<S>>>,
    last_error: Arc<Mutex<Option<DomainError>>>,
) {
    while let Ok(mut snapshot) = receiver.recv() {
        let mut skipped = 0;
        while let Ok(newer) = receiver.try_recv() {
            if newer.version > snapshot.version {
                snapshot = newer;
            }
            skipped += 1;
        }

        match lock(&adapter).flush(&snapshot) {
            Ok(FlushOutcome::Written { written, removed }) => {
                debug!(
                    version = snapshot.version,
                    written,
                    removed,
                    skipped,
                    "background flush done"
                );
            }
            Ok(FlushOutcome::Stale) => {}
            Err(err) => {
                warn!(version = snapshot.version, error = %err, "background flush failed");
                *lock(&last_error) = Some(err);
            }
        }
    }
}
