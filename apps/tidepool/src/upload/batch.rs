//! Batched uploads: the pending set and its flush watcher.
//!
//! Compact widgets stage selections here instead of uploading at selection
//! time. The coordinator watches the busy cell; a false→true transition
//! with staged files and no flush in flight uploads everything
//! concurrently and reports one `FlushSettled` event, from which the
//! client loop writes the handles, issues the single follow-up sync, and
//! releases the guard. Upload completion is therefore coupled to the next
//! synchronization cycle, not to selection time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::cell::{Cell, Subscription, on};

use super::{FilePayload, Transfers, UploadConfig, UploadEvent, UploadWidget};

/// Staged selections by widget name, plus the flush guard. Owned by the
/// coordinator instance, so independent clients never share state.
pub(crate) struct PendingUploads {
    staged: Mutex<HashMap<String, Vec<FilePayload>>>,
    flushing: AtomicBool,
}

impl PendingUploads {
    fn new() -> Self {
        PendingUploads {
            staged: Mutex::new(HashMap::new()),
            flushing: AtomicBool::new(false),
        }
    }

    /// Stage a selection, replacing any previous staging for the widget.
    pub(crate) fn stage(&self, name: &str, files: Vec<FilePayload>) {
        self.staged.lock().unwrap().insert(name.to_string(), files);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.staged.lock().unwrap().is_empty()
    }

    /// Move every staged entry into the flight. Files staged while a
    /// flush is in flight stay put for the next trigger.
    fn drain(&self) -> HashMap<String, Vec<FilePayload>> {
        std::mem::take(&mut *self.staged.lock().unwrap())
    }

    /// Synchronous test-and-set; at most one flush in flight.
    fn try_begin_flush(&self) -> bool {
        !self.flushing.swap(true, Ordering::SeqCst)
    }

    fn end_flush(&self) {
        self.flushing.store(false, Ordering::SeqCst);
    }
}

pub struct UploadCoordinator {
    transfers: Arc<dyn Transfers>,
    events: mpsc::UnboundedSender<UploadEvent>,
    pub(crate) pending: Arc<PendingUploads>,
    busy_watch: Option<Subscription>,
}

impl UploadCoordinator {
    pub fn new(transfers: Arc<dyn Transfers>, events: mpsc::UnboundedSender<UploadEvent>) -> Self {
        UploadCoordinator {
            transfers,
            events,
            pending: Arc::new(PendingUploads::new()),
            busy_watch: None,
        }
    }

    /// Wire a widget to this coordinator's transfers, event channel, and
    /// pending set.
    pub fn register(&self, config: UploadConfig) -> UploadWidget {
        UploadWidget::new(
            config,
            Arc::clone(&self.transfers),
            self.events.clone(),
            Arc::clone(&self.pending),
        )
    }

    /// Install the singleton flush watcher on the busy cell. The guard is
    /// taken synchronously inside the notification, before any await
    /// point, so overlapping busy risings cannot start a second flight.
    pub fn watch_busy(&mut self, busy: &Cell<bool>) {
        let pending = Arc::clone(&self.pending);
        let transfers = Arc::clone(&self.transfers);
        let events = self.events.clone();
        let mut prev = busy.get();
        self.busy_watch = Some(on(busy, move |now| {
            let rising = *now && !prev;
            prev = *now;
            if !rising || pending.is_empty() {
                return;
            }
            if !pending.try_begin_flush() {
                return;
            }
            let staged = pending.drain();
            debug!(target = "upload::flush", widgets = staged.len(), "flushing staged uploads");
            tokio::spawn(run_flush(staged, Arc::clone(&transfers), events.clone()));
        }));
    }

    /// Called by the client loop after the post-flush sync was issued.
    pub fn flush_done(&self) {
        self.pending.end_flush();
    }
}

async fn run_flush(
    staged: HashMap<String, Vec<FilePayload>>,
    transfers: Arc<dyn Transfers>,
    events: mpsc::UnboundedSender<UploadEvent>,
) {
    let flights = staged.into_iter().map(|(name, files)| {
        let transfers = Arc::clone(&transfers);
        async move {
            let outcome = transfers.upload(files, None).await;
            (name, outcome)
        }
    });
    let results = futures_util::future::join_all(flights).await;
    let _ = events.send(UploadEvent::FlushSettled { results });
}
