//! The synchronization coordinator.
//!
//! Owns the outbound argument map and the `busy` cell. `sync()` is
//! fire-and-forget: it raises `busy`, marks the map dirty, and wakes the
//! pump task, which serializes the full map and hands it to the link.
//! Requests that pile up before the pump runs coalesce into one push of
//! the latest snapshot; an already-sent frame is never cancelled. `busy`
//! stays true until the resulting inbound frame settles it, and is the
//! single source of truth for the spinner debounce and the batched upload
//! flush trigger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, mpsc};
use tracing::warn;

use crate::cell::Cell;
use crate::protocol::{ArgMap, ArgValue, FRAGMENT_ARG, encode_args};

struct Shared {
    args: Mutex<ArgMap>,
    busy: Cell<bool>,
    dirty: AtomicBool,
    kick: Notify,
}

/// Root owner of the coordinator state and its pump task. Must be created
/// inside a Tokio runtime. Cheap clones for widgets and watchers come from
/// [`SyncCoordinator::handle`].
pub struct SyncCoordinator {
    shared: Arc<Shared>,
    task: tokio::task::JoinHandle<()>,
}

impl SyncCoordinator {
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        let shared = Arc::new(Shared {
            args: Mutex::new(ArgMap::new()),
            busy: Cell::new(false),
            dirty: AtomicBool::new(false),
            kick: Notify::new(),
        });
        let task = tokio::spawn(pump(Arc::clone(&shared), outbound));
        SyncCoordinator { shared, task }
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct SyncHandle {
    shared: Arc<Shared>,
}

impl SyncHandle {
    /// Write one argument. Entries persist until overwritten.
    pub fn set_arg(&self, name: impl Into<String>, value: ArgValue) {
        self.shared.args.lock().unwrap().insert(name.into(), value);
    }

    pub fn arg(&self, name: &str) -> Option<ArgValue> {
        self.shared.args.lock().unwrap().get(name).cloned()
    }

    pub fn snapshot(&self) -> ArgMap {
        self.shared.args.lock().unwrap().clone()
    }

    /// Merge the address-bar fragment under its reserved key.
    pub fn set_fragment(&self, fragment: &str) {
        self.set_arg(FRAGMENT_ARG, ArgValue::from(fragment));
    }

    /// True while a push is outstanding.
    pub fn busy(&self) -> &Cell<bool> {
        &self.shared.busy
    }

    /// Request a push of the full argument map. Raises `busy`
    /// synchronously; serialization happens at send time in the pump, so
    /// overlapping requests collapse into one push of the latest state.
    pub fn sync(&self) {
        self.shared.busy.set(true);
        self.shared.dirty.store(true, Ordering::SeqCst);
        self.shared.kick.notify_one();
    }

    /// The resulting inbound frame arrived; lower `busy`.
    pub fn settle(&self) {
        self.shared.busy.set(false);
    }
}

async fn pump(shared: Arc<Shared>, outbound: mpsc::UnboundedSender<String>) {
    loop {
        shared.kick.notified().await;
        while shared.dirty.swap(false, Ordering::SeqCst) {
            let payload = {
                let args = shared.args.lock().unwrap();
                match encode_args(&args) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(target = "sync::pump", error = %err, "argument map serialization failed");
                        continue;
                    }
                }
            };
            if outbound.send(payload).is_err() {
                // Link torn down; later syncs drop here silently.
                return;
            }
        }
    }
}
