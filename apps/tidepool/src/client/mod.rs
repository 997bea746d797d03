//! The application loop.
//!
//! One task owns all coordinator state and consumes typed events from the
//! worker tasks: link frames and state changes, upload progress and
//! settlement, and commands from the embedder (fragment changes). Inbound
//! frames apply strictly in arrival order; a reset frame ends the loop
//! with [`Outcome::Reload`] without touching anything queued behind it.
//! No failure escapes the loop: transfer errors become widget messages,
//! session errors become the page-wide overlay.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::cell::{Bond, Cell, Mount};
use crate::config::Config;
use crate::overlay::{ApplyLayout, NotFoundOverlay, NotFoundView, Spinner, log_apply_layout};
use crate::protocol::{ArgValue, MessageKind, NOT_FOUND, Page, ServerFrame};
use crate::sync::{SyncCoordinator, SyncHandle};
use crate::telemetry;
use crate::transport::{LinkEvent, LinkState};
use crate::upload::{Transfers, UploadConfig, UploadCoordinator, UploadEvent, UploadWidget};

/// Session content, replaced wholesale per inbound frame. An error frame
/// clears the page; a data frame clears the error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Content {
    pub page: Option<Page>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppView {
    Loading,
    NotFound(NotFoundView),
    Error(String),
    Page { key: String },
}

/// Bond projecting session content into the top-level view.
pub struct PageHost {
    content: Cell<Content>,
    not_found: NotFoundOverlay,
}

impl PageHost {
    pub fn not_found(&self) -> &NotFoundOverlay {
        &self.not_found
    }
}

impl Bond for PageHost {
    type View = AppView;

    fn render(&self) -> AppView {
        let content = self.content.get();
        if let Some(error) = content.error {
            if error == NOT_FOUND {
                return AppView::NotFound(self.not_found.render());
            }
            return AppView::Error(error);
        }
        match content.page {
            Some(page) => AppView::Page { key: page.key },
            None => AppView::Loading,
        }
    }
}

#[derive(Debug)]
pub enum Command {
    SetFragment(String),
}

/// Cheap handle for the embedder to poke the running loop.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    /// The address-bar fragment changed; it is merged into the argument
    /// map under its reserved key before the sync it triggers.
    pub fn set_fragment(&self, fragment: impl Into<String>) {
        let _ = self.commands.send(Command::SetFragment(fragment.into()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A reset frame arrived; session identity may have changed, so the
    /// whole client must be torn down and rebuilt, never patched in
    /// place.
    Reload,
    /// The link supervisor went away.
    Shutdown,
}

pub struct App {
    // Root owner of the pump task; dropped with the loop on reload.
    _sync: SyncCoordinator,
    sync_handle: SyncHandle,
    uploads: UploadCoordinator,
    widgets: HashMap<String, UploadWidget>,
    content: Cell<Content>,
    link_state: Cell<LinkState>,
    host: Mount<PageHost>,
    spinner: Mount<Spinner>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    upload_rx: mpsc::UnboundedReceiver<UploadEvent>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
}

impl App {
    /// Wire the loop to a link. Must be called inside the runtime.
    pub fn new(
        config: &Config,
        transfers: Arc<dyn Transfers>,
        outbound: mpsc::UnboundedSender<String>,
        link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self::with_layout_hook(config, transfers, outbound, link_rx, log_apply_layout())
    }

    /// Same as [`App::new`] with the recovery overlay's apply action
    /// supplied by the page-editing collaborator.
    pub fn with_layout_hook(
        config: &Config,
        transfers: Arc<dyn Transfers>,
        outbound: mpsc::UnboundedSender<String>,
        link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        on_apply: ApplyLayout,
    ) -> Self {
        let sync = SyncCoordinator::new(outbound);
        let sync_handle = sync.handle();

        let (upload_tx, upload_rx) = mpsc::unbounded_channel();
        let mut uploads = UploadCoordinator::new(transfers, upload_tx);
        uploads.watch_busy(sync_handle.busy());

        let content = Cell::new(Content::default());
        let not_found = NotFoundOverlay::new(on_apply);
        let picking = not_found.picking().clone();
        let mut host = Mount::new(PageHost {
            content: content.clone(),
            not_found,
        });
        host.watch(&content).watch(&picking);

        let spinner_bond = Spinner::new(sync_handle.busy().clone(), config.spin_delay);
        let spin = spinner_bond.spinning().clone();
        let mut spinner = Mount::new(spinner_bond);
        spinner.watch(sync_handle.busy()).watch(&spin);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        App {
            _sync: sync,
            sync_handle,
            uploads,
            widgets: HashMap::new(),
            content,
            link_state: Cell::new(LinkState::Disconnected),
            host,
            spinner,
            link_rx,
            upload_rx,
            commands_tx,
            commands_rx,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            commands: self.commands_tx.clone(),
        }
    }

    pub fn sync(&self) -> SyncHandle {
        self.sync_handle.clone()
    }

    pub fn content(&self) -> Cell<Content> {
        self.content.clone()
    }

    pub fn link_state(&self) -> Cell<LinkState> {
        self.link_state.clone()
    }

    pub fn view(&self) -> AppView {
        self.host.render()
    }

    /// Register an upload widget with the loop's coordinators.
    pub fn register_upload(&mut self, config: UploadConfig) -> UploadWidget {
        let widget = self.uploads.register(config);
        self.widgets.insert(widget.name().to_string(), widget.clone());
        widget
    }

    pub async fn run(mut self) -> Outcome {
        info!(target = "client::loop", "client loop started");
        let outcome = loop {
            tokio::select! {
                event = self.link_rx.recv() => {
                    match event {
                        Some(LinkEvent::Frame(frame)) => {
                            if let Some(outcome) = self.apply_frame(frame) {
                                break outcome;
                            }
                        }
                        Some(LinkEvent::State(state)) => {
                            debug!(target = "client::loop", ?state, "link state changed");
                            self.link_state.set(state);
                        }
                        None => break Outcome::Shutdown,
                    }
                }
                event = self.upload_rx.recv() => {
                    if let Some(event) = event {
                        self.apply_upload(event);
                    }
                }
                command = self.commands_rx.recv() => {
                    if let Some(command) = command {
                        self.apply_command(command);
                    }
                }
            }
            self.render_pass();
        };
        telemetry::log_summary();
        outcome
    }

    fn apply_frame(&mut self, frame: ServerFrame) -> Option<Outcome> {
        match frame {
            ServerFrame::Data { page } => {
                debug!(target = "client::loop", key = %page.key, "page replaced");
                self.content.set(Content {
                    page: Some(page),
                    error: None,
                });
                self.sync_handle.settle();
                None
            }
            ServerFrame::Message {
                kind: MessageKind::Err,
                text,
            } => {
                warn!(target = "client::loop", error = %text, "session error");
                self.content.set(Content {
                    page: None,
                    error: Some(text),
                });
                self.sync_handle.settle();
                None
            }
            ServerFrame::Message { kind, text } => {
                info!(target = "client::loop", ?kind, message = %text, "session message");
                None
            }
            ServerFrame::Reset => {
                info!(target = "client::loop", "session reset; full reload required");
                Some(Outcome::Reload)
            }
        }
    }

    fn apply_upload(&mut self, event: UploadEvent) {
        match event {
            UploadEvent::Progress { widget, fraction } => {
                if let Some(widget) = self.widgets.get(&widget) {
                    widget.set_progress(fraction);
                }
            }
            UploadEvent::Settled {
                widget: name,
                outcome,
            } => {
                let Some(widget) = self.widgets.get(&name) else {
                    return;
                };
                match outcome {
                    Ok(handles) => {
                        let uploaded = widget.selection_names();
                        self.sync_handle.set_arg(name, ArgValue::Files(handles));
                        self.sync_handle.sync();
                        widget.note_success(&uploaded);
                    }
                    Err(err) => {
                        warn!(target = "client::loop", widget = %name, error = %err, "interactive upload failed");
                        widget.note_failure();
                    }
                }
            }
            UploadEvent::FlushSettled { results } => {
                for (name, outcome) in results {
                    match outcome {
                        Ok(handles) => {
                            self.sync_handle.set_arg(name, ArgValue::Files(handles));
                        }
                        Err(err) => {
                            warn!(target = "client::loop", widget = %name, error = %err, "staged upload failed");
                            if let Some(widget) = self.widgets.get(&name) {
                                widget.note_failure();
                            }
                        }
                    }
                }
                self.sync_handle.sync();
                self.uploads.flush_done();
            }
        }
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::SetFragment(fragment) => {
                if !fragment.is_empty() {
                    self.sync_handle.set_fragment(&fragment);
                }
                self.sync_handle.sync();
            }
        }
    }

    fn render_pass(&mut self) {
        if let Some(view) = self.host.render_if_dirty() {
            trace!(target = "client::render", view = ?view, "page host rendered");
        }
        if let Some(view) = self.spinner.render_if_dirty() {
            trace!(target = "client::render", view = ?view, "busy overlay rendered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::log_apply_layout;
    use crate::upload::FilePayload;
    use crate::upload::testing::RecordingTransfers;
    use std::time::Duration;

    struct Harness {
        link_tx: mpsc::UnboundedSender<LinkEvent>,
        outbound_rx: mpsc::UnboundedReceiver<String>,
        transfers: Arc<RecordingTransfers>,
        app: App,
    }

    fn harness() -> Harness {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let transfers = Arc::new(RecordingTransfers::new());
        let app = App::with_layout_hook(
            &Config::default(),
            transfers.clone(),
            outbound_tx,
            link_rx,
            log_apply_layout(),
        );
        Harness {
            link_tx,
            outbound_rx,
            transfers,
            app,
        }
    }

    fn page_frame(key: &str) -> LinkEvent {
        LinkEvent::Frame(ServerFrame::Data {
            page: Page {
                key: key.to_string(),
                content: serde_json::json!({}),
            },
        })
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn data_frame_replaces_content_and_settles_busy() {
        let h = harness();
        let content = h.app.content();
        let sync = h.app.sync();
        sync.sync();
        assert!(sync.busy().get());

        tokio::spawn(h.app.run());
        h.link_tx.send(page_frame("s-1")).unwrap();

        eventually(|| content.get().page.is_some()).await;
        assert_eq!(content.get().page.unwrap().key, "s-1");
        assert!(!sync.busy().get());

        // The next data frame replaces the page wholesale.
        h.link_tx.send(page_frame("s-2")).unwrap();
        eventually(|| content.get().page.map(|p| p.key == "s-2").unwrap_or(false)).await;
    }

    #[tokio::test]
    async fn err_message_clears_the_page_and_shows_the_overlay() {
        let h = harness();
        let content = h.app.content();
        tokio::spawn(h.app.run());

        h.link_tx.send(page_frame("s-1")).unwrap();
        h.link_tx
            .send(LinkEvent::Frame(ServerFrame::Message {
                kind: MessageKind::Err,
                text: "boom".to_string(),
            }))
            .unwrap();

        eventually(|| content.get().error.is_some()).await;
        let content = content.get();
        assert_eq!(content.error.as_deref(), Some("boom"));
        assert!(content.page.is_none());
    }

    #[tokio::test]
    async fn reset_always_reloads_regardless_of_state() {
        for prelude in [None, Some(page_frame("s-1"))] {
            let h = harness();
            let run = tokio::spawn(h.app.run());
            if let Some(frame) = prelude {
                h.link_tx.send(frame).unwrap();
            }
            h.link_tx.send(LinkEvent::Frame(ServerFrame::Reset)).unwrap();
            assert_eq!(run.await.unwrap(), Outcome::Reload);
        }
    }

    #[tokio::test]
    async fn fragment_command_merges_reserved_key_and_syncs() {
        let mut h = harness();
        let handle = h.app.handle();
        tokio::spawn(h.app.run());

        handle.set_fragment("reports/q3");
        let payload = h.outbound_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["#"], "reports/q3");
    }

    #[tokio::test]
    async fn interactive_upload_writes_handles_and_syncs() {
        let mut h = harness();
        let widget = h
            .app
            .register_upload(UploadConfig::new("report").with_label("Upload"));
        tokio::spawn(h.app.run());

        widget.select(vec![FilePayload::new("a.txt", vec![0u8; 16])]);
        widget.confirm();

        let payload = h.outbound_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["report"][0], "/_f/mock/a.txt");

        eventually(|| widget.selection_names().is_empty()).await;
        eventually(|| matches!(widget.render().body, crate::upload::UploadBody::Success(_))).await;
    }

    #[tokio::test]
    async fn failed_upload_surfaces_generic_error_and_clears_selection() {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let transfers = Arc::new(RecordingTransfers::failing());
        let mut app = App::new(&Config::default(), transfers, outbound_tx, link_rx);
        let widget = app.register_upload(UploadConfig::new("report"));
        let _keep = link_tx;
        tokio::spawn(app.run());

        widget.select(vec![FilePayload::new("a.txt", vec![0u8; 16])]);
        widget.confirm();

        eventually(|| matches!(widget.render().body, crate::upload::UploadBody::Error(_))).await;
        match widget.render().body {
            crate::upload::UploadBody::Error(message) => {
                assert_eq!(message, "There was an error when uploading file.");
            }
            other => panic!("expected error body, got {:?}", other),
        }
        assert!(widget.selection_names().is_empty());
        // No argument write, no sync.
        assert!(outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn batched_flush_uploads_once_and_syncs_once() {
        let mut h = harness();
        let widget = h
            .app
            .register_upload(UploadConfig::new("photos").with_compact(true));
        let sync = h.app.sync();
        tokio::spawn(h.app.run());

        widget.select(vec![FilePayload::new("pic.png", vec![0u8; 32])]);
        assert_eq!(h.transfers.upload_count(), 0);

        // Some widget interaction elsewhere pushes the arguments.
        sync.sync();

        // The triggering sync and the single follow-up sync may coalesce
        // in the pump, so accept one or two payloads; the last one must
        // carry the handles.
        let mut pushes = 0;
        loop {
            let payload = h.outbound_rx.recv().await.unwrap();
            pushes += 1;
            assert!(pushes <= 2, "flush issued more than one follow-up sync");
            let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
            if value.get("photos").is_some() {
                assert_eq!(value["photos"][0], "/_f/mock/pic.png");
                break;
            }
        }

        assert_eq!(h.transfers.upload_count(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.outbound_rx.try_recv().is_err());
    }

    #[test]
    fn page_host_renders_the_recovery_overlay_for_not_found() {
        let content = Cell::new(Content::default());
        let host = PageHost {
            content: content.clone(),
            not_found: NotFoundOverlay::new(log_apply_layout()),
        };

        assert_eq!(host.render(), AppView::Loading);

        content.set(Content {
            page: None,
            error: Some(NOT_FOUND.to_string()),
        });
        assert!(matches!(host.render(), AppView::NotFound(_)));

        content.set(Content {
            page: None,
            error: Some("session exploded".to_string()),
        });
        assert_eq!(host.render(), AppView::Error("session exploded".to_string()));

        content.set(Content {
            page: Some(Page {
                key: "s-9".to_string(),
                content: serde_json::json!(null),
            }),
            error: None,
        });
        assert_eq!(
            host.render(),
            AppView::Page {
                key: "s-9".to_string()
            }
        );
    }
}
