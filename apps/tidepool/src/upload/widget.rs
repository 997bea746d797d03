//! Per-widget upload state.
//!
//! A widget owns the cells describing one upload control: the confirmed
//! selection, the drag-hover flag, error and success messages, and the
//! progress fraction. At most one of error, success, or in-progress is
//! presented, in that priority. Validation rejections stay widget-local
//! and never touch argument state or a previously confirmed selection.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::cell::{Bond, Cell};

use super::batch::PendingUploads;
use super::{FilePayload, ProgressFn, Transfers, UploadConfig, UploadEvent, validate_selection};

pub(crate) const GENERIC_UPLOAD_ERROR: &str = "There was an error when uploading file.";

#[derive(Clone)]
pub struct UploadWidget {
    config: Arc<UploadConfig>,
    selection: Cell<Vec<FilePayload>>,
    file_names: Cell<String>,
    dragging: Cell<bool>,
    error: Cell<String>,
    success: Cell<String>,
    progress: Cell<f64>,
    transfers: Arc<dyn Transfers>,
    events: mpsc::UnboundedSender<UploadEvent>,
    pending: Arc<PendingUploads>,
}

impl UploadWidget {
    pub(crate) fn new(
        config: UploadConfig,
        transfers: Arc<dyn Transfers>,
        events: mpsc::UnboundedSender<UploadEvent>,
        pending: Arc<PendingUploads>,
    ) -> Self {
        UploadWidget {
            config: Arc::new(config),
            selection: Cell::new(Vec::new()),
            file_names: Cell::new(String::new()),
            dragging: Cell::new(false),
            error: Cell::new(String::new()),
            success: Cell::new(String::new()),
            progress: Cell::new(0.0),
            transfers,
            events,
            pending,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Browse-input selection. A rejection surfaces on the widget and
    /// leaves any previously confirmed selection untouched; an accepted
    /// compact selection additionally stages for the next sync cycle.
    pub fn select(&self, files: Vec<FilePayload>) {
        if files.is_empty() {
            return;
        }
        match validate_selection(&self.config, &files) {
            Err(rejection) => self.error.set(rejection.to_string()),
            Ok(()) => {
                if self.config.compact {
                    self.pending.stage(&self.config.name, files.clone());
                }
                self.file_names.set(
                    files
                        .iter()
                        .map(|f| f.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                );
                self.selection.set(files);
            }
        }
    }

    pub fn drag_enter(&self) {
        self.dragging.set(true);
    }

    pub fn drag_leave(&self) {
        self.dragging.set(false);
    }

    /// Drop-zone selection. Ignored while an error or success message is
    /// up, matching the rendered state of the drop target.
    pub fn drop_files(&self, files: Vec<FilePayload>) {
        self.dragging.set(false);
        if files.is_empty() || !self.error.get().is_empty() || !self.success.get().is_empty() {
            return;
        }
        match validate_selection(&self.config, &files) {
            Err(rejection) => self.error.set(rejection.to_string()),
            Ok(()) => self.selection.set(files),
        }
    }

    pub fn remove_file(&self, index: usize) {
        let mut files = self.selection.get();
        if index < files.len() {
            files.remove(index);
            self.selection.set(files);
        }
    }

    pub fn dismiss_error(&self) {
        self.error.set(String::new());
    }

    pub fn dismiss_success(&self) {
        self.success.set(String::new());
        self.progress.set(0.0);
    }

    pub fn can_confirm(&self) -> bool {
        self.progress.get() == 0.0 && !self.selection.get().is_empty()
    }

    /// Start the interactive transfer for the confirmed selection. The
    /// result comes back to the client loop as an `UploadEvent`; nothing
    /// here blocks and nothing can be cancelled once started.
    pub fn confirm(&self) {
        if !self.can_confirm() {
            return;
        }
        let files = self.selection.get();
        let widget = self.config.name.clone();
        let transfers = Arc::clone(&self.transfers);
        let events = self.events.clone();
        let progress_tx = self.events.clone();
        let progress_widget = widget.clone();
        let progress: ProgressFn = Arc::new(move |fraction| {
            let _ = progress_tx.send(UploadEvent::Progress {
                widget: progress_widget.clone(),
                fraction,
            });
        });
        debug!(target = "upload::widget", widget = %widget, files = files.len(), "upload confirmed");
        tokio::spawn(async move {
            let outcome = transfers.upload(files, Some(progress)).await;
            let _ = events.send(UploadEvent::Settled { widget, outcome });
        });
    }

    pub(crate) fn set_progress(&self, fraction: f64) {
        self.progress.set(fraction.clamp(0.0, 1.0));
    }

    pub(crate) fn selection_names(&self) -> Vec<String> {
        self.selection.get().iter().map(|f| f.name.clone()).collect()
    }

    pub(crate) fn note_success(&self, names: &[String]) {
        self.success
            .set(format!("Successfully uploaded files: {}.", names.join(",")));
        self.selection.set(Vec::new());
    }

    pub(crate) fn note_failure(&self) {
        self.error.set(GENERIC_UPLOAD_ERROR.to_string());
        self.selection.set(Vec::new());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadBody {
    Error(String),
    Success(String),
    DropHint,
    Progress(f64),
    Chosen(Vec<String>),
    Idle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadView {
    pub visible: bool,
    pub compact: bool,
    pub label: Option<String>,
    pub file_names: String,
    pub can_confirm: bool,
    pub body: UploadBody,
}

impl Bond for UploadWidget {
    type View = UploadView;

    fn render(&self) -> UploadView {
        let error = self.error.get();
        let success = self.success.get();
        let progress = self.progress.get();
        let selection = self.selection.get();
        let body = if !error.is_empty() {
            UploadBody::Error(error)
        } else if !success.is_empty() {
            UploadBody::Success(success)
        } else if self.dragging.get() {
            UploadBody::DropHint
        } else if progress > 0.0 {
            UploadBody::Progress(progress)
        } else if !selection.is_empty() {
            UploadBody::Chosen(selection.iter().map(|f| f.name.clone()).collect())
        } else {
            UploadBody::Idle
        };
        UploadView {
            visible: self.config.visible,
            compact: self.config.compact,
            label: self.config.label.clone(),
            file_names: self.file_names.get(),
            can_confirm: self.can_confirm(),
            body,
        }
    }
}
