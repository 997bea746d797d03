//! File transfer to the session server's upload endpoint.
//!
//! Selection validation is pure and synchronous; transfers go through the
//! [`Transfers`] seam so the batched flush and the widgets can be driven
//! against an in-memory implementation in tests. The HTTP implementation
//! posts one multipart request per widget with a repeated `files` field
//! and reports byte-level progress as a fraction of the whole request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

use crate::protocol::FileHandle;
use crate::telemetry;

pub mod batch;
pub mod widget;

pub use batch::UploadCoordinator;
pub use widget::{UploadBody, UploadView, UploadWidget};

/// One selected or staged file: a name plus its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub name: String,
    pub bytes: Bytes,
}

impl FilePayload {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        FilePayload {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Upload widget configuration. One record per widget, supplied by the
/// presentation layer when the widget is registered.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Identifying name; doubles as the argument-map key for the handles.
    pub name: String,
    /// Action label shown on the confirm control.
    pub label: Option<String>,
    /// Allow more than one file per selection. Defaults to false.
    pub multiple: bool,
    /// Allowed extensions, with or without a leading dot, any case.
    /// Absent means any extension.
    pub file_extensions: Option<Vec<String>>,
    /// Per-file ceiling in megabytes. Absent means no limit.
    pub max_file_size: Option<f64>,
    /// Aggregate ceiling in megabytes. Absent means no limit.
    pub max_size: Option<f64>,
    /// Batched mode: selections stage locally and upload on the next
    /// synchronization cycle. Defaults to false (interactive mode).
    pub compact: bool,
    /// Defaults to true.
    pub visible: bool,
}

impl UploadConfig {
    pub fn new(name: impl Into<String>) -> Self {
        UploadConfig {
            name: name.into(),
            label: None,
            multiple: false,
            file_extensions: None,
            max_file_size: None,
            max_size: None,
            compact: false,
            visible: true,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_multiple(mut self, multiple: bool) -> Self {
        self.multiple = multiple;
        self
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.file_extensions = Some(extensions.iter().map(|e| e.to_string()).collect());
        self
    }

    pub fn with_max_file_size(mut self, megabytes: f64) -> Self {
        self.max_file_size = Some(megabytes);
        self
    }

    pub fn with_max_size(mut self, megabytes: f64) -> Self {
        self.max_size = Some(megabytes);
        self
    }

    pub fn with_compact(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }
}

const BYTES_PER_MEGABYTE: f64 = 1_048_576.0;

/// Widget-scoped selection rejection. Never reaches the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(String);

/// Check a selection against the widget configuration. First violation
/// wins: multiplicity, then extensions, then per-file size, then total
/// size. Unconfigured rules are skipped.
pub fn validate_selection(config: &UploadConfig, files: &[FilePayload]) -> Result<(), ValidationError> {
    if !config.multiple && files.len() > 1 {
        return Err(ValidationError(
            "Cannot upload multiple files. Input is not set to multiple mode.".to_string(),
        ));
    }

    if let Some(extensions) = &config.file_extensions {
        let allowed: Vec<String> = extensions
            .iter()
            .map(|e| {
                let e = e.to_lowercase();
                if e.starts_with('.') { e } else { format!(".{e}") }
            })
            .collect();
        let offenders: Vec<&str> = files
            .iter()
            .filter(|f| {
                let name = f.name.to_lowercase();
                !allowed.iter().any(|ext| name.ends_with(ext))
            })
            .map(|f| f.name.as_str())
            .collect();
        if !offenders.is_empty() {
            return Err(ValidationError(format!(
                "Not allowed extension for files: {}. Allowed file extensions: {}.",
                offenders.join(", "),
                allowed.join(", "),
            )));
        }
    }

    if let Some(max_file_size) = config.max_file_size {
        let ceiling = max_file_size * BYTES_PER_MEGABYTE;
        let offenders: Vec<&str> = files
            .iter()
            .filter(|f| f.size() as f64 > ceiling)
            .map(|f| f.name.as_str())
            .collect();
        if !offenders.is_empty() {
            return Err(ValidationError(format!(
                "Max file size exceeded for files: {}. Allowed size per file: {}Mb.",
                offenders.join(", "),
                max_file_size,
            )));
        }
    }

    if let Some(max_size) = config.max_size {
        let total: u64 = files.iter().map(|f| f.size()).sum();
        if total as f64 > max_size * BYTES_PER_MEGABYTE {
            return Err(ValidationError(format!(
                "Total max file size exceeded. Allowed size: {}Mb.",
                max_size,
            )));
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upload failed: {0}")]
    Failed(String),
}

/// Progress callback; receives the fraction of bytes handed to the
/// transport so far, in [0, 1].
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Events emitted by transfer tasks, consumed by the client loop.
#[derive(Debug)]
pub enum UploadEvent {
    Progress {
        widget: String,
        fraction: f64,
    },
    Settled {
        widget: String,
        outcome: Result<Vec<FileHandle>, UploadError>,
    },
    FlushSettled {
        results: Vec<(String, Result<Vec<FileHandle>, UploadError>)>,
    },
}

/// Transfer seam for the upload endpoint. The returned handles are
/// positionally associated with the uploaded files.
#[async_trait]
pub trait Transfers: Send + Sync {
    async fn upload(
        &self,
        files: Vec<FilePayload>,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<FileHandle>, UploadError>;
}

#[derive(Deserialize)]
struct UploadResponse {
    files: Vec<FileHandle>,
}

/// Multipart POST against the session server's upload endpoint.
pub struct HttpTransfers {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransfers {
    pub fn new(endpoint: impl Into<String>) -> Self {
        HttpTransfers {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Transfers for HttpTransfers {
    async fn upload(
        &self,
        files: Vec<FilePayload>,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<FileHandle>, UploadError> {
        let total: u64 = files.iter().map(|f| f.size()).sum();
        let sent = Arc::new(AtomicU64::new(0));

        let mut form = reqwest::multipart::Form::new();
        for file in files {
            let size = file.size();
            telemetry::upload_sent(file.bytes.len());
            let part = match &progress {
                Some(callback) => {
                    let stream =
                        metered_chunks(file.bytes, total, Arc::clone(&sent), Arc::clone(callback));
                    reqwest::multipart::Part::stream_with_length(
                        reqwest::Body::wrap_stream(stream),
                        size,
                    )
                    .file_name(file.name)
                }
                None => reqwest::multipart::Part::bytes(file.bytes.to_vec()).file_name(file.name),
            };
            form = form.part("files", part);
        }

        let response = self
            .client
            .post(self.endpoint.as_str())
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        let parsed: UploadResponse = response.json().await?;
        Ok(parsed.files)
    }
}

const PROGRESS_CHUNK: usize = 64 * 1024;

/// Split a payload into chunks that report cumulative progress as the
/// transport consumes them.
fn metered_chunks(
    bytes: Bytes,
    total: u64,
    sent: Arc<AtomicU64>,
    progress: ProgressFn,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + PROGRESS_CHUNK).min(bytes.len());
        chunks.push(bytes.slice(offset..end));
        offset = end;
    }
    futures_util::stream::iter(chunks.into_iter().map(move |chunk| {
        let done = sent.fetch_add(chunk.len() as u64, Ordering::SeqCst) + chunk.len() as u64;
        if total > 0 {
            progress((done as f64 / total as f64).min(1.0));
        }
        Ok(chunk)
    }))
}
