use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Path of the bidirectional session channel on the session server.
pub const SESSION_PATH: &str = "/_s";
/// Path of the multipart upload endpoint on the session server.
pub const UPLOAD_PATH: &str = "/_f";
/// Reserved argument name carrying the address-bar fragment.
pub const FRAGMENT_ARG: &str = "#";

/// Opaque reference to a file stored by the session server, as returned by
/// the upload endpoint. Transmitted back verbatim inside the argument map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileHandle(pub String);

impl From<&str> for FileHandle {
    fn from(value: &str) -> Self {
        FileHandle(value.to_string())
    }
}

/// A single argument value. Arguments are JSON on the wire; the session
/// only ever sees scalars, scalar lists, or file-handle lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
    Files(Vec<FileHandle>),
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_string())
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

/// Outbound interaction state, serialized wholesale on every sync.
/// Entries persist until overwritten.
pub type ArgMap = BTreeMap<String, ArgValue>;

/// The rendered page for the session. Replaced wholesale on every inbound
/// data frame; `key` is an opaque identity assigned by the session and
/// `content` is opaque to this layer (layout format is owned by the
/// presentation collaborators).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub key: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Info,
    Warn,
    Err,
}

/// Error payload signalling that the session has no page yet and the
/// client may offer to initialize one.
pub const NOT_FOUND: &str = "not_found";

/// Inbound frame from the session server. Decoded once per frame and
/// consumed by the client loop; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerFrame {
    Data { page: Page },
    Message { kind: MessageKind, text: String },
    Reset,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub fn decode_server_frame(text: &str) -> Result<ServerFrame, FrameError> {
    serde_json::from_str(text).map_err(FrameError::from)
}

pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(FrameError::from)
}

/// Serialize the full argument map for one outbound sync push.
pub fn encode_args(args: &ArgMap) -> Result<String, FrameError> {
    serde_json::to_string(args).map_err(FrameError::from)
}
