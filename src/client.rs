//! Chat-client boundary.
//!
//! The wire protocol itself lives outside this crate. The forwarding core
//! only sees `ChatClient`, whose implementations map protocol objects into
//! the typed values in [`crate::model`] at the boundary.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ChatHandle, DocumentAttribute, FileRef, Message, TextEntity};

/// A text message to send.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub text: String,
    pub entities: Vec<TextEntity>,
    pub link_preview: bool,
}

/// Where the payload of an outgoing file comes from.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// Resend by server-side reference, no download/upload round-trip.
    Reference(FileRef),
    /// Stream from a local file.
    Path(PathBuf),
    /// Already uploaded in parts via [`ChatClient::save_file_part`].
    Uploaded(UploadedFile),
}

/// A file (or album item) to send, preserving the original attributes so the
/// destination renders identically after a re-upload.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub source: FileSource,
    pub caption: String,
    pub entities: Vec<TextEntity>,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub attributes: Vec<DocumentAttribute>,
    pub force_document: bool,
    pub supports_streaming: bool,
}

impl OutgoingFile {
    pub fn new(source: FileSource) -> Self {
        Self {
            source,
            caption: String::new(),
            entities: Vec::new(),
            filename: None,
            mime_type: None,
            attributes: Vec::new(),
            force_document: false,
            supports_streaming: false,
        }
    }
}

/// Handle to a file uploaded in parts, ready for a send call.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_id: i64,
    pub parts: usize,
    pub name: String,
    /// Present only for the small-file protocol (below the big-file
    /// threshold), which requires a whole-file checksum.
    pub md5: Option<String>,
    pub big: bool,
}

/// Opaque capability over the messaging network.
///
/// Implementations must map flood-wait signals to `Error::RateLimited` and
/// forward-restriction signals to `Error::Restricted`; the core's fallback
/// logic keys off those variants.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// The caller's own identity ("saved messages" chat).
    async fn get_me(&self) -> Result<ChatHandle>;

    /// Look up a chat by raw numeric id, exactly as given.
    async fn get_chat(&self, id: i64) -> Result<ChatHandle>;

    /// Look up a chat by username or link.
    async fn get_chat_by_name(&self, name: &str) -> Result<ChatHandle>;

    /// List the caller's dialogs, most recent first.
    async fn list_dialogs(&self, limit: usize) -> Result<Vec<ChatHandle>>;

    /// Fetch messages with id strictly greater than `min_id`.
    /// `oldest_first` controls iteration order.
    async fn fetch_messages(
        &self,
        chat: &ChatHandle,
        min_id: i64,
        limit: Option<usize>,
        oldest_first: bool,
    ) -> Result<Vec<Message>>;

    /// Fetch specific messages; absent ids yield `None` at their position.
    async fn get_messages(&self, chat: &ChatHandle, ids: &[i64]) -> Result<Vec<Option<Message>>>;

    /// Send a text message; returns the new message id.
    async fn send_message(&self, chat: &ChatHandle, message: OutgoingMessage) -> Result<i64>;

    /// Send a single file; returns the new message id.
    async fn send_file(&self, chat: &ChatHandle, file: OutgoingFile) -> Result<i64>;

    /// Send several files as one grouped album; returns the new message ids.
    async fn send_album(&self, chat: &ChatHandle, files: Vec<OutgoingFile>) -> Result<Vec<i64>>;

    /// Native forward with attribution; returns the new message ids.
    async fn forward_messages(
        &self,
        target: &ChatHandle,
        ids: &[i64],
        source: &ChatHandle,
    ) -> Result<Vec<i64>>;

    /// Stream the message's media to `dest`; returns bytes written.
    async fn download_media(&self, message: &Message, dest: &Path) -> Result<u64>;

    /// Upload one part of a chunked file transfer.
    async fn save_file_part(
        &self,
        file_id: i64,
        index: usize,
        total: usize,
        bytes: Vec<u8>,
        big: bool,
    ) -> Result<()>;
}
