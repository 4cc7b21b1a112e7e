//! The message forwarder.
//!
//! Two modes: `direct` uses the native forward call and keeps the
//! "forwarded from" header; `clone` re-creates the content at the
//! destination. Cloned media first tries a server-side file reference and
//! falls back to a download/re-upload round-trip when the reference is
//! rejected or the source forbids forwarding.

use std::path::PathBuf;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::client::{ChatClient, FileSource, OutgoingFile, OutgoingMessage};
use crate::error::{Error, Result};
use crate::media;
use crate::model::{
    ChatHandle, DocumentAttribute, ForwardMode, ForwardResult, Media, MediaKind, Message,
    TextEntity,
};

/// Half-width of the id window scanned for album members. Albums are sent
/// in one burst, so members sit within a few ids of each other.
const ALBUM_ID_WINDOW: i64 = 10;

pub struct MessageForwarder<'a> {
    client: &'a dyn ChatClient,
    temp_dir: PathBuf,
}

/// Drop entities the destination regenerates from raw text: hashtag,
/// mention and cashtag entities, plus formatting runs whose covered text
/// starts with one of those markers (re-parsing would split them).
pub fn strip_auto_entities(text: &str, entities: &[TextEntity]) -> Vec<TextEntity> {
    let chars: Vec<char> = text.chars().collect();
    entities
        .iter()
        .filter(|e| {
            if e.kind.is_auto_regenerated() {
                return false;
            }
            match chars.get(e.offset) {
                Some('#') | Some('@') | Some('$') => false,
                _ => true,
            }
        })
        .cloned()
        .collect()
}

impl<'a> MessageForwarder<'a> {
    pub fn new(client: &'a dyn ChatClient, temp_dir: PathBuf) -> Self {
        Self { client, temp_dir }
    }

    /// Whether the native forward path is available at all.
    pub fn can_forward_direct(source: &ChatHandle, message: &Message) -> bool {
        !source.noforwards && !message.noforwards
    }

    /// Forward one message. Ordinary failures never surface as `Err`; they
    /// are folded into an unsuccessful [`ForwardResult`]. Only flood-wait
    /// signals propagate, so callers can pause the whole cycle.
    #[instrument(skip_all, fields(msg_id = message.id, mode = mode.as_str()))]
    pub async fn forward_message(
        &self,
        message: &Message,
        source: &ChatHandle,
        target: &ChatHandle,
        mode: ForwardMode,
        fallback_to_download: bool,
    ) -> Result<ForwardResult> {
        let outcome = match mode {
            ForwardMode::Direct => self.forward_direct(message, source, target).await,
            ForwardMode::Clone => {
                if message.has_file_media() {
                    self.clone_media(message, source, target, fallback_to_download)
                        .await
                } else {
                    self.clone_text(message, target).await
                }
            }
        };
        match outcome {
            Ok(result) => Ok(result),
            Err(err @ Error::RateLimited { .. }) => Err(err),
            Err(err) => {
                warn!(msg_id = message.id, error = %err, "forward failed");
                Ok(ForwardResult::failure(message.id, err.to_string()))
            }
        }
    }

    async fn forward_direct(
        &self,
        message: &Message,
        source: &ChatHandle,
        target: &ChatHandle,
    ) -> Result<ForwardResult> {
        if !Self::can_forward_direct(source, message) {
            return Ok(ForwardResult::failure(
                message.id,
                "forwarding restricted by source",
            ));
        }
        match self
            .client
            .forward_messages(target, &[message.id], source)
            .await
        {
            Ok(ids) => Ok(ForwardResult {
                success: true,
                source_msg_id: message.id,
                target_msg_id: ids.first().copied(),
                mode_used: Some(ForwardMode::Direct),
                error: None,
                downloaded: false,
            }),
            // Restriction discovered server-side; surfaced, never auto-cloned.
            Err(Error::Restricted(reason)) => Ok(ForwardResult::failure(message.id, reason)),
            Err(err) => Err(err),
        }
    }

    async fn clone_text(&self, message: &Message, target: &ChatHandle) -> Result<ForwardResult> {
        if message.text.is_empty() {
            return Ok(ForwardResult::failure(message.id, "Empty message"));
        }
        let outgoing = OutgoingMessage {
            text: message.text.clone(),
            entities: strip_auto_entities(&message.text, &message.entities),
            // Keep the preview only when the original actually rendered one.
            link_preview: matches!(message.media, Some(Media::WebPage)),
        };
        let id = self.client.send_message(target, outgoing).await?;
        Ok(ForwardResult {
            success: true,
            source_msg_id: message.id,
            target_msg_id: Some(id),
            mode_used: Some(ForwardMode::Clone),
            error: None,
            downloaded: false,
        })
    }

    async fn clone_media(
        &self,
        message: &Message,
        source: &ChatHandle,
        target: &ChatHandle,
        fallback_to_download: bool,
    ) -> Result<ForwardResult> {
        // A protected source invalidates references for re-sending; go
        // straight to the slow path.
        if message.noforwards || source.noforwards {
            debug!(msg_id = message.id, "protected content, skipping reference path");
            let id = self.download_and_send(message, target).await?;
            return Ok(ForwardResult {
                success: true,
                source_msg_id: message.id,
                target_msg_id: Some(id),
                mode_used: Some(ForwardMode::Clone),
                error: None,
                downloaded: true,
            });
        }

        match self.send_by_reference(message, target).await {
            Ok(id) => Ok(ForwardResult {
                success: true,
                source_msg_id: message.id,
                target_msg_id: Some(id),
                mode_used: Some(ForwardMode::Clone),
                error: None,
                downloaded: false,
            }),
            Err(err @ Error::RateLimited { .. }) => Err(err),
            Err(err) if fallback_to_download => {
                warn!(msg_id = message.id, error = %err, "reference send failed, re-uploading");
                let id = self.download_and_send(message, target).await?;
                Ok(ForwardResult {
                    success: true,
                    source_msg_id: message.id,
                    target_msg_id: Some(id),
                    mode_used: Some(ForwardMode::Clone),
                    error: None,
                    downloaded: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn send_by_reference(&self, message: &Message, target: &ChatHandle) -> Result<i64> {
        let file_ref = match &message.media {
            Some(Media::Photo { file, .. }) => file.clone(),
            Some(Media::Document { file, .. }) => file.clone(),
            _ => return Err(Error::Validation("message has no file media".into())),
        };
        let file = self.outgoing_file(message, FileSource::Reference(file_ref));
        self.client.send_file(target, file).await
    }

    async fn download_and_send(&self, message: &Message, target: &ChatHandle) -> Result<i64> {
        let path = self.download_to_temp(message).await?;
        let file = self.outgoing_file(message, FileSource::Path(path.clone()));
        let sent = self.client.send_file(target, file).await;
        let _ = tokio::fs::remove_file(&path).await;
        sent
    }

    async fn download_to_temp(&self, message: &Message) -> Result<PathBuf> {
        let ext = media::media_info(message)
            .map(|info| media::default_extension(&info))
            .unwrap_or_default();
        let path = self
            .temp_dir
            .join(format!("fwd-{}-{}{ext}", message.id, Uuid::new_v4()));
        let bytes = self.client.download_media(message, &path).await?;
        debug!(msg_id = message.id, bytes, "downloaded media");
        Ok(path)
    }

    /// Build the outgoing file preserving the original's rendering: caption
    /// with cleaned entities, filename, mime type and document attributes.
    fn outgoing_file(&self, message: &Message, source: FileSource) -> OutgoingFile {
        let info = media::media_info(message);
        let mut file = OutgoingFile::new(source);
        file.caption = message.text.clone();
        file.entities = strip_auto_entities(&message.text, &message.entities);
        if let Some(info) = &info {
            file.filename = info.filename.clone();
            file.mime_type = info.mime_type.clone();
            file.supports_streaming = info.kind == MediaKind::Video;
            // Plain documents must not be re-classified as photos on upload.
            file.force_document = info.kind == MediaKind::Document;
        }
        if let Some(Media::Document { attributes, .. }) = &message.media {
            file.attributes = attributes.clone();
            file.supports_streaming = file.supports_streaming
                || attributes.iter().any(|a| {
                    matches!(
                        a,
                        DocumentAttribute::Video {
                            supports_streaming: true,
                            ..
                        }
                    )
                });
        }
        file
    }

    /// Forward a batch of messages in order. Per-message failures land in
    /// their results; a flood wait aborts the rest of the batch.
    pub async fn forward_many(
        &self,
        messages: &[Message],
        source: &ChatHandle,
        target: &ChatHandle,
        mode: ForwardMode,
        fallback_to_download: bool,
    ) -> Result<Vec<ForwardResult>> {
        let mut results = Vec::with_capacity(messages.len());
        for msg in messages {
            results.push(
                self.forward_message(msg, source, target, mode, fallback_to_download)
                    .await?,
            );
        }
        Ok(results)
    }

    /// Fetch every member of the album `message` belongs to, scanning a
    /// fixed id window around it. Returns members in ascending id order;
    /// a message without a group comes back alone.
    #[instrument(skip_all, fields(msg_id = message.id))]
    pub async fn get_grouped_messages(
        &self,
        message: &Message,
        source: &ChatHandle,
    ) -> Result<Vec<Message>> {
        let Some(grouped_id) = message.grouped_id else {
            return Ok(vec![message.clone()]);
        };
        let ids: Vec<i64> = (message.id - ALBUM_ID_WINDOW..=message.id + ALBUM_ID_WINDOW)
            .filter(|&id| id > 0)
            .collect();
        let mut members: Vec<Message> = self
            .client
            .get_messages(source, &ids)
            .await?
            .into_iter()
            .flatten()
            .filter(|m| m.grouped_id == Some(grouped_id))
            .collect();
        members.sort_by_key(|m| m.id);
        Ok(members)
    }

    /// Forward a whole album as one group so the destination renders it as
    /// an album too. The caption comes from the first captioned member.
    #[instrument(skip_all, fields(members = messages.len()))]
    pub async fn forward_album(
        &self,
        messages: &[Message],
        source: &ChatHandle,
        target: &ChatHandle,
        mode: ForwardMode,
    ) -> Result<Vec<i64>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        if mode == ForwardMode::Direct {
            let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
            return self.client.forward_messages(target, &ids, source).await;
        }

        let mut paths = Vec::with_capacity(messages.len());
        let mut files = Vec::with_capacity(messages.len());
        let mut caption_used = false;
        let mut result = Ok(Vec::new());

        for msg in messages {
            match self.download_to_temp(msg).await {
                Ok(path) => {
                    let mut file = self.outgoing_file(msg, FileSource::Path(path.clone()));
                    if caption_used || msg.text.is_empty() {
                        file.caption = String::new();
                        file.entities = Vec::new();
                    } else {
                        caption_used = true;
                    }
                    paths.push(path);
                    files.push(file);
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }

        if result.is_ok() {
            result = self.client.send_album(target, files).await;
        }
        for path in paths {
            let _ = tokio::fs::remove_file(&path).await;
        }
        result
    }
}
