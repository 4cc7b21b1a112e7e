#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use tg_forward::client::{ChatClient, FileSource, OutgoingFile, OutgoingMessage};
use tg_forward::config::{App, Config, Retry, Upload, Watch};
use tg_forward::db::{self, Pool};
use tg_forward::error::{Error, Result};
use tg_forward::model::{ChatHandle, ChatKind, FileRef, Media, Message};

/// What kind of payload a sent file carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentSource {
    Reference,
    Path,
    Uploaded,
}

impl SentSource {
    fn of(file: &OutgoingFile) -> Self {
        match file.source {
            FileSource::Reference(_) => SentSource::Reference,
            FileSource::Path(_) => SentSource::Path,
            FileSource::Uploaded(_) => SentSource::Uploaded,
        }
    }
}

/// Recording of one outgoing client call.
#[derive(Debug, Clone)]
pub enum Sent {
    Text {
        chat_id: i64,
        text: String,
        link_preview: bool,
        entities: usize,
    },
    File {
        chat_id: i64,
        source: SentSource,
        caption: String,
        filename: Option<String>,
    },
    Album {
        chat_id: i64,
        sources: Vec<SentSource>,
        captions: Vec<String>,
    },
    Forwarded {
        chat_id: i64,
        ids: Vec<i64>,
    },
}

/// In-memory chat client recording everything sent through it.
#[derive(Default)]
pub struct FakeClient {
    pub chats: Mutex<HashMap<i64, ChatHandle>>,
    pub messages: Mutex<HashMap<i64, Vec<Message>>>,
    pub sent: Mutex<Vec<Sent>>,
    next_msg_id: AtomicI64,
    /// Reject sends that use a server-side file reference.
    pub fail_reference: bool,
    /// Reject plain text sends with a transient server error.
    pub fail_send: bool,
    send_attempts: AtomicUsize,
    /// Next send call fails with a flood wait of this many seconds.
    pub rate_limit_next: Mutex<Option<u64>>,
    upload_current: AtomicUsize,
    upload_max: AtomicUsize,
    pub parts: Mutex<Vec<(usize, usize, bool)>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            next_msg_id: AtomicI64::new(10_000),
            ..Default::default()
        }
    }

    pub fn me() -> ChatHandle {
        ChatHandle {
            id: 1,
            title: None,
            username: Some("self".into()),
            kind: ChatKind::SavedMessages,
            noforwards: false,
        }
    }

    pub fn add_chat(&self, chat: ChatHandle) {
        self.chats.lock().unwrap().insert(chat.id, chat);
    }

    pub fn add_message(&self, msg: Message) {
        self.messages.lock().unwrap().entry(msg.chat_id).or_default().push(msg);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn max_upload_concurrency(&self) -> usize {
        self.upload_max.load(Ordering::SeqCst)
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> i64 {
        self.next_msg_id.fetch_add(1, Ordering::SeqCst)
    }

    fn check_rate_limit(&self) -> Result<()> {
        if let Some(seconds) = self.rate_limit_next.lock().unwrap().take() {
            return Err(Error::RateLimited { seconds });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatClient for FakeClient {
    async fn get_me(&self) -> Result<ChatHandle> {
        Ok(Self::me())
    }

    async fn get_chat(&self, id: i64) -> Result<ChatHandle> {
        self.chats
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn get_chat_by_name(&self, name: &str) -> Result<ChatHandle> {
        let wanted = name.trim_start_matches('@');
        self.chats
            .lock()
            .unwrap()
            .values()
            .find(|c| c.username.as_deref() == Some(wanted))
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn list_dialogs(&self, limit: usize) -> Result<Vec<ChatHandle>> {
        Ok(self.chats.lock().unwrap().values().take(limit).cloned().collect())
    }

    async fn fetch_messages(
        &self,
        chat: &ChatHandle,
        min_id: i64,
        limit: Option<usize>,
        oldest_first: bool,
    ) -> Result<Vec<Message>> {
        let mut msgs: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .get(&chat.id)
            .map(|v| v.iter().filter(|m| m.id > min_id).cloned().collect())
            .unwrap_or_default();
        msgs.sort_by_key(|m| m.id);
        if !oldest_first {
            msgs.reverse();
        }
        if let Some(limit) = limit {
            msgs.truncate(limit);
        }
        Ok(msgs)
    }

    async fn get_messages(&self, chat: &ChatHandle, ids: &[i64]) -> Result<Vec<Option<Message>>> {
        let store = self.messages.lock().unwrap();
        let msgs = store.get(&chat.id);
        Ok(ids
            .iter()
            .map(|&id| msgs.and_then(|v| v.iter().find(|m| m.id == id).cloned()))
            .collect())
    }

    async fn send_message(&self, chat: &ChatHandle, message: OutgoingMessage) -> Result<i64> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_rate_limit()?;
        if self.fail_send {
            return Err(Error::Transient("INTERNAL_SERVER_ERROR".into()));
        }
        self.sent.lock().unwrap().push(Sent::Text {
            chat_id: chat.id,
            text: message.text,
            link_preview: message.link_preview,
            entities: message.entities.len(),
        });
        Ok(self.next_id())
    }

    async fn send_file(&self, chat: &ChatHandle, file: OutgoingFile) -> Result<i64> {
        self.check_rate_limit()?;
        let source = SentSource::of(&file);
        if self.fail_reference && source == SentSource::Reference {
            return Err(Error::Transient("FILE_REFERENCE_EXPIRED".into()));
        }
        self.sent.lock().unwrap().push(Sent::File {
            chat_id: chat.id,
            source,
            caption: file.caption,
            filename: file.filename,
        });
        Ok(self.next_id())
    }

    async fn send_album(&self, chat: &ChatHandle, files: Vec<OutgoingFile>) -> Result<Vec<i64>> {
        self.check_rate_limit()?;
        let sources = files.iter().map(SentSource::of).collect();
        let captions = files.iter().map(|f| f.caption.clone()).collect();
        self.sent.lock().unwrap().push(Sent::Album {
            chat_id: chat.id,
            sources,
            captions,
        });
        Ok(files.iter().map(|_| self.next_id()).collect())
    }

    async fn forward_messages(
        &self,
        target: &ChatHandle,
        ids: &[i64],
        source: &ChatHandle,
    ) -> Result<Vec<i64>> {
        self.check_rate_limit()?;
        if source.noforwards {
            return Err(Error::Restricted("chat forbids forwarding".into()));
        }
        {
            let store = self.messages.lock().unwrap();
            if let Some(msgs) = store.get(&source.id) {
                if msgs.iter().any(|m| ids.contains(&m.id) && m.noforwards) {
                    return Err(Error::Restricted("message forbids forwarding".into()));
                }
            }
        }
        self.sent.lock().unwrap().push(Sent::Forwarded {
            chat_id: target.id,
            ids: ids.to_vec(),
        });
        Ok(ids.iter().map(|_| self.next_id()).collect())
    }

    async fn download_media(&self, message: &Message, dest: &Path) -> Result<u64> {
        let bytes = format!("media-{}", message.id).into_bytes();
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn save_file_part(
        &self,
        _file_id: i64,
        index: usize,
        total: usize,
        _bytes: Vec<u8>,
        big: bool,
    ) -> Result<()> {
        let current = self.upload_current.fetch_add(1, Ordering::SeqCst) + 1;
        self.upload_max.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.parts.lock().unwrap().push((index, total, big));
        self.upload_current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn channel(id: i64, noforwards: bool) -> ChatHandle {
    ChatHandle {
        id,
        title: Some(format!("chat {id}")),
        username: None,
        kind: ChatKind::Channel,
        noforwards,
    }
}

pub fn text_message(chat_id: i64, id: i64, text: &str) -> Message {
    Message {
        id,
        chat_id,
        date: Utc::now(),
        text: text.into(),
        entities: Vec::new(),
        media: None,
        grouped_id: None,
        noforwards: false,
    }
}

pub fn document_message(chat_id: i64, id: i64, caption: &str) -> Message {
    Message {
        id,
        chat_id,
        date: Utc::now(),
        text: caption.into(),
        entities: Vec::new(),
        media: Some(Media::Document {
            file: FileRef(format!("ref-{id}")),
            size: 2048,
            mime_type: "application/pdf".into(),
            attributes: Vec::new(),
        }),
        grouped_id: None,
        noforwards: false,
    }
}

/// Test config with zero pacing delays and a tempdir-backed data dir.
pub fn test_config(data_dir: &Path) -> Config {
    Config {
        app: App {
            data_dir: data_dir.to_string_lossy().to_string(),
            namespace: "default".into(),
        },
        watch: Watch {
            message_delay_min_secs: 0.0,
            message_delay_max_secs: 0.0,
            default_interval_minutes: 30,
        },
        retry: Retry {
            max_attempts: 3,
            min_delay_secs: 0.0,
            max_delay_secs: 0.0,
        },
        upload: Upload {
            threads: 2,
            limit: 2,
            part_size_kb: 1,
        },
    }
}

pub async fn memory_pool() -> Pool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

/// Write an executable shell script standing in for the stream downloader.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
