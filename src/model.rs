use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a rule forwards messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// Re-create the content at the destination, no "forwarded from" header.
    Clone,
    /// Native forward preserving attribution.
    Direct,
}

impl ForwardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardMode::Clone => "clone",
            ForwardMode::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clone" => Some(ForwardMode::Clone),
            "direct" => Some(ForwardMode::Direct),
            _ => None,
        }
    }
}

/// A forwarding rule as persisted in the `rules` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub source_chat: String,
    pub target_chat: String,
    pub mode: ForwardMode,
    pub interval_minutes: i64,
    pub enabled: bool,
    pub filter_spec: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-(rule, namespace) incremental sync cursor.
///
/// `last_msg_id` is monotonic non-decreasing; the store clamps updates to
/// `max(existing, new)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub rule_id: i64,
    pub namespace: String,
    pub last_msg_id: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub total_forwarded: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A background job record as persisted in the `tasks` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub kind: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub stage: String,
    pub details: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a single forward attempt. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardResult {
    pub success: bool,
    pub source_msg_id: i64,
    pub target_msg_id: Option<i64>,
    pub mode_used: Option<ForwardMode>,
    pub error: Option<String>,
    /// True when the media had to be downloaded and re-uploaded.
    pub downloaded: bool,
}

impl ForwardResult {
    pub fn failure(source_msg_id: i64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            source_msg_id,
            target_msg_id: None,
            mode_used: None,
            error: Some(error.into()),
            downloaded: false,
        }
    }
}

/// Outcome of syncing one rule. Errors are captured, never thrown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResult {
    pub rule_name: String,
    pub messages_found: usize,
    pub messages_forwarded: usize,
    pub messages_failed: usize,
    pub messages_skipped: usize,
    pub new_last_msg_id: i64,
    pub error: Option<String>,
}

impl SyncResult {
    pub fn new(rule_name: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
            ..Default::default()
        }
    }

    pub fn with_error(rule_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Snapshot of a rule's watch state for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct WatchStatus {
    pub rule_name: String,
    pub source_chat: String,
    pub target_chat: String,
    pub last_msg_id: i64,
    pub total_forwarded: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub is_running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    User,
    Group,
    Channel,
    SavedMessages,
}

/// A resolved chat the client can address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatHandle {
    pub id: i64,
    pub title: Option<String>,
    pub username: Option<String>,
    pub kind: ChatKind,
    /// Chat-level forwarding restriction flag.
    pub noforwards: bool,
}

impl ChatHandle {
    pub fn display_name(&self) -> String {
        self.title
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Kind of a formatting entity attached to message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Hashtag,
    Mention,
    Cashtag,
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Code,
    Pre,
    TextUrl(String),
}

impl EntityKind {
    /// Entity kinds the destination regenerates from the raw text. Re-sending
    /// them would double up with the auto-detected ones.
    pub fn is_auto_regenerated(&self) -> bool {
        matches!(
            self,
            EntityKind::Hashtag | EntityKind::Mention | EntityKind::Cashtag
        )
    }
}

/// A formatting run over message text, in char offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEntity {
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
}

/// Opaque server-side file reference, usable to resend media without a
/// download/upload round-trip while the server still has the file cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoSize {
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentAttribute {
    Filename(String),
    Video {
        width: u32,
        height: u32,
        duration: u32,
        round: bool,
        supports_streaming: bool,
    },
    Audio {
        duration: u32,
        voice: bool,
        title: Option<String>,
        performer: Option<String>,
    },
    ImageSize {
        width: u32,
        height: u32,
    },
    Animated,
    Sticker,
}

/// Media attached to a message, mapped from wire objects at the client
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Media {
    Photo {
        sizes: Vec<PhotoSize>,
        file: FileRef,
    },
    Document {
        file: FileRef,
        size: u64,
        mime_type: String,
        attributes: Vec<DocumentAttribute>,
    },
    /// Link preview attachment. Not a real file; only affects link_preview.
    WebPage,
}

/// A message as seen by the forwarding core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub date: DateTime<Utc>,
    pub text: String,
    pub entities: Vec<TextEntity>,
    pub media: Option<Media>,
    /// Album (media group) identifier shared by grouped messages.
    pub grouped_id: Option<i64>,
    /// Message-level forwarding restriction flag.
    pub noforwards: bool,
}

impl Message {
    pub fn has_file_media(&self) -> bool {
        matches!(
            self.media,
            Some(Media::Photo { .. }) | Some(Media::Document { .. })
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Voice,
    Document,
    Animation,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::Document => "document",
            MediaKind::Animation => "animation",
            MediaKind::Sticker => "sticker",
        }
    }
}

/// Normalized descriptor of a message's media. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct MediaInfo {
    pub kind: MediaKind,
    pub size: u64,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<u32>,
}
