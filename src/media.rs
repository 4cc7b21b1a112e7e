//! Media classification and album grouping helpers.

use std::collections::BTreeMap;

use crate::model::{DocumentAttribute, Media, MediaInfo, MediaKind, Message};

/// Normalize a message's media into a [`MediaInfo`] descriptor.
/// Web page previews are not files and yield `None`.
pub fn media_info(message: &Message) -> Option<MediaInfo> {
    match message.media.as_ref()? {
        Media::Photo { sizes, .. } => {
            let largest = sizes.iter().max_by_key(|s| s.size);
            Some(MediaInfo {
                kind: MediaKind::Photo,
                size: largest.map(|s| s.size).unwrap_or(0),
                filename: None,
                mime_type: Some("image/jpeg".to_string()),
                width: largest.map(|s| s.width),
                height: largest.map(|s| s.height),
                duration: None,
            })
        }
        Media::Document {
            size,
            mime_type,
            attributes,
            ..
        } => {
            let mut info = MediaInfo {
                kind: MediaKind::Document,
                size: *size,
                filename: None,
                mime_type: Some(mime_type.clone()),
                width: None,
                height: None,
                duration: None,
            };
            for attr in attributes {
                match attr {
                    DocumentAttribute::Filename(name) => info.filename = Some(name.clone()),
                    DocumentAttribute::Video {
                        width,
                        height,
                        duration,
                        ..
                    } => {
                        info.kind = MediaKind::Video;
                        info.width = Some(*width);
                        info.height = Some(*height);
                        info.duration = Some(*duration);
                    }
                    DocumentAttribute::Audio {
                        duration, voice, ..
                    } => {
                        info.kind = if *voice {
                            MediaKind::Voice
                        } else {
                            MediaKind::Audio
                        };
                        info.duration = Some(*duration);
                    }
                    DocumentAttribute::ImageSize { width, height } => {
                        info.width = Some(*width);
                        info.height = Some(*height);
                    }
                    DocumentAttribute::Animated => info.kind = MediaKind::Animation,
                    DocumentAttribute::Sticker => info.kind = MediaKind::Sticker,
                }
            }
            Some(info)
        }
        Media::WebPage => None,
    }
}

/// Pick a file extension for a downloaded temp file: the original filename's
/// extension when present, otherwise a guess from the mime family.
pub fn default_extension(info: &MediaInfo) -> String {
    if let Some(name) = &info.filename {
        if let Some((_, ext)) = name.rsplit_once('.') {
            if !ext.is_empty() {
                return format!(".{ext}");
            }
        }
    }
    match info.mime_type.as_deref() {
        Some(mime) if mime.starts_with("video/") => ".mp4".to_string(),
        Some(mime) if mime.starts_with("audio/") => ".mp3".to_string(),
        Some(mime) => match mime.strip_prefix("image/") {
            Some(sub) if !sub.is_empty() => format!(".{sub}"),
            _ => String::new(),
        },
        None => String::new(),
    }
}

/// Group a batch of messages into albums. Messages sharing a `grouped_id`
/// form one group; everything else is a singleton. Groups come out ordered
/// by their lowest message id, members ascending.
pub fn group_by_album(messages: Vec<Message>) -> Vec<Vec<Message>> {
    let mut albums: BTreeMap<i64, Vec<Message>> = BTreeMap::new();
    let mut singles = Vec::new();

    for msg in messages {
        match msg.grouped_id {
            Some(gid) => albums.entry(gid).or_default().push(msg),
            None => singles.push(msg),
        }
    }

    let mut groups: Vec<Vec<Message>> = albums.into_values().collect();
    for group in &mut groups {
        group.sort_by_key(|m| m.id);
    }
    for single in singles {
        groups.push(vec![single]);
    }
    groups.sort_by_key(|g| g.first().map(|m| m.id).unwrap_or(i64::MAX));
    groups
}

pub fn format_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let bytes = bytes as f64;
    if bytes < KIB {
        format!("{bytes:.0} B")
    } else if bytes < KIB * KIB {
        format!("{:.1} KB", bytes / KIB)
    } else if bytes < KIB * KIB * KIB {
        format!("{:.1} MB", bytes / (KIB * KIB))
    } else {
        format!("{:.2} GB", bytes / (KIB * KIB * KIB))
    }
}

pub fn format_duration(seconds: u32) -> String {
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}
