//! Chat reference resolution.
//!
//! References come in three shapes: the literal "me", a numeric id in any of
//! the formats users paste (bare, bot-API `-100` prefixed, or positive copies
//! of channel ids), and usernames/links. Numeric resolution tries the cheap
//! direct lookups first and falls back to a bounded dialog scan.

use tracing::{debug, instrument};

use crate::client::ChatClient;
use crate::error::{Error, Result};
use crate::model::ChatHandle;

const DIALOG_SCAN_LIMIT: usize = 500;

#[instrument(skip(client))]
pub async fn resolve(client: &dyn ChatClient, reference: &str) -> Result<ChatHandle> {
    let reference = reference.trim();
    if reference.eq_ignore_ascii_case("me") {
        return client.get_me().await;
    }

    let numeric = reference
        .strip_prefix('-')
        .unwrap_or(reference)
        .chars()
        .all(|c| c.is_ascii_digit())
        && !reference.is_empty();
    if numeric {
        if let Ok(id) = reference.parse::<i64>() {
            return resolve_numeric(client, id, reference).await;
        }
    }

    client.get_chat_by_name(reference).await
}

async fn resolve_numeric(
    client: &dyn ChatClient,
    id: i64,
    original: &str,
) -> Result<ChatHandle> {
    // As given.
    if let Ok(chat) = client.get_chat(id).await {
        return Ok(chat);
    }

    if id > 0 {
        // Positive copy of a channel id, try the bot-API form.
        if let Ok(with_prefix) = format!("-100{id}").parse::<i64>() {
            if let Ok(chat) = client.get_chat(with_prefix).await {
                debug!(id, resolved = with_prefix, "resolved via -100 prefix");
                return Ok(chat);
            }
        }
    } else if let Ok(chat) = client.get_chat(-id).await {
        debug!(id, resolved = -id, "resolved via sign flip");
        return Ok(chat);
    }

    scan_dialogs(client, id, original).await
}

async fn scan_dialogs(client: &dyn ChatClient, id: i64, original: &str) -> Result<ChatHandle> {
    let stripped = original
        .strip_prefix("-100")
        .and_then(|s| s.parse::<i64>().ok());
    // A positive bare id may be stored under its bot-API form.
    let prefixed = (id > 0)
        .then(|| format!("-100{id}").parse::<i64>().ok())
        .flatten();

    let dialogs = client.list_dialogs(DIALOG_SCAN_LIMIT).await?;
    for dialog in dialogs {
        if dialog.id == id
            || dialog.id == id.abs()
            || Some(dialog.id) == stripped
            || Some(dialog.id) == prefixed
        {
            debug!(id, found = dialog.id, "resolved via dialog scan");
            return Ok(dialog);
        }
    }
    Err(Error::NotFound(format!("chat not found: {original}")))
}
