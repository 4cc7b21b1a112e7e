use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;

use super::Pool;
use crate::error::Result;
use crate::model::{ForwardMode, Rule, SyncState, TaskRecord, TaskStatus};

fn rule_from_row(row: &SqliteRow) -> Rule {
    let mode: String = row.get("mode");
    Rule {
        id: row.get("id"),
        name: row.get("name"),
        source_chat: row.get("source_chat"),
        target_chat: row.get("target_chat"),
        mode: ForwardMode::parse(&mode).unwrap_or(ForwardMode::Clone),
        interval_minutes: row.get("interval_minutes"),
        enabled: row.get::<i64, _>("enabled") != 0,
        filter_spec: row.get("filter_spec"),
        note: row.get("note"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all)]
pub async fn create_rule(
    pool: &Pool,
    name: &str,
    source_chat: &str,
    target_chat: &str,
    mode: ForwardMode,
    interval_minutes: i64,
    filter_spec: Option<&str>,
    note: Option<&str>,
) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO rules (name, source_chat, target_chat, mode, interval_minutes, enabled, filter_spec, note, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(source_chat)
    .bind(target_chat)
    .bind(mode.as_str())
    .bind(interval_minutes)
    .bind(filter_spec)
    .bind(note)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn get_rule(pool: &Pool, name: &str) -> Result<Option<Rule>> {
    let row = sqlx::query("SELECT * FROM rules WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(rule_from_row))
}

#[instrument(skip_all)]
pub async fn get_rule_by_id(pool: &Pool, id: i64) -> Result<Option<Rule>> {
    let row = sqlx::query("SELECT * FROM rules WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(rule_from_row))
}

#[instrument(skip_all)]
pub async fn get_all_rules(pool: &Pool, enabled_only: bool) -> Result<Vec<Rule>> {
    let sql = if enabled_only {
        "SELECT * FROM rules WHERE enabled = 1 ORDER BY id"
    } else {
        "SELECT * FROM rules ORDER BY id"
    };
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    Ok(rows.iter().map(rule_from_row).collect())
}

#[instrument(skip_all)]
pub async fn set_rule_enabled(pool: &Pool, name: &str, enabled: bool) -> Result<bool> {
    let res = sqlx::query("UPDATE rules SET enabled = ?, updated_at = ? WHERE name = ?")
        .bind(enabled as i64)
        .bind(Utc::now())
        .bind(name)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn set_rule_filter(pool: &Pool, name: &str, filter_spec: Option<&str>) -> Result<bool> {
    let res = sqlx::query("UPDATE rules SET filter_spec = ?, updated_at = ? WHERE name = ?")
        .bind(filter_spec)
        .bind(Utc::now())
        .bind(name)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn set_rule_note(pool: &Pool, name: &str, note: Option<&str>) -> Result<bool> {
    let res = sqlx::query("UPDATE rules SET note = ?, updated_at = ? WHERE name = ?")
        .bind(note)
        .bind(Utc::now())
        .bind(name)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn delete_rule(pool: &Pool, name: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM rules WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn get_state(pool: &Pool, rule_id: i64, namespace: &str) -> Result<Option<SyncState>> {
    let row = sqlx::query("SELECT * FROM state WHERE rule_id = ? AND namespace = ?")
        .bind(rule_id)
        .bind(namespace)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| SyncState {
        rule_id: row.get("rule_id"),
        namespace: row.get("namespace"),
        last_msg_id: row.get("last_msg_id"),
        last_sync_at: row.get::<Option<DateTime<Utc>>, _>("last_sync_at"),
        total_forwarded: row.get("total_forwarded"),
    }))
}

/// Upsert sync state. The cursor only advances: the stored `last_msg_id`
/// becomes `max(existing, last_msg_id)`.
#[instrument(skip_all)]
pub async fn update_state(
    pool: &Pool,
    rule_id: i64,
    namespace: &str,
    last_msg_id: i64,
    increment_forwarded: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO state (rule_id, namespace, last_msg_id, last_sync_at, total_forwarded) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (rule_id, namespace) DO UPDATE SET \
           last_msg_id = MAX(state.last_msg_id, excluded.last_msg_id), \
           last_sync_at = excluded.last_sync_at, \
           total_forwarded = state.total_forwarded + excluded.total_forwarded",
    )
    .bind(rule_id)
    .bind(namespace)
    .bind(last_msg_id)
    .bind(Utc::now())
    .bind(increment_forwarded)
    .execute(pool)
    .await?;
    Ok(())
}

fn task_from_row(row: &SqliteRow) -> TaskRecord {
    let status: String = row.get("status");
    TaskRecord {
        id: row.get("id"),
        kind: row.get("kind"),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        progress: row.get("progress"),
        stage: row.get("stage"),
        details: row.get("details"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[instrument(skip_all)]
pub async fn create_task(pool: &Pool, kind: &str, details: &str) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO tasks (kind, status, progress, stage, details, created_at, updated_at) \
         VALUES (?, 'pending', 0, 'init', ?, ?, ?) RETURNING id",
    )
    .bind(kind)
    .bind(details)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn get_task(pool: &Pool, id: i64) -> Result<Option<TaskRecord>> {
    let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(task_from_row))
}

#[instrument(skip_all)]
pub async fn list_tasks(pool: &Pool) -> Result<Vec<TaskRecord>> {
    let rows = sqlx::query("SELECT * FROM tasks ORDER BY id DESC")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(task_from_row).collect())
}

/// Partial update of a task record; `None` fields are left untouched.
/// `error` uses a double option so callers can explicitly clear it on retry.
#[instrument(skip_all)]
pub async fn update_task(
    pool: &Pool,
    id: i64,
    status: Option<TaskStatus>,
    progress: Option<f64>,
    stage: Option<&str>,
    error: Option<Option<&str>>,
) -> Result<()> {
    let mut sets = vec!["updated_at = ?".to_string()];
    if status.is_some() {
        sets.push("status = ?".to_string());
    }
    if progress.is_some() {
        sets.push("progress = ?".to_string());
    }
    if stage.is_some() {
        sets.push("stage = ?".to_string());
    }
    if error.is_some() {
        sets.push("error = ?".to_string());
    }

    let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
    let mut query = sqlx::query(&sql).bind(Utc::now());
    if let Some(status) = status {
        query = query.bind(status.as_str());
    }
    if let Some(progress) = progress {
        query = query.bind(progress.clamp(0.0, 100.0));
    }
    if let Some(stage) = stage {
        query = query.bind(stage);
    }
    if let Some(error) = error {
        query = query.bind(error);
    }
    query.bind(id).execute(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_task(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn get_setting(pool: &Pool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

#[instrument(skip_all)]
pub async fn set_setting(pool: &Pool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}
