//! Background task manager for download-then-upload jobs.
//!
//! Each task runs on its own tokio task with a cancellation token; state and
//! progress are persisted so the CLI and API can observe tasks across
//! restarts. A global semaphore caps concurrent uploads regardless of how
//! many tasks are in flight.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::client::{ChatClient, FileSource, OutgoingFile};
use crate::config;
use crate::db::{self, Pool};
use crate::error::{Error, Result};
use crate::m3u8::{self, M3u8Downloader};
use crate::model::TaskStatus;
use crate::{resolve, upload};

pub const TASK_KIND_M3U8: &str = "m3u8";

/// Job parameters, stored as JSON in the task row so a task can be retried
/// after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct M3u8TaskDetails {
    pub url: String,
    /// Destination chat reference, resolved at upload time.
    pub dest: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

struct TaskHandle {
    join: JoinHandle<()>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct TaskManager {
    pool: Pool,
    client: Arc<dyn ChatClient>,
    upload: config::Upload,
    downloader: Arc<M3u8Downloader>,
    active: Arc<Mutex<HashMap<i64, TaskHandle>>>,
    upload_semaphore: Arc<Semaphore>,
}

fn mime_for_path(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    }
}

/// Debounced persisting progress callback: writes only when the integer
/// percent changes, off the hot path.
fn progress_writer(pool: Pool, task_id: i64) -> impl Fn(f64) + Send + Sync {
    let last = Arc::new(AtomicU64::new(u64::MAX));
    move |pct: f64| {
        let rounded = pct.clamp(0.0, 100.0) as u64;
        if last.swap(rounded, Ordering::Relaxed) != rounded {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _ = db::update_task(&pool, task_id, None, Some(rounded as f64), None, None)
                    .await;
            });
        }
    }
}

impl TaskManager {
    pub fn new(
        pool: Pool,
        client: Arc<dyn ChatClient>,
        upload: config::Upload,
        downloader: M3u8Downloader,
    ) -> Self {
        let upload = upload.normalized();
        Self {
            pool,
            client,
            upload,
            downloader: Arc::new(downloader),
            active: Arc::new(Mutex::new(HashMap::new())),
            upload_semaphore: Arc::new(Semaphore::new(upload.limit as usize)),
        }
    }

    /// Queue a stream download job; returns the persisted task id.
    #[instrument(skip_all)]
    pub async fn submit_m3u8(&self, details: M3u8TaskDetails) -> Result<i64> {
        if details.url.trim().is_empty() {
            return Err(Error::Validation("url must be non-empty".into()));
        }
        if details.dest.trim().is_empty() {
            return Err(Error::Validation("dest must be non-empty".into()));
        }
        let json = serde_json::to_string(&details)
            .map_err(|e| Error::Validation(format!("unserializable details: {e}")))?;
        let id = db::create_task(&self.pool, TASK_KIND_M3U8, &json).await?;
        self.spawn(id, details).await;
        info!(task_id = id, "m3u8 task submitted");
        Ok(id)
    }

    async fn spawn(&self, task_id: i64, details: M3u8TaskDetails) {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(self.clone().run(task_id, details, cancel.clone()));
        self.active
            .lock()
            .await
            .insert(task_id, TaskHandle { join, cancel });
    }

    async fn run(self, task_id: i64, details: M3u8TaskDetails, cancel: CancellationToken) {
        let outcome = self.run_inner(task_id, &details, &cancel).await;
        let update = match outcome {
            Ok(()) => {
                db::update_task(
                    &self.pool,
                    task_id,
                    Some(TaskStatus::Completed),
                    Some(100.0),
                    Some("done"),
                    None,
                )
                .await
            }
            Err(Error::Cancelled) => {
                db::update_task(
                    &self.pool,
                    task_id,
                    Some(TaskStatus::Cancelled),
                    None,
                    Some("cancelled"),
                    None,
                )
                .await
            }
            Err(err) => {
                warn!(task_id, error = %err, "task failed");
                db::update_task(
                    &self.pool,
                    task_id,
                    Some(TaskStatus::Failed),
                    None,
                    None,
                    Some(Some(&err.to_string())),
                )
                .await
            }
        };
        if let Err(err) = update {
            warn!(task_id, error = %err, "could not persist task state");
        }
        self.active.lock().await.remove(&task_id);
    }

    async fn run_inner(
        &self,
        task_id: i64,
        details: &M3u8TaskDetails,
        cancel: &CancellationToken,
    ) -> Result<()> {
        db::update_task(
            &self.pool,
            task_id,
            Some(TaskStatus::Running),
            Some(0.0),
            Some("downloading"),
            None,
        )
        .await?;

        let filename = details
            .filename
            .clone()
            .unwrap_or_else(m3u8::default_filename);
        let on_progress = progress_writer(self.pool.clone(), task_id);
        let path = self
            .downloader
            .download(&details.url, &filename, Some(&on_progress), cancel)
            .await?;

        let result = self.upload_and_send(task_id, &path, details, cancel).await;
        self.downloader.cleanup(&path).await;
        result
    }

    async fn upload_and_send(
        &self,
        task_id: i64,
        path: &Path,
        details: &M3u8TaskDetails,
        cancel: &CancellationToken,
    ) -> Result<()> {
        db::update_task(
            &self.pool,
            task_id,
            None,
            Some(0.0),
            Some("uploading"),
            None,
        )
        .await?;

        let target = resolve::resolve(self.client.as_ref(), &details.dest).await?;

        let _permit = self
            .upload_semaphore
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let on_progress = progress_writer(self.pool.clone(), task_id);
        let on_bytes = move |done: u64, total: u64| {
            if total > 0 {
                on_progress(done as f64 * 100.0 / total as f64);
            }
        };
        // A cancel arriving mid-upload aborts the part loop instead of
        // waiting for the whole file.
        let uploaded = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = upload::upload_file(
                self.client.as_ref(),
                path,
                self.upload.part_size_kb,
                self.upload.threads,
                Some(&on_bytes),
            ) => res?,
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut file = OutgoingFile::new(FileSource::Uploaded(uploaded));
        file.caption = details.caption.clone().unwrap_or_default();
        file.filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        file.mime_type = Some(mime_for_path(path).to_string());
        file.supports_streaming = true;
        self.client.send_file(&target, file).await?;
        Ok(())
    }

    /// Cancel a running task. Returns false when the task is not active.
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: i64) -> Result<bool> {
        let handle = self.active.lock().await.remove(&task_id);
        let Some(handle) = handle else {
            return Ok(false);
        };
        handle.cancel.cancel();
        // The task marks itself cancelled; a JoinError just means it was
        // already torn down.
        let _ = handle.join.await;
        if let Some(task) = db::get_task(&self.pool, task_id).await? {
            if !task.status.is_terminal() {
                db::update_task(
                    &self.pool,
                    task_id,
                    Some(TaskStatus::Cancelled),
                    None,
                    Some("cancelled"),
                    None,
                )
                .await?;
            }
        }
        Ok(true)
    }

    /// Re-run a failed or cancelled task with its stored parameters.
    #[instrument(skip(self))]
    pub async fn retry_task(&self, task_id: i64) -> Result<()> {
        let task = db::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        match task.status {
            TaskStatus::Failed | TaskStatus::Cancelled => {}
            TaskStatus::Completed => {
                return Err(Error::Validation("task already completed".into()))
            }
            _ => return Err(Error::Validation("task is still running".into())),
        }
        let details: M3u8TaskDetails = serde_json::from_str(&task.details)
            .map_err(|e| Error::Validation(format!("corrupt task details: {e}")))?;

        db::update_task(
            &self.pool,
            task_id,
            Some(TaskStatus::Pending),
            Some(0.0),
            Some("init"),
            Some(None),
        )
        .await?;
        self.spawn(task_id, details).await;
        Ok(())
    }

    /// Cancel (if running) and delete a task record.
    #[instrument(skip(self))]
    pub async fn delete_task(&self, task_id: i64) -> Result<bool> {
        self.cancel_task(task_id).await?;
        db::delete_task(&self.pool, task_id).await
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_round_trip_with_optional_fields() {
        let json = r#"{"url":"https://x/stream.m3u8","dest":"me"}"#;
        let details: M3u8TaskDetails = serde_json::from_str(json).unwrap();
        assert!(details.filename.is_none());
        assert!(details.caption.is_none());

        let full = M3u8TaskDetails {
            url: "https://x/s.m3u8".into(),
            dest: "-100123".into(),
            filename: Some("clip".into()),
            caption: Some("hi".into()),
        };
        let back: M3u8TaskDetails =
            serde_json::from_str(&serde_json::to_string(&full).unwrap()).unwrap();
        assert_eq!(back.filename.as_deref(), Some("clip"));
    }

    #[test]
    fn mime_detection_by_extension() {
        assert_eq!(mime_for_path(Path::new("a/b.mp4")), "video/mp4");
        assert_eq!(mime_for_path(Path::new("b.mkv")), "video/x-matroska");
        assert_eq!(mime_for_path(Path::new("c.ts")), "video/mp2t");
        assert_eq!(mime_for_path(Path::new("d.bin")), "application/octet-stream");
    }
}
