//! HLS stream download via the external N_m3u8DL-RE binary.
//!
//! The tool is driven as a child process; progress is scraped from its
//! stdout, which repaints percentage lines in place.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

const DEFAULT_BINARY: &str = "N_m3u8DL-RE";
const BINARY_ENV: &str = "M3U8_BINARY_PATH";

/// Container extensions the tool may produce, in probe order.
const OUTPUT_EXTENSIONS: &[&str] = &["mp4", "mkv", "ts"];

static PROGRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("valid progress regex"));

/// Latest percentage mentioned in a chunk of tool output, if any.
fn parse_progress(chunk: &str) -> Option<f64> {
    PROGRESS_RE
        .captures_iter(chunk)
        .last()
        .and_then(|cap| cap[1].parse::<f64>().ok())
        .map(|p| p.clamp(0.0, 100.0))
}

/// Default save name for unnamed downloads.
pub fn default_filename() -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let uid = Uuid::new_v4().simple().to_string();
    format!("video_{stamp}_{}", &uid[..8])
}

pub struct M3u8Downloader {
    binary: String,
    save_dir: PathBuf,
    tool_temp_dir: PathBuf,
}

impl M3u8Downloader {
    /// `temp_dir` receives both the finished file and the tool's scratch
    /// space (in a subdirectory).
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        let binary =
            std::env::var(BINARY_ENV).unwrap_or_else(|_| DEFAULT_BINARY.to_string());
        Self::with_binary(binary, temp_dir)
    }

    pub fn with_binary(binary: impl Into<String>, temp_dir: impl Into<PathBuf>) -> Self {
        let save_dir = temp_dir.into();
        Self {
            binary: binary.into(),
            tool_temp_dir: save_dir.join("m3u8"),
            save_dir,
        }
    }

    /// Download `url` under `filename` (no extension). Reports progress in
    /// percent as the tool emits it; cancelling kills the child process.
    #[instrument(skip_all, fields(filename))]
    pub async fn download(
        &self,
        url: &str,
        filename: &str,
        progress: Option<&(dyn Fn(f64) + Send + Sync)>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.tool_temp_dir).await?;

        let mut child = Command::new(&self.binary)
            .arg(url)
            .arg("--save-name")
            .arg(filename)
            .arg("--save-dir")
            .arg(&self.save_dir)
            .arg("--tmp-dir")
            .arg(&self.tool_temp_dir)
            .arg("--auto-select")
            .arg("--log-level")
            .arg("INFO")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Config(format!("cannot launch {}: {e}", self.binary)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transient("downloader stdout unavailable".into()))?;

        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("download cancelled, killing child");
                    let _ = child.kill().await;
                    return Err(Error::Cancelled);
                }
                read = stdout.read(&mut buf) => {
                    match read? {
                        0 => break,
                        n => {
                            let chunk = String::from_utf8_lossy(&buf[..n]);
                            if let (Some(cb), Some(pct)) = (progress, parse_progress(&chunk)) {
                                cb(pct);
                            }
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(Error::Transient(format!(
                "downloader exited with {status}"
            )));
        }

        self.locate_output(filename).await
    }

    /// The tool picks the container itself; probe the known extensions.
    async fn locate_output(&self, filename: &str) -> Result<PathBuf> {
        for ext in OUTPUT_EXTENSIONS {
            let candidate = self.save_dir.join(format!("{filename}.{ext}"));
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                debug!(path = %candidate.display(), "located downloaded file");
                return Ok(candidate);
            }
        }
        Err(Error::NotFound(format!(
            "no output file for {filename} in {}",
            self.save_dir.display()
        )))
    }

    pub async fn cleanup(&self, path: &Path) {
        if let Err(err) = tokio::fs::remove_file(path).await {
            debug!(path = %path.display(), error = %err, "temp file cleanup failed");
        }
    }
}
