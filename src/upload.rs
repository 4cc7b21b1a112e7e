//! Parallel chunked file upload.
//!
//! The file is cut into fixed-size parts and pushed through
//! [`ChatClient::save_file_part`] by a bounded set of workers. Files at or
//! below the big-file threshold use the small-file protocol, which needs a
//! whole-file md5; larger files skip the checksum.

use std::path::Path;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument};

use crate::client::{ChatClient, UploadedFile};
use crate::error::{Error, Result};

/// Protocol cap on the number of parts per file.
pub const MAX_PARTS: usize = 4000;

/// Above this size the big-file protocol applies and no md5 is sent.
pub const BIG_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Validate the part layout for a file of `size` bytes.
/// Returns `(part_size, total_parts, big)`.
fn plan_parts(size: u64, part_size_kb: u32) -> Result<(u64, usize, bool)> {
    if size == 0 {
        return Err(Error::Validation("cannot upload an empty file".into()));
    }
    let part_size = u64::from(part_size_kb.max(1)) * 1024;
    let total_parts = size.div_ceil(part_size) as usize;
    if total_parts > MAX_PARTS {
        return Err(Error::Validation(format!(
            "file needs {total_parts} parts, the protocol caps at {MAX_PARTS}; \
             increase the part size"
        )));
    }
    Ok((part_size, total_parts, size > BIG_FILE_THRESHOLD))
}

/// Upload `path` in parallel parts. `workers` bounds concurrent part sends;
/// `progress` receives `(bytes_done, bytes_total)` as parts complete.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn upload_file(
    client: &dyn ChatClient,
    path: &Path,
    part_size_kb: u32,
    workers: u32,
    progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
) -> Result<UploadedFile> {
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(Error::Validation(format!(
            "not a file: {}",
            path.display()
        )));
    }
    let size = meta.len();
    let (part_size, total_parts, big) = plan_parts(size, part_size_kb)?;

    let file_id: i64 = rand::thread_rng().gen();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    debug!(size, total_parts, big, "starting chunked upload");

    let workers = workers.max(1) as usize;
    let semaphore = Arc::new(Semaphore::new(workers));
    let bytes_done = Arc::new(Mutex::new(0u64));
    // Keep roughly two batches in flight so readers stay ahead of senders
    // without buffering the whole file.
    let max_in_flight = workers * 2;

    let mut file = tokio::fs::File::open(path).await?;
    let mut md5_ctx = (!big).then(md5::Context::new);
    let mut in_flight = FuturesUnordered::new();
    let mut remaining = size;
    let mut index = 0usize;

    while remaining > 0 {
        let chunk_len = remaining.min(part_size) as usize;
        let mut buf = vec![0u8; chunk_len];
        file.read_exact(&mut buf).await?;
        if let Some(ctx) = md5_ctx.as_mut() {
            ctx.consume(&buf);
        }
        remaining -= chunk_len as u64;

        let semaphore = Arc::clone(&semaphore);
        let bytes_done = Arc::clone(&bytes_done);
        in_flight.push(async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| Error::Cancelled)?;
            client
                .save_file_part(file_id, index, total_parts, buf, big)
                .await?;
            let mut done = bytes_done.lock().await;
            *done += chunk_len as u64;
            Ok::<u64, Error>(*done)
        });
        index += 1;

        // Fail fast: a part error aborts before reading further.
        while in_flight.len() >= max_in_flight {
            match in_flight.next().await {
                Some(Ok(done)) => {
                    if let Some(cb) = progress {
                        cb(done, size);
                    }
                }
                Some(Err(err)) => return Err(err),
                None => break,
            }
        }
    }

    while let Some(res) = in_flight.next().await {
        let done = res?;
        if let Some(cb) = progress {
            cb(done, size);
        }
    }

    Ok(UploadedFile {
        file_id,
        parts: total_parts,
        name,
        md5: md5_ctx.map(|ctx| format!("{:x}", ctx.compute())),
        big,
    })
}
