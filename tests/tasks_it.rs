mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{memory_pool, write_script, FakeClient, Sent, SentSource};
use tempfile::tempdir;

use tg_forward::config::Upload;
use tg_forward::db::{self, Pool};
use tg_forward::error::Error;
use tg_forward::m3u8::M3u8Downloader;
use tg_forward::model::{TaskRecord, TaskStatus};
use tg_forward::tasks::{M3u8TaskDetails, TaskManager};
use tg_forward::upload::{upload_file, BIG_FILE_THRESHOLD};

fn upload_settings() -> Upload {
    Upload {
        threads: 2,
        limit: 2,
        part_size_kb: 1,
    }
}

#[tokio::test]
async fn chunked_upload_respects_the_worker_bound() {
    let client = FakeClient::new();
    let td = tempdir().unwrap();
    let path = td.path().join("payload.bin");
    tokio::fs::write(&path, vec![7u8; 10 * 1024]).await.unwrap();

    let seen = Mutex::new(Vec::new());
    let progress = |done: u64, total: u64| {
        seen.lock().unwrap().push((done, total));
    };
    let uploaded = upload_file(&client, &path, 1, 2, Some(&progress))
        .await
        .unwrap();

    assert_eq!(uploaded.parts, 10);
    assert!(!uploaded.big);
    assert!(uploaded.md5.is_some());
    assert_eq!(uploaded.name, "payload.bin");
    assert!(client.max_upload_concurrency() <= 2);

    let parts = client.parts.lock().unwrap().clone();
    assert_eq!(parts.len(), 10);
    assert!(parts.iter().all(|&(_, total, big)| total == 10 && !big));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.last().copied(), Some((10 * 1024, 10 * 1024)));
}

#[tokio::test]
async fn big_files_skip_the_checksum() {
    let client = FakeClient::new();
    let td = tempdir().unwrap();
    let path = td.path().join("big.bin");
    tokio::fs::write(&path, vec![0u8; (BIG_FILE_THRESHOLD + 1) as usize])
        .await
        .unwrap();

    let uploaded = upload_file(&client, &path, 512, 4, None).await.unwrap();
    assert!(uploaded.big);
    assert!(uploaded.md5.is_none());
    assert_eq!(uploaded.parts, 21);
}

#[tokio::test]
async fn empty_file_is_rejected_before_any_part_is_sent() {
    let client = FakeClient::new();
    let td = tempdir().unwrap();
    let path = td.path().join("empty.bin");
    tokio::fs::write(&path, b"").await.unwrap();

    let err = upload_file(&client, &path, 1, 2, None).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(client.parts.lock().unwrap().is_empty());
}

async fn wait_terminal(pool: &Pool, task_id: i64) -> TaskRecord {
    for _ in 0..200 {
        if let Some(task) = db::get_task(pool, task_id).await.unwrap() {
            if task.status.is_terminal() {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {task_id} did not reach a terminal state");
}

fn details(url: &str) -> M3u8TaskDetails {
    M3u8TaskDetails {
        url: url.into(),
        dest: "me".into(),
        filename: Some("clip".into()),
        caption: Some("from stream".into()),
    }
}

#[tokio::test]
async fn m3u8_task_downloads_uploads_and_completes() {
    let client = Arc::new(FakeClient::new());
    let pool = memory_pool().await;
    let td = tempdir().unwrap();

    let script = write_script(
        td.path(),
        "fake-dl.sh",
        "#!/bin/sh\necho \"42.0%\"\nprintf 'streamdata' > \"$5/$3.mp4\"\necho \"100.0%\"\n",
    );
    let downloader = M3u8Downloader::with_binary(script.to_string_lossy(), td.path());
    let manager = TaskManager::new(pool.clone(), client.clone(), upload_settings(), downloader);

    let id = manager
        .submit_m3u8(details("https://example.com/stream.m3u8"))
        .await
        .unwrap();
    let task = wait_terminal(&pool, id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.stage, "done");
    assert!((task.progress - 100.0).abs() < f64::EPSILON);
    assert!(task.error.is_none());

    let sent = client.sent();
    match sent.last().unwrap() {
        Sent::File {
            chat_id,
            source,
            caption,
            filename,
        } => {
            assert_eq!(*chat_id, 1);
            assert_eq!(*source, SentSource::Uploaded);
            assert_eq!(caption, "from stream");
            assert_eq!(filename.as_deref(), Some("clip.mp4"));
        }
        other => panic!("unexpected send: {other:?}"),
    }
    assert!(!client.parts.lock().unwrap().is_empty());
    // Temp file is cleaned up after the send.
    assert!(!td.path().join("clip.mp4").exists());
    assert_eq!(manager.active_count().await, 0);
}

#[tokio::test]
async fn global_limit_caps_concurrent_uploads_across_tasks() {
    let client = Arc::new(FakeClient::new());
    let pool = memory_pool().await;
    let td = tempdir().unwrap();

    let script = write_script(
        td.path(),
        "chunky-dl.sh",
        "#!/bin/sh\nhead -c 8192 /dev/zero > \"$5/$3.mp4\"\necho \"100.0%\"\n",
    );
    let settings = Upload {
        threads: 4,
        limit: 1,
        part_size_kb: 1,
    };
    let downloader = M3u8Downloader::with_binary(script.to_string_lossy(), td.path());
    let manager = TaskManager::new(pool.clone(), client.clone(), settings, downloader);

    let mut ids = Vec::new();
    for i in 0..3 {
        let mut d = details("https://example.com/s.m3u8");
        d.filename = Some(format!("clip{i}"));
        ids.push(manager.submit_m3u8(d).await.unwrap());
    }
    for id in ids {
        let task = wait_terminal(&pool, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
    }

    // With one upload slot, part concurrency never exceeds one task's
    // worker count even though three tasks ran.
    assert!(client.max_upload_concurrency() <= 4);
    assert_eq!(client.parts.lock().unwrap().len(), 3 * 8);
}

#[tokio::test]
async fn running_task_can_be_cancelled() {
    let client = Arc::new(FakeClient::new());
    let pool = memory_pool().await;
    let td = tempdir().unwrap();

    let script = write_script(
        td.path(),
        "slow-dl.sh",
        "#!/bin/sh\necho \"5.0%\"\nsleep 30\n",
    );
    let downloader = M3u8Downloader::with_binary(script.to_string_lossy(), td.path());
    let manager = TaskManager::new(pool.clone(), client.clone(), upload_settings(), downloader);

    let id = manager
        .submit_m3u8(details("https://example.com/slow.m3u8"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(manager.cancel_task(id).await.unwrap());
    let task = wait_terminal(&pool, id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(client.sent().is_empty());
    assert_eq!(manager.active_count().await, 0);
}

#[tokio::test]
async fn cancel_during_upload_stops_the_task() {
    let client = Arc::new(FakeClient::new());
    let pool = memory_pool().await;
    let td = tempdir().unwrap();

    // Instant download of a file whose 200-part upload takes a while.
    let script = write_script(
        td.path(),
        "bulk-dl.sh",
        "#!/bin/sh\nhead -c 204800 /dev/zero > \"$5/$3.mp4\"\necho \"100.0%\"\n",
    );
    let downloader = M3u8Downloader::with_binary(script.to_string_lossy(), td.path());
    let manager = TaskManager::new(pool.clone(), client.clone(), upload_settings(), downloader);

    let id = manager
        .submit_m3u8(details("https://example.com/bulk.m3u8"))
        .await
        .unwrap();

    // Wait until parts are actually flowing, then cancel mid-upload.
    for _ in 0..200 {
        if !client.parts.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!client.parts.lock().unwrap().is_empty());

    assert!(manager.cancel_task(id).await.unwrap());
    let task = wait_terminal(&pool, id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(client.sent().is_empty());
    assert!(client.parts.lock().unwrap().len() < 200);
    assert_eq!(manager.active_count().await, 0);
}

#[tokio::test]
async fn failed_task_can_be_retried_with_stored_details() {
    let client = Arc::new(FakeClient::new());
    let pool = memory_pool().await;
    let td = tempdir().unwrap();

    let downloader =
        M3u8Downloader::with_binary(td.path().join("missing-binary").to_string_lossy(), td.path());
    let manager = TaskManager::new(pool.clone(), client.clone(), upload_settings(), downloader);

    let id = manager
        .submit_m3u8(details("https://example.com/s.m3u8"))
        .await
        .unwrap();
    let task = wait_terminal(&pool, id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap().contains("cannot launch"));

    manager.retry_task(id).await.unwrap();
    let task = wait_terminal(&pool, id).await;
    assert_eq!(task.status, TaskStatus::Failed);
}

#[tokio::test]
async fn retry_and_cancel_edge_cases() {
    let client = Arc::new(FakeClient::new());
    let pool = memory_pool().await;
    let td = tempdir().unwrap();

    let downloader = M3u8Downloader::with_binary("unused", td.path());
    let manager = TaskManager::new(pool.clone(), client.clone(), upload_settings(), downloader);

    // Unknown ids.
    assert!(!manager.cancel_task(12345).await.unwrap());
    assert!(matches!(
        manager.retry_task(12345).await.unwrap_err(),
        Error::NotFound(_)
    ));

    // Completed tasks are not retryable.
    let id = db::create_task(&pool, "m3u8", "{\"url\":\"u\",\"dest\":\"me\"}")
        .await
        .unwrap();
    db::update_task(&pool, id, Some(TaskStatus::Completed), Some(100.0), None, None)
        .await
        .unwrap();
    assert!(matches!(
        manager.retry_task(id).await.unwrap_err(),
        Error::Validation(_)
    ));

    // Delete cancels (a no-op here) and removes the row.
    assert!(manager.delete_task(id).await.unwrap());
    assert!(db::get_task(&pool, id).await.unwrap().is_none());
}

#[tokio::test]
async fn submit_rejects_blank_parameters() {
    let client = Arc::new(FakeClient::new());
    let pool = memory_pool().await;
    let td = tempdir().unwrap();
    let downloader = M3u8Downloader::with_binary("unused", td.path());
    let manager = TaskManager::new(pool.clone(), client.clone(), upload_settings(), downloader);

    let mut blank_url = details("  ");
    blank_url.url = "  ".into();
    assert!(matches!(
        manager.submit_m3u8(blank_url).await.unwrap_err(),
        Error::Validation(_)
    ));

    let mut blank_dest = details("https://x/s.m3u8");
    blank_dest.dest = "".into();
    assert!(matches!(
        manager.submit_m3u8(blank_dest).await.unwrap_err(),
        Error::Validation(_)
    ));
}
