use anyhow::Result;
use gallery_downloader::config::RunConfig;
use gallery_downloader::engine::DownloadEngine;
use gallery_downloader::ledger::CsvLedger;
use gallery_downloader::queue::{build_queue, make_candidate};
use gallery_downloader::types::ItemStatus;
use img_parts::jpeg::Jpeg;
use img_parts::ImageEXIF;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn jpeg_fixture() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(16, 16, image::Rgb([200, 100, 50]));
    let mut buffer = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buffer, image::ImageFormat::Jpeg).unwrap();
    buffer.into_inner()
}

fn engine_config(dir: &std::path::Path, max_tries: u32) -> Arc<RunConfig> {
    Arc::new(RunConfig {
        out_dir: dir.join("photos"),
        log_file: dir.join("log.csv"),
        workers: 4,
        max_tries,
        backoff_base_ms: 10,
        ..RunConfig::default()
    })
}

/// One malformed item (terminal 404), one timing out twice then succeeding,
/// one immediately succeeding: 2 Success entries with embedded metadata,
/// 1 Failed entry recording the 404, attempts {1,3,1}.
#[tokio::test]
async fn mixed_outcomes_end_in_the_expected_ledger_state() -> Result<()> {
    let server = MockServer::start().await;
    let body = jpeg_fixture();

    Mock::given(method("GET"))
        .and(path("/media/bad/large"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    // First two attempts hit the 500 mock, the third falls through to 200.
    Mock::given(method("GET"))
        .and(path("/media/flaky/large"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/flaky/large"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/ok/large"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempdir()?;
    let config = engine_config(dir.path(), 3);
    let urls = [
        format!("{}/media/bad/large?u=2023-05-01T10:30:00", server.uri()),
        format!("{}/media/flaky/large?u=2023-05-01T10:30:00", server.uri()),
        format!("{}/media/ok/large", server.uri()),
    ];
    let queue = build_queue(
        urls.iter().map(|u| make_candidate(u)).collect(),
        &HashSet::new(),
    );

    let ledger = Arc::new(Mutex::new(CsvLedger::open(&config.log_file)));
    let engine = DownloadEngine::new(config.clone())?;
    let stats = engine
        .run(queue, ledger.clone(), CancellationToken::new())
        .await;

    assert_eq!(stats.total, 3);
    assert_eq!(stats.saved, 2);
    assert_eq!(stats.failed, 1);

    let ledger = ledger.lock().await;
    let bad = ledger.get("bad_large").unwrap();
    assert_eq!(bad.status, ItemStatus::Failed);
    assert_eq!(bad.attempts, 1);
    assert_eq!(bad.http_status, Some(404));
    assert!(bad.error.as_deref().unwrap().contains("404"));

    let flaky = ledger.get("flaky_large").unwrap();
    assert_eq!(flaky.status, ItemStatus::Success);
    assert_eq!(flaky.attempts, 3);

    let ok = ledger.get("ok_large").unwrap();
    assert_eq!(ok.status, ItemStatus::Success);
    assert_eq!(ok.attempts, 1);

    // Files exist only for successes, and never for the 404.
    assert!(config.out_dir.join("flaky_large.jpg").exists());
    assert!(config.out_dir.join("ok_large.jpg").exists());
    assert!(!config.out_dir.join("bad_large.jpg").exists());

    // The flaky item's URL carried a capture timestamp: it must be in EXIF.
    let saved = std::fs::read(config.out_dir.join("flaky_large.jpg"))?;
    let exif = Jpeg::from_bytes(saved.into())?.exif().expect("exif present");
    let needle = b"2023:05:01 10:30:00";
    assert!(exif.windows(needle.len()).any(|w| w == needle));

    // The ok item had no timestamp: EXIF carries GPS but no capture date.
    let saved = std::fs::read(config.out_dir.join("ok_large.jpg"))?;
    let exif = Jpeg::from_bytes(saved.into())?.exif().expect("exif present");
    assert!(!exif.windows(5).any(|w| w == b"2023:"));

    Ok(())
}

/// A 200 response whose body is not an image is terminal: failed on the
/// first attempt, and nothing lands at the final path.
#[tokio::test]
async fn invalid_payload_is_terminal_and_leaves_no_file() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/html/large"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("<html>not an image</html>"),
        )
        .mount(&server)
        .await;

    let dir = tempdir()?;
    let config = engine_config(dir.path(), 3);
    let queue = vec![make_candidate(&format!(
        "{}/media/html/large",
        server.uri()
    ))];
    let ledger = Arc::new(Mutex::new(CsvLedger::open(&config.log_file)));
    let engine = DownloadEngine::new(config.clone())?;
    let stats = engine
        .run(queue, ledger.clone(), CancellationToken::new())
        .await;

    assert_eq!(stats.failed, 1);
    let ledger = ledger.lock().await;
    let entry = ledger.get("html_large").unwrap();
    assert_eq!(entry.status, ItemStatus::Failed);
    assert_eq!(entry.attempts, 1);
    assert!(entry.error.as_deref().unwrap().contains("invalid payload"));
    assert!(!config.out_dir.join("html_large.jpg").exists());
    // a 200-with-garbage must not be retried
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    Ok(())
}

/// Transient failures stop at the configured attempt ceiling.
#[tokio::test]
async fn transient_failures_respect_the_attempt_ceiling() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/down/large"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let dir = tempdir()?;
    let config = engine_config(dir.path(), 3);
    let queue = vec![make_candidate(&format!(
        "{}/media/down/large",
        server.uri()
    ))];
    let ledger = Arc::new(Mutex::new(CsvLedger::open(&config.log_file)));
    let engine = DownloadEngine::new(config.clone())?;
    let stats = engine
        .run(queue, ledger.clone(), CancellationToken::new())
        .await;

    assert_eq!(stats.failed, 1);
    let ledger = ledger.lock().await;
    let entry = ledger.get("down_large").unwrap();
    assert_eq!(entry.attempts, 3);
    assert_eq!(entry.http_status, Some(502));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    Ok(())
}

/// Cancelling while transfers are live: the in-flight item finishes and
/// lands atomically, the item waiting out a backoff stops without a ledger
/// row, and no partial or temporary file survives under a final name.
#[tokio::test]
async fn cancellation_mid_run_leaves_no_partial_files() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/stuck/large"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/ok/large"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(jpeg_fixture())
                .set_delay(std::time::Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let dir = tempdir()?;
    // Long backoff so the stuck item is still waiting when we cancel.
    let config = Arc::new(RunConfig {
        out_dir: dir.path().join("photos"),
        log_file: dir.path().join("log.csv"),
        workers: 2,
        max_tries: 3,
        backoff_base_ms: 5_000,
        ..RunConfig::default()
    });
    let queue = vec![
        make_candidate(&format!("{}/media/stuck/large", server.uri())),
        make_candidate(&format!("{}/media/ok/large", server.uri())),
    ];
    let cancel = CancellationToken::new();
    let ledger = Arc::new(Mutex::new(CsvLedger::open(&config.log_file)));

    let run = tokio::spawn({
        let config = config.clone();
        let ledger = ledger.clone();
        let cancel = cancel.clone();
        async move {
            let engine = DownloadEngine::new(config)?;
            Ok::<_, gallery_downloader::error::DownloaderError>(
                engine.run(queue, ledger, cancel).await,
            )
        }
    });

    // Wait until both first attempts have reached the server, then cancel.
    for _ in 0..100 {
        if server.received_requests().await.unwrap().len() >= 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    cancel.cancel();
    let stats = run.await??;

    assert_eq!(stats.saved, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.failed, 0);

    // The completed transfer landed whole; the cancelled one left nothing,
    // not even a temp file, in the destination.
    assert!(config.out_dir.join("ok_large.jpg").exists());
    assert!(!config.out_dir.join("stuck_large.jpg").exists());
    let names: Vec<String> = std::fs::read_dir(&config.out_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["ok_large.jpg".to_string()]);

    // Only the saved item is in the ledger; the cancelled one stays pending.
    let ledger = ledger.lock().await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger.get("ok_large").unwrap().status, ItemStatus::Success);
    assert!(ledger.get("stuck_large").is_none());

    Ok(())
}

/// A cancelled run issues no transfers and leaves no files or ledger rows,
/// so a later run can resume cleanly.
#[tokio::test]
async fn cancellation_leaves_a_resumable_state() -> Result<()> {
    let server = MockServer::start().await;
    let dir = tempdir()?;
    let config = engine_config(dir.path(), 3);
    let queue = vec![
        make_candidate(&format!("{}/media/a/large", server.uri())),
        make_candidate(&format!("{}/media/b/large", server.uri())),
    ];
    let cancel = CancellationToken::new();
    cancel.cancel();

    let ledger = Arc::new(Mutex::new(CsvLedger::open(&config.log_file)));
    let engine = DownloadEngine::new(config.clone())?;
    let stats = engine.run(queue, ledger.clone(), cancel).await;

    assert_eq!(stats.cancelled, 2);
    assert_eq!(stats.saved, 0);
    assert_eq!(stats.failed, 0);
    assert!(ledger.lock().await.is_empty());
    assert!(server.received_requests().await.unwrap().is_empty());
    assert!(!config.log_file.exists());

    Ok(())
}
