use crate::config::RunConfig;
use crate::error::Result;
use crate::exif;
use crate::ledger::CsvLedger;
use crate::queue::filename_for;
use crate::types::{
    DownloadTask, ImageKind, ItemStatus, LedgerEntry, MediaCandidate, PayloadCheck, RunStats,
};
use chrono::Utc;
use rand::Rng;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Per-attempt outcome classification.
///
/// Transient failures are worth another attempt after backoff; terminal
/// failures are recorded immediately because retrying cannot help.
enum AttemptOutcome {
    Success {
        bytes: Vec<u8>,
        http_status: u16,
    },
    Transient {
        http_status: Option<u16>,
        error: String,
    },
    Terminal {
        http_status: Option<u16>,
        error: String,
    },
}

/// What a worker reports back for one queue item.
enum ItemOutcome {
    Saved,
    Failed,
    Cancelled,
}

/// Bounded-concurrency transfer engine.
///
/// Workers share one pooled HTTP client; the semaphore is the backpressure
/// mechanism toward the remote service. Item failures never abort the run.
pub struct DownloadEngine {
    client: reqwest::Client,
    config: Arc<RunConfig>,
}

impl DownloadEngine {
    pub fn new(config: Arc<RunConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(config.workers.max(1))
            .build()?;
        Ok(Self { client, config })
    }

    /// Drains the queue with a bounded worker pool, recording one terminal
    /// ledger row per item. Cancellation stops issuing new transfers and
    /// aborts pending backoff waits; no partial file ever lands under a
    /// final name.
    pub async fn run(
        &self,
        queue: Vec<MediaCandidate>,
        ledger: Arc<Mutex<CsvLedger>>,
        cancel: CancellationToken,
    ) -> RunStats {
        let mut stats = RunStats {
            total: queue.len(),
            ..Default::default()
        };
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut handles = Vec::with_capacity(queue.len());

        for candidate in queue {
            if cancel.is_cancelled() {
                stats.cancelled += 1;
                continue;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let client = self.client.clone();
            let config = self.config.clone();
            let ledger = ledger.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                process_item(client, config, candidate, ledger, cancel).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(ItemOutcome::Saved) => stats.saved += 1,
                Ok(ItemOutcome::Failed) => stats.failed += 1,
                Ok(ItemOutcome::Cancelled) => stats.cancelled += 1,
                Err(e) => {
                    error!("Download worker panicked: {}", e);
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}

#[instrument(skip_all, fields(id = %candidate.canonical_id))]
async fn process_item(
    client: reqwest::Client,
    config: Arc<RunConfig>,
    candidate: MediaCandidate,
    ledger: Arc<Mutex<CsvLedger>>,
    cancel: CancellationToken,
) -> ItemOutcome {
    let mut task = DownloadTask {
        local_path: config.out_dir.join(filename_for(&candidate.canonical_id)),
        candidate,
        attempt_count: 0,
        last_error: None,
    };

    loop {
        if cancel.is_cancelled() {
            debug!("Cancelled before attempt {}", task.attempt_count + 1);
            return ItemOutcome::Cancelled;
        }
        task.attempt_count += 1;

        match attempt_fetch(&client, &task.candidate.source_url).await {
            AttemptOutcome::Success { bytes, http_status } => {
                let warning = match finalize(&config, &task, bytes) {
                    Ok(warning) => warning,
                    Err(e) => {
                        // Disk trouble is terminal for this item; the run goes on.
                        record(&ledger, &task, ItemStatus::Failed, Some(http_status), Some(e.to_string())).await;
                        return ItemOutcome::Failed;
                    }
                };
                info!(
                    "Saved {} after {} attempt(s)",
                    task.local_path.display(),
                    task.attempt_count
                );
                record(&ledger, &task, ItemStatus::Success, Some(http_status), warning).await;
                return ItemOutcome::Saved;
            }
            AttemptOutcome::Terminal { http_status, error } => {
                warn!("Terminal failure: {}", error);
                record(&ledger, &task, ItemStatus::Failed, http_status, Some(error)).await;
                return ItemOutcome::Failed;
            }
            AttemptOutcome::Transient { http_status, error } => {
                task.last_error = Some(error.clone());
                if task.attempt_count >= config.max_tries {
                    warn!(
                        "Giving up after {} attempts: {}",
                        task.attempt_count, error
                    );
                    record(&ledger, &task, ItemStatus::Failed, http_status, Some(error)).await;
                    return ItemOutcome::Failed;
                }
                let delay = backoff_delay(config.backoff_base_ms, task.attempt_count);
                debug!(
                    "Transient failure ({}), retrying in {:?}",
                    error, delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return ItemOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Issues one GET and classifies the result.
async fn attempt_fetch(client: &reqwest::Client, url: &str) -> AttemptOutcome {
    let response = match client.get(url).send().await {
        Ok(response) => response,
        // Connect errors and timeouts are all worth retrying.
        Err(e) => {
            return AttemptOutcome::Transient {
                http_status: None,
                error: e.to_string(),
            }
        }
    };
    let status = response.status();
    let code = status.as_u16();
    if status.is_success() {
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                return AttemptOutcome::Transient {
                    http_status: Some(code),
                    error: format!("body read failed: {}", e),
                }
            }
        };
        return match check_payload(&bytes) {
            PayloadCheck::ValidImage(_) => AttemptOutcome::Success {
                bytes,
                http_status: code,
            },
            PayloadCheck::InvalidPayload(reason) => AttemptOutcome::Terminal {
                http_status: Some(code),
                error: format!("invalid payload: {}", reason),
            },
        };
    }
    if status.is_server_error() || code == 429 {
        AttemptOutcome::Transient {
            http_status: Some(code),
            error: format!("HTTP {}", code),
        }
    } else {
        AttemptOutcome::Terminal {
            http_status: Some(code),
            error: format!("HTTP {}", code),
        }
    }
}

/// Explicit validation step: fetched bytes are only "an image" once the
/// decoder agrees.
pub fn check_payload(bytes: &[u8]) -> PayloadCheck {
    if bytes.is_empty() {
        return PayloadCheck::InvalidPayload("empty body".to_string());
    }
    let reader = match image::ImageReader::new(std::io::Cursor::new(bytes)).with_guessed_format() {
        Ok(reader) => reader,
        Err(e) => return PayloadCheck::InvalidPayload(e.to_string()),
    };
    let format = reader.format();
    match reader.decode() {
        Ok(_) => PayloadCheck::ValidImage(match format {
            Some(image::ImageFormat::Jpeg) => ImageKind::Jpeg,
            Some(image::ImageFormat::Png) => ImageKind::Png,
            Some(other) => ImageKind::Other(format!("{:?}", other)),
            None => ImageKind::Other("unknown".to_string()),
        }),
        Err(e) => PayloadCheck::InvalidPayload(e.to_string()),
    }
}

/// Writes the payload to a temp file in the destination directory, embeds
/// metadata, and atomically renames into place. Returns an embed warning
/// when metadata could not be written; the transfer still counts as a
/// success in that case.
fn finalize(config: &RunConfig, task: &DownloadTask, bytes: Vec<u8>) -> Result<Option<String>> {
    let mut data = bytes;
    let mut warning = None;

    if !config.skip_exif {
        match exif::embed_exif(
            &data,
            task.candidate.embedded_timestamp,
            config.latitude,
            config.longitude,
        ) {
            Ok(tagged) => data = tagged,
            Err(e) => {
                warn!("EXIF embed failed for {}: {}", task.candidate.canonical_id, e);
                warning = Some(format!("exif embed failed: {}", e));
            }
        }
    }

    std::fs::create_dir_all(&config.out_dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&config.out_dir)?;
    tmp.write_all(&data)?;
    let file = tmp.persist(&task.local_path).map_err(|e| e.error)?;

    // Mirror the capture time onto the filesystem; best-effort.
    if let Some(ts) = task.candidate.embedded_timestamp {
        let system_time = std::time::UNIX_EPOCH
            + Duration::from_secs(ts.and_utc().timestamp().max(0) as u64);
        let _ = file.set_modified(system_time);
    }
    Ok(warning)
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = 1u64 << attempt.min(5);
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms * exp + jitter)
}

async fn record(
    ledger: &Arc<Mutex<CsvLedger>>,
    task: &DownloadTask,
    status: ItemStatus,
    http_status: Option<u16>,
    error: Option<String>,
) {
    let entry = LedgerEntry {
        recorded_at: Utc::now(),
        status,
        attempts: task.attempt_count,
        http_status,
        canonical_id: task.candidate.canonical_id.clone(),
        filename: task
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        url: task.candidate.source_url.clone(),
        error,
    };
    let mut ledger = ledger.lock().await;
    if let Err(e) = ledger.upsert(entry) {
        warn!(
            "Failed to record outcome for {}: {}",
            task.candidate.canonical_id, e
        );
    }
}
