use crate::config::RunConfig;
use crate::engine::DownloadEngine;
use crate::error::{DownloaderError, Result};
use crate::ledger::CsvLedger;
use crate::queue::{build_queue, make_candidate};
use crate::session::GallerySession;
use crate::types::{MediaCandidate, RunStats};
use std::io::Write as _;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// How this invocation sources its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Extract from the gallery session, then download.
    Fresh,
    /// Skip extraction; re-queue only the ledger's Failed set.
    RetryFailed,
}

/// The single synchronous decision point for the end-of-run retry.
/// Injected so tests can stub it instead of reading a console.
pub trait RetryDecision: Send + Sync {
    fn should_retry(&self, failed: usize) -> bool;
}

/// Reads a y/N answer from the terminal.
pub struct StdinPrompt;

impl RetryDecision for StdinPrompt {
    fn should_retry(&self, failed: usize) -> bool {
        print!("Retry the {} failed download(s) now? [y/N]: ", failed);
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        answer.trim().eq_ignore_ascii_case("y")
    }
}

/// Fixed answer, for `--no-prompt` and for tests.
pub struct PresetDecision(pub bool);

impl RetryDecision for PresetDecision {
    fn should_retry(&self, _failed: usize) -> bool {
        self.0
    }
}

/// Sequences extraction, queue build, download, and the one-shot retry.
pub struct Orchestrator {
    config: Arc<RunConfig>,
    session: Box<dyn GallerySession>,
    decider: Box<dyn RetryDecision>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<RunConfig>,
        session: Box<dyn GallerySession>,
        decider: Box<dyn RetryDecision>,
    ) -> Self {
        Self {
            config,
            session,
            decider,
        }
    }

    #[instrument(skip_all, fields(mode = ?mode))]
    pub async fn run(&self, mode: RunMode, cancel: CancellationToken) -> Result<RunStats> {
        let ledger = Arc::new(Mutex::new(CsvLedger::open(&self.config.log_file)));
        let engine = DownloadEngine::new(self.config.clone())?;

        let queue = match mode {
            RunMode::Fresh => self.extract_queue(&ledger).await?,
            RunMode::RetryFailed => {
                let failed = ledger.lock().await.failed();
                if failed.is_empty() {
                    println!("No failed URLs found in the log; nothing to retry.");
                    return Ok(RunStats::default());
                }
                println!("🔁 Retrying {} previously failed URLs...", failed.len());
                failed.iter().map(|e| make_candidate(&e.url)).collect()
            }
        };

        self.ensure_destination()?;

        info!("Downloading {} items with {} workers", queue.len(), self.config.workers);
        println!(
            "⬇️  Downloading {} image(s) to {} ({} workers)...",
            queue.len(),
            self.config.out_dir.display(),
            self.config.workers
        );
        let stats = engine.run(queue, ledger.clone(), cancel.clone()).await;
        self.print_summary(&stats);

        // One immediate retry pass over the failures, never recursive.
        // Reported on its own; the returned stats stay those of the main
        // pass so total always equals saved + failed + cancelled. The
        // ledger holds the per-item truth either way.
        if mode == RunMode::Fresh
            && stats.failed > 0
            && !cancel.is_cancelled()
            && self.decider.should_retry(stats.failed)
        {
            let failed = ledger.lock().await.failed();
            println!("🔁 Retrying {} failed item(s)...", failed.len());
            let retry_queue: Vec<MediaCandidate> =
                failed.iter().map(|e| make_candidate(&e.url)).collect();
            let retry_stats = engine.run(retry_queue, ledger.clone(), cancel).await;
            println!(
                "Retry complete. Recovered: {}  |  Still failing: {}",
                retry_stats.saved, retry_stats.failed
            );
        }

        Ok(stats)
    }

    /// Runs the operator gate and extraction, then builds the deduplicated
    /// queue, skipping assets the ledger already records as Success.
    async fn extract_queue(&self, ledger: &Arc<Mutex<CsvLedger>>) -> Result<Vec<MediaCandidate>> {
        self.session.wait_for_operator_ready().await?;
        let urls = self.session.list_visible_media_urls().await?;
        println!("🔍 Found {} images", urls.len());
        if urls.is_empty() {
            return Err(DownloaderError::Precondition(
                "0 images found; ensure the lightbox view is fully loaded before running"
                    .to_string(),
            ));
        }
        let candidates = urls.iter().map(|u| make_candidate(u)).collect();
        let succeeded = ledger.lock().await.succeeded_ids();
        let queue = build_queue(candidates, &succeeded);
        if queue.len() < urls.len() {
            info!(
                "Queue reduced from {} URLs to {} items (dedup + known successes)",
                urls.len(),
                queue.len()
            );
        }
        Ok(queue)
    }

    fn ensure_destination(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config.out_dir).map_err(|e| {
            DownloaderError::Precondition(format!(
                "Destination directory '{}' is not writable: {}",
                self.config.out_dir.display(),
                e
            ))
        })?;
        // Probe writability up front so the whole run fails fast instead of
        // every worker failing individually.
        let probe = self.config.out_dir.join(".write_probe");
        std::fs::write(&probe, b"").map_err(|e| {
            DownloaderError::Precondition(format!(
                "Destination directory '{}' is not writable: {}",
                self.config.out_dir.display(),
                e
            ))
        })?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    }

    fn print_summary(&self, stats: &RunStats) {
        println!("\n--- Summary ---");
        println!(
            "Total: {}  |  Saved: {}  |  Failed: {}{}",
            stats.total,
            stats.saved,
            stats.failed,
            if stats.cancelled > 0 {
                format!("  |  Cancelled: {}", stats.cancelled)
            } else {
                String::new()
            }
        );
        println!("Log: {}", self.config.log_file.display());
        if stats.cancelled > 0 {
            warn!("{} item(s) were cancelled before completion", stats.cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    struct StubSession {
        urls: Vec<String>,
    }

    #[async_trait::async_trait]
    impl GallerySession for StubSession {
        async fn list_visible_media_urls(&self) -> Result<Vec<String>> {
            Ok(self.urls.clone())
        }

        async fn wait_for_operator_ready(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(dir: &std::path::Path) -> Arc<RunConfig> {
        Arc::new(RunConfig {
            out_dir: dir.join("photos"),
            log_file: dir.join("log.csv"),
            workers: 2,
            max_tries: 1,
            backoff_base_ms: 10,
            ..RunConfig::default()
        })
    }

    #[tokio::test]
    async fn zero_extracted_urls_is_a_precondition_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            test_config(dir.path()),
            Box::new(StubSession { urls: vec![] }),
            Box::new(PresetDecision(false)),
        );
        let err = orchestrator
            .run(RunMode::Fresh, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloaderError::Precondition(_)));
    }

    #[tokio::test]
    async fn retry_pass_reports_separately_and_keeps_stats_consistent() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;

        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([9, 9, 9]));
        let mut jpeg = std::io::Cursor::new(Vec::new());
        img.write_to(&mut jpeg, image::ImageFormat::Jpeg).unwrap();

        // First attempt fails; the retry pass succeeds.
        Mock::given(method("GET"))
            .and(path("/media/r1/large"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/media/r1/large"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg.into_inner()))
            .mount(&server)
            .await;

        let config = test_config(dir.path());
        let orchestrator = Orchestrator::new(
            config.clone(),
            Box::new(StubSession {
                urls: vec![format!("{}/media/r1/large", server.uri())],
            }),
            Box::new(PresetDecision(true)),
        );
        let stats = orchestrator
            .run(RunMode::Fresh, CancellationToken::new())
            .await
            .unwrap();

        // Returned stats describe the main pass only and stay internally
        // consistent; the recovery shows up in the ledger.
        assert_eq!(stats.total, 1);
        assert_eq!(stats.saved + stats.failed + stats.cancelled, stats.total);
        assert_eq!(stats.failed, 1);

        let reopened = CsvLedger::open(&config.log_file);
        assert!(reopened.failed().is_empty());
        assert!(reopened.succeeded_ids().contains("r1_large"));
        assert!(config.out_dir.join("r1_large.jpg").exists());
    }

    #[tokio::test]
    async fn retry_mode_with_empty_ledger_is_a_clean_noop() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            test_config(dir.path()),
            Box::new(StubSession { urls: vec![] }),
            Box::new(PresetDecision(false)),
        );
        let stats = orchestrator
            .run(RunMode::RetryFailed, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.failed, 0);
    }
}
