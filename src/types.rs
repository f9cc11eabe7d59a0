use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A media asset discovered in the gallery's lightbox view.
///
/// Immutable once created: identity lives in `canonical_id`, which strips
/// volatile query parameters so the same asset served under different
/// session tokens dedups to one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaCandidate {
    pub source_url: String,
    pub canonical_id: String,
    pub embedded_timestamp: Option<NaiveDateTime>,
}

/// A unit of work owned by a single download worker for its lifetime.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub candidate: MediaCandidate,
    pub local_path: PathBuf,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

/// Terminal outcome recorded per asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Failed,
    Pending,
}

/// One row of the outcome ledger, keyed by `canonical_id`.
///
/// Field order matches the CSV header; the ledger is append-only on disk
/// and the latest row for a canonical id wins when reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub recorded_at: DateTime<Utc>,
    pub status: ItemStatus,
    pub attempts: u32,
    pub http_status: Option<u16>,
    pub canonical_id: String,
    pub filename: String,
    pub url: String,
    pub error: Option<String>,
}

/// Result of validating fetched bytes before they are treated as an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadCheck {
    ValidImage(ImageKind),
    InvalidPayload(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Other(String),
}

/// Aggregate counters for one engine pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    pub total: usize,
    pub saved: usize,
    pub failed: usize,
    pub cancelled: usize,
}
