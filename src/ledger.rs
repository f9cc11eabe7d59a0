use crate::error::Result;
use crate::types::{ItemStatus, LedgerEntry};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HEADER: [&str; 8] = [
    "recorded_at",
    "status",
    "attempts",
    "http_status",
    "canonical_id",
    "filename",
    "url",
    "error",
];

/// Durable outcome ledger backed by an append-only CSV file.
///
/// On disk the file is append-safe across runs: one row per recorded
/// attempt outcome, header written once. In memory the latest row per
/// canonical id wins, which is what gives `upsert` semantics without ever
/// rewriting history.
pub struct CsvLedger {
    path: PathBuf,
    entries: HashMap<String, LedgerEntry>,
}

impl CsvLedger {
    /// Opens the ledger at `path`, replaying any existing rows.
    ///
    /// A missing file yields an empty ledger. A corrupted file also yields
    /// an empty ledger with a warning: prior history is an optimization,
    /// never a reason to abort a run. The unreadable file is moved aside so
    /// rows recorded from here on start a fresh file with a header instead
    /// of being appended after garbage and lost on the next open.
    pub fn open(path: &Path) -> Self {
        let mut entries = HashMap::new();
        if path.exists() {
            match Self::read_entries(path) {
                Ok(loaded) => {
                    debug!("Loaded {} ledger entries from {}", loaded.len(), path.display());
                    entries = loaded;
                }
                Err(e) => {
                    warn!(
                        "Ledger file {} is unreadable ({}); proceeding with empty history",
                        path.display(),
                        e
                    );
                    Self::quarantine(path);
                }
            }
        }
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    fn quarantine(path: &Path) {
        let mut aside = path.as_os_str().to_os_string();
        aside.push(format!(".corrupt-{}", Utc::now().format("%Y%m%d%H%M%S")));
        let aside = PathBuf::from(aside);
        match std::fs::rename(path, &aside) {
            Ok(()) => warn!("Moved unreadable ledger to {}", aside.display()),
            Err(e) => {
                warn!("Could not move unreadable ledger aside ({}); removing it", e);
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Could not remove unreadable ledger either: {}", e);
                }
            }
        }
    }

    fn read_entries(path: &Path) -> Result<HashMap<String, LedgerEntry>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut entries = HashMap::new();
        for row in reader.deserialize() {
            let entry: LedgerEntry = row?;
            entries.insert(entry.canonical_id.clone(), entry);
        }
        Ok(entries)
    }

    /// Records one terminal outcome: appends a row to the CSV file and
    /// replaces the in-memory entry for the canonical id.
    pub fn upsert(&mut self, entry: LedgerEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let write_header = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if write_header {
            writer.write_record(HEADER)?;
        }
        writer.serialize(&entry)?;
        writer.flush()?;
        self.entries.insert(entry.canonical_id.clone(), entry);
        Ok(())
    }

    /// Entries whose latest recorded status is Failed.
    pub fn failed(&self) -> Vec<LedgerEntry> {
        let mut failed: Vec<LedgerEntry> = self
            .entries
            .values()
            .filter(|e| e.status == ItemStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
        failed
    }

    /// Canonical ids whose latest recorded status is Success.
    pub fn succeeded_ids(&self) -> HashSet<String> {
        self.entries
            .values()
            .filter(|e| e.status == ItemStatus::Success)
            .map(|e| e.canonical_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, canonical_id: &str) -> Option<&LedgerEntry> {
        self.entries.get(canonical_id)
    }
}
