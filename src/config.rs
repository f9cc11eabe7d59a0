use crate::error::{DownloaderError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

// Compiled-in example coordinates; operators are expected to override them
// via config.toml or --lat/--lon.
pub const DEFAULT_LAT: f64 = 51.49009034271866;
pub const DEFAULT_LON: f64 = -3.163831280770506;

pub const DEFAULT_OUT_DIR: &str = "gallery_photos";
pub const DEFAULT_LOG_FILE: &str = "download_log.csv";
pub const DEFAULT_PAGE_FILE: &str = "gallery.html";
pub const DEFAULT_IMG_SELECTOR: &str = "picture img, img";
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_MAX_TRIES: u32 = 5;

/// Effective run configuration, threaded explicitly from the CLI down to
/// the engine and the metadata embedder. No process-wide mutable state.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub workers: usize,
    pub max_tries: u32,
    pub out_dir: PathBuf,
    pub log_file: PathBuf,
    pub page_file: PathBuf,
    pub img_selector: String,
    /// Only URLs on this host are treated as gallery media; `None` keeps
    /// every http(s) URL the selector matches.
    pub media_host: Option<String>,
    pub skip_exif: bool,
    pub no_prompt: bool,
    /// Base unit for exponential backoff between attempts.
    pub backoff_base_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            latitude: DEFAULT_LAT,
            longitude: DEFAULT_LON,
            workers: DEFAULT_WORKERS,
            max_tries: DEFAULT_MAX_TRIES,
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            page_file: PathBuf::from(DEFAULT_PAGE_FILE),
            img_selector: DEFAULT_IMG_SELECTOR.to_string(),
            media_host: None,
            skip_exif: false,
            no_prompt: false,
            backoff_base_ms: 1000,
        }
    }
}

/// Optional `config.toml` overlay. Every field is optional; anything left
/// unset falls back to the compiled-in default, and CLI flags override both.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigOverlay {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub workers: Option<usize>,
    pub max_tries: Option<u32>,
    pub out_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub page_file: Option<PathBuf>,
    pub img_selector: Option<String>,
    pub media_host: Option<String>,
}

impl ConfigOverlay {
    /// Loads the overlay from `path`. A missing file is not an error; a
    /// present-but-invalid file is, so typos fail loudly.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| {
            DownloaderError::Precondition(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let overlay: ConfigOverlay = toml::from_str(&content)?;
        Ok(overlay)
    }
}

impl RunConfig {
    pub fn apply_overlay(mut self, overlay: ConfigOverlay) -> Self {
        if let Some(v) = overlay.latitude {
            self.latitude = v;
        }
        if let Some(v) = overlay.longitude {
            self.longitude = v;
        }
        if let Some(v) = overlay.workers {
            self.workers = v;
        }
        if let Some(v) = overlay.max_tries {
            self.max_tries = v;
        }
        if let Some(v) = overlay.out_dir {
            self.out_dir = v;
        }
        if let Some(v) = overlay.log_file {
            self.log_file = v;
        }
        if let Some(v) = overlay.page_file {
            self.page_file = v;
        }
        if let Some(v) = overlay.img_selector {
            self.img_selector = v;
        }
        if overlay.media_host.is_some() {
            self.media_host = overlay.media_host;
        }
        self
    }
}
