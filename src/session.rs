use crate::error::{DownloaderError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info};

/// Narrow seam over the operator's browsing session.
///
/// The interactive browser itself is an external collaborator; the core only
/// needs two operations from it. Adapters over a live automation layer can
/// implement this trait without the pipeline knowing their concrete shape.
#[async_trait::async_trait]
pub trait GallerySession: Send + Sync {
    /// Returns the raw URLs of all media elements currently visible in the
    /// lightbox view. Zero results is reported, not fatal, at this layer.
    async fn list_visible_media_urls(&self) -> Result<Vec<String>>;

    /// The operator-readiness gate. Performs at most one fixed check; it is
    /// the operator's job to have the lightbox view loaded beforehand.
    async fn wait_for_operator_ready(&self) -> Result<()>;
}

/// Session adapter over a saved copy of the gallery page.
///
/// The operator logs in, scrolls the lightbox view until everything is
/// loaded, saves the page, and points the tool at the snapshot. Media URLs
/// are pulled from `img` elements, preferring the largest `srcset` variant.
pub struct SavedPageSession {
    page_path: PathBuf,
    img_selector: String,
    media_host: Option<String>,
}

impl SavedPageSession {
    pub fn new(page_path: PathBuf, img_selector: String, media_host: Option<String>) -> Self {
        Self {
            page_path,
            img_selector,
            media_host,
        }
    }

    fn accepts(&self, url: &str) -> bool {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return false;
        }
        match &self.media_host {
            Some(host) => url.contains(host.as_str()),
            None => true,
        }
    }
}

#[async_trait::async_trait]
impl GallerySession for SavedPageSession {
    async fn list_visible_media_urls(&self) -> Result<Vec<String>> {
        let body = tokio::fs::read_to_string(&self.page_path).await?;
        let document = Html::parse_document(&body);
        let selector = Selector::parse(&self.img_selector).map_err(|e| {
            DownloaderError::Precondition(format!(
                "Invalid image selector '{}': {}",
                self.img_selector, e
            ))
        })?;

        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for element in document.select(&selector) {
            let srcset = element.value().attr("srcset");
            let src = element.value().attr("src");
            let picked = match srcset {
                Some(set) => pick_largest_from_srcset(set).or(src.map(str::to_string)),
                None => src.map(str::to_string),
            };
            if let Some(url) = picked {
                if self.accepts(&url) && seen.insert(url.clone()) {
                    urls.push(url);
                }
            }
        }
        debug!("Extracted {} media URLs from {}", urls.len(), self.page_path.display());
        Ok(urls)
    }

    async fn wait_for_operator_ready(&self) -> Result<()> {
        // One fixed check: the snapshot must exist before extraction starts.
        if !self.page_path.exists() {
            return Err(DownloaderError::Precondition(format!(
                "Gallery page snapshot '{}' not found. Log in, open the lightbox view, \
                 save the page, then re-run.",
                self.page_path.display()
            )));
        }
        info!("Using gallery snapshot {}", self.page_path.display());
        Ok(())
    }
}

static SRCSET_ENTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\S+)\s+(\d+)w$").unwrap());

/// Picks the widest candidate from a `srcset` attribute, falling back to the
/// first plain URL when no width descriptors are present.
pub fn pick_largest_from_srcset(srcset: &str) -> Option<String> {
    let mut best_url: Option<String> = None;
    let mut best_width = -1_i64;
    for candidate in srcset.split(',') {
        let candidate = candidate.trim();
        if let Some(caps) = SRCSET_ENTRY.captures(candidate) {
            let width: i64 = caps[2].parse().unwrap_or(-1);
            if width > best_width {
                best_url = Some(caps[1].to_string());
                best_width = width;
            }
        } else if best_url.is_none()
            && (candidate.starts_with("http://") || candidate.starts_with("https://"))
        {
            best_url = Some(candidate.to_string());
        }
    }
    best_url
}
