use crate::timestamp::parse_timestamp;
use crate::types::MediaCandidate;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;
use url::Url;

/// Derives the canonical identity of a media URL.
///
/// Gallery media paths look like `/.../media/{id}/{variant}`; the id and
/// variant are the identity-bearing components. Query parameters (session
/// keys, signatures, the `u=` timestamp) are volatile and excluded, so the
/// same asset served under different tokens maps to one id.
pub fn canonical_id(raw_url: &str) -> String {
    if let Ok(parsed) = Url::parse(raw_url) {
        let segments: Vec<&str> = parsed
            .path()
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        if let Some(i) = segments.iter().position(|s| *s == "media") {
            if let Some(media_id) = segments.get(i + 1) {
                let variant = segments.get(i + 2).copied().unwrap_or("file");
                return format!("{}_{}", media_id, variant);
            }
        }
        if !segments.is_empty() {
            return segments.join("_");
        }
    }
    raw_url.to_string()
}

/// Deterministic local filename for a canonical id.
pub fn filename_for(canonical_id: &str) -> String {
    format!("{}.jpg", canonical_id)
}

/// Builds a `MediaCandidate` from a raw extracted URL, attaching the
/// embedded capture timestamp when present.
pub fn make_candidate(raw_url: &str) -> MediaCandidate {
    MediaCandidate {
        canonical_id: canonical_id(raw_url),
        embedded_timestamp: parse_timestamp(raw_url),
        source_url: raw_url.to_string(),
    }
}

/// Normalizes the raw candidate set into an ordered work queue.
///
/// Duplicates collapse last-seen-wins (they are expected to be
/// byte-identical assets), candidates already recorded as Success are
/// skipped, and the queue is emitted sorted by canonical id so two runs over
/// the same extractor output produce the same order.
pub fn build_queue(
    candidates: Vec<MediaCandidate>,
    succeeded: &HashSet<String>,
) -> Vec<MediaCandidate> {
    let mut by_id: BTreeMap<String, MediaCandidate> = BTreeMap::new();
    for candidate in candidates {
        by_id.insert(candidate.canonical_id.clone(), candidate);
    }
    let before = by_id.len();
    by_id.retain(|id, _| !succeeded.contains(id));
    let skipped = before - by_id.len();
    if skipped > 0 {
        debug!("Skipping {} previously downloaded assets", skipped);
    }
    by_id.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_id_from_media_path() {
        assert_eq!(
            canonical_id("https://api.gallery.test/v1/media/abc123/large?key=x&u=2023-01-01T00:00:00"),
            "abc123_large"
        );
        assert_eq!(
            canonical_id("https://api.gallery.test/media/abc123"),
            "abc123_file"
        );
    }

    #[test]
    fn canonical_id_falls_back_to_path_segments() {
        assert_eq!(
            canonical_id("https://cdn.test/photos/2023/pic.jpg?sig=zz"),
            "photos_2023_pic.jpg"
        );
        assert_eq!(canonical_id("https://cdn.test/"), "https://cdn.test/");
    }

    #[test]
    fn duplicates_differing_only_in_query_noise_collapse() {
        let urls = [
            "https://api.test/media/a/large?session=1",
            "https://api.test/media/a/large?session=2&u=2023-01-01T00:00:00",
            "https://api.test/media/b/large",
        ];
        let candidates = urls.iter().map(|u| make_candidate(u)).collect();
        let queue = build_queue(candidates, &HashSet::new());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].canonical_id, "a_large");
        assert_eq!(queue[1].canonical_id, "b_large");
        // last-seen wins: the surviving `a_large` carries the timestamp
        assert!(queue[0].embedded_timestamp.is_some());
    }

    #[test]
    fn known_successes_are_skipped() {
        let candidates = vec![
            make_candidate("https://api.test/media/a/large"),
            make_candidate("https://api.test/media/b/large"),
        ];
        let succeeded: HashSet<String> = ["a_large".to_string()].into_iter().collect();
        let queue = build_queue(candidates, &succeeded);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].canonical_id, "b_large");
    }

    #[test]
    fn queue_order_is_deterministic() {
        let urls = [
            "https://api.test/media/zz/large",
            "https://api.test/media/aa/large",
            "https://api.test/media/mm/large",
        ];
        let build = || {
            build_queue(
                urls.iter().map(|u| make_candidate(u)).collect(),
                &HashSet::new(),
            )
        };
        let ids: Vec<String> = build().into_iter().map(|c| c.canonical_id).collect();
        assert_eq!(ids, vec!["aa_large", "mm_large", "zz_large"]);
        let again: Vec<String> = build().into_iter().map(|c| c.canonical_id).collect();
        assert_eq!(ids, again);
    }
}
