use chrono::NaiveDateTime;
use url::Url;

/// Parses the capture timestamp encoded in a media URL's `u=` query
/// parameter (ISO-8601, optionally suffixed with `Z`).
///
/// The URL is deliberately trusted over any HTTP response header: the
/// gallery backend does not expose capture dates any other way. Absence or
/// a malformed value yields `None` and never fails the pipeline.
pub fn parse_timestamp(raw_url: &str) -> Option<NaiveDateTime> {
    let parsed = Url::parse(raw_url).ok()?;
    let value = parsed
        .query_pairs()
        .find(|(key, _)| key == "u")
        .map(|(_, value)| value.into_owned())?;
    let trimmed = value.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}
