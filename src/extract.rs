//! Candidate extraction and validation.
//!
//! Relay endpoints answer with either JSON or HTML; both shapes boil
//! down to the same contract: `body -> optional URL`. The JSON search is
//! a bounded-depth visitor over the parsed value tree, the HTML/text
//! search a set of compiled patterns. Extracted candidates must pass
//! [`validate_url`] before a relay attempt counts as a success.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Recursion limit for the JSON visitor
const MAX_JSON_DEPTH: u8 = 5;

/// Keys that commonly carry the resolved URL in relay responses
const URL_KEYS: [&str; 7] = [
    "url",
    "playUrl",
    "video_url",
    "src",
    "play_url",
    "vurl",
    "data",
];

/// Substrings identifying a media resource
const MEDIA_INDICATORS: [&str; 6] = [".m3u8", ".mp4", ".flv", "/m3u8/", "/mp4/", "/flv/"];

/// Substrings identifying decidedly non-media resources
const MEDIA_EXCLUSIONS: [&str; 9] = [
    "poster", "thumb", "cover", ".jpg", ".png", ".gif", ".css", ".js", "favicon",
];

/// Extensions accepted by [`validate_url`]
const VALID_EXTENSIONS: [&str; 4] = [".m3u8", ".mp4", ".flv", ".ts"];

/// Path segments accepted by [`validate_url`]
const VALID_SEGMENTS: [&str; 5] = ["/m3u8/", "/mp4/", "/flv/", "/hls/", "/dash/"];

/// Characters that never occur in a legitimate candidate
const INVALID_CHARS: [char; 7] = ['<', '>', '"', '\'', '\n', '\r', '\t'];

static TEXT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"["']?(https?://[^"'<>\s]+\.m3u8[^"'<>\s]*)["']?"#,
        r#"["']?(https?://[^"'<>\s]+\.mp4[^"'<>\s]*)["']?"#,
        r#"["']?(https?://[^"'<>\s]+\.flv[^"'<>\s]*)["']?"#,
        r#"url["\s:=]+["']?(https?://[^"'<>\s]+)["']?"#,
        r#"source["\s:=]+["']?(https?://[^"'<>\s]+)["']?"#,
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("invalid pattern"))
    .collect()
});

/// Search a JSON response body for a media URL.
///
/// Well-known keys are inspected first (one level of nesting included),
/// then the whole value tree is visited down to a fixed depth. Bodies
/// that fail to parse as JSON fall back to the text scan.
#[must_use]
pub fn url_from_json(body: &str) -> Option<String> {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return url_from_text(body);
    };

    if let Value::Object(map) = &value {
        for key in URL_KEYS {
            match map.get(key) {
                Some(Value::String(s)) if is_media_url(s) => return Some(s.clone()),
                Some(Value::Object(inner)) => {
                    for sub_key in URL_KEYS {
                        if let Some(Value::String(s)) = inner.get(sub_key) {
                            if is_media_url(s) {
                                return Some(s.clone());
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    find_url(&value, 0)
}

/// Bounded-depth visit over a JSON value tree.
fn find_url(value: &Value, depth: u8) -> Option<String> {
    if depth > MAX_JSON_DEPTH {
        return None;
    }
    match value {
        Value::String(s) if is_media_url(s) => Some(s.clone()),
        Value::Object(map) => map.values().find_map(|v| find_url(v, depth + 1)),
        Value::Array(items) => items.iter().find_map(|v| find_url(v, depth + 1)),
        _ => None,
    }
}

/// Scan an HTML or text response body for a media URL.
#[must_use]
pub fn url_from_text(body: &str) -> Option<String> {
    for pattern in TEXT_PATTERNS.iter() {
        for captures in pattern.captures_iter(body) {
            if let Some(m) = captures.get(1) {
                let cleaned = m.as_str().replace("\\/", "/").replace("\\u002F", "/");
                if is_media_url(&cleaned) {
                    return Some(cleaned);
                }
            }
        }
    }
    None
}

/// Loose check used during extraction: an `http(s)` URL that carries a
/// media indicator and is not an obvious asset (thumbnail, stylesheet).
#[must_use]
pub fn is_media_url(url: &str) -> bool {
    if !url.starts_with("http") {
        return false;
    }
    let lower = url.to_lowercase();
    let has_media = MEDIA_INDICATORS.iter().any(|ind| lower.contains(ind));
    let excluded = MEDIA_EXCLUSIONS.iter().any(|ex| lower.contains(ex));
    has_media && !excluded
}

/// Strict validation of an extracted candidate URL.
///
/// Rejects, in order: the empty string; any scheme other than
/// `http(s)`; lengths below 20 or above 2000 characters; control or
/// quoting characters; candidates without a recognized media extension
/// or path segment. Everything else is accepted.
#[must_use]
pub fn validate_url(candidate: &str) -> bool {
    if candidate.is_empty() {
        return false;
    }
    if !candidate.starts_with("http://") && !candidate.starts_with("https://") {
        return false;
    }
    if candidate.len() < 20 || candidate.len() > 2000 {
        return false;
    }
    if candidate.contains(INVALID_CHARS) {
        return false;
    }
    let lower = candidate.to_lowercase();
    VALID_EXTENSIONS.iter().any(|ext| lower.contains(ext))
        || VALID_SEGMENTS.iter().any(|seg| lower.contains(seg))
}
