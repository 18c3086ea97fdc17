//! Utility functions for string manipulation, URL handling, and file system operations.
//!
//! This module provides helper functions used throughout the application:
//! - String truncation for logging
//! - Title-casing and fallback display names derived from page URLs
//! - URL validation for inbound page lists
//! - File system validation for output locations

use std::error::Error;
use std::fs as stdfs;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};
use url::Url;

/// Truncate a string for logging purposes.
///
/// Long strings are truncated to at most `max` bytes (backing off to the
/// nearest character boundary) with an ellipsis and byte count appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Capitalize the first character of a string.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(upcase("hello"), "Hello");
/// assert_eq!(upcase(""), "");
/// ```
pub fn upcase(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        None => String::new(),
        Some(f) => f.to_uppercase().collect::<String>() + c.as_str(),
    }
}

/// Title-case every space-separated word: first letter upper, rest lower.
pub fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| upcase(&word.to_lowercase()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Display name used for a player before their page has been read: the
/// third-from-last path segment, hyphens turned into spaces, title-cased.
///
/// Returns `None` when the URL does not parse or the path is too short.
pub fn fallback_display_name(page_url: &str) -> Option<String> {
    let url = Url::parse(page_url).ok()?;
    let segments: Vec<&str> = url.path_segments()?.collect();
    let segment = segments.len().checked_sub(3).map(|i| segments[i])?;
    let name = title_case(segment.replace('-', " ").trim());
    (!name.is_empty()).then_some(name)
}

/// True for absolute `http`/`https` URLs with a host.
pub fn is_absolute_http_url(candidate: &str) -> bool {
    match Url::parse(candidate) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

/// Ensure the parent directory of `path` exists and is writable.
///
/// Creates the directory if it doesn't exist, then performs a write test by
/// creating and immediately deleting a probe file.
///
/// # Errors
///
/// Returns an error if:
/// - The directory cannot be created
/// - The directory is not writable (permission denied, read-only filesystem, etc.)
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_parent(path: &Path) -> Result<(), Box<dyn Error>> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    fs::create_dir_all(&dir).await?;
    // Try a small sync write using std fs (simpler error surface)
    let probe_path = dir.join("..__probe_write__");
    match stdfs::File::create(&probe_path) {
        Ok(_) => {
            let _ = stdfs::remove_file(&probe_path);
            info!(dir = %dir.display(), "Output directory is writable");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_for_log_short_string() {
        let s = "Hello, world!";
        assert_eq!(truncate_for_log(s, 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
    }

    #[test]
    fn test_truncate_for_log_respects_char_boundaries() {
        // Cyrillic letters are two bytes each.
        let result = truncate_for_log("вратарь", 3);
        assert!(result.starts_with("в…"));
    }

    #[test]
    fn test_upcase() {
        assert_eq!(upcase("hello"), "Hello");
        assert_eq!(upcase(""), "");
        assert_eq!(upcase("a"), "A");
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("kevin de bruyne"), "Kevin De Bruyne");
        assert_eq!(title_case("JOHN o'shea"), "John O'shea");
    }

    #[test]
    fn test_fallback_display_name() {
        assert_eq!(
            fallback_display_name("https://example.com/kevin-de-bruyne/profil/spieler/88755")
                .as_deref(),
            Some("Profil")
        );
        assert_eq!(
            fallback_display_name("https://example.com/players/erling-haaland/stats/2023")
                .as_deref(),
            Some("Erling Haaland")
        );
        assert_eq!(fallback_display_name("https://example.com/a"), None);
        assert_eq!(fallback_display_name("not a url"), None);
    }

    #[test]
    fn test_is_absolute_http_url() {
        assert!(is_absolute_http_url("https://example.com/p/1"));
        assert!(is_absolute_http_url("http://example.com"));
        assert!(!is_absolute_http_url("/relative/path"));
        assert!(!is_absolute_http_url("ftp://example.com/file"));
        assert!(!is_absolute_http_url("mailto:someone@example.com"));
    }

    #[tokio::test]
    async fn test_ensure_writable_parent_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("records.json");
        ensure_writable_parent(&target).await.unwrap();
        assert!(dir.path().join("nested").is_dir());
    }
}
