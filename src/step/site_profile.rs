//! Site-profile passthrough (§4.11 "Site-profile on goto", §6 "Persisted
//! state"). Profile files are opaque UTF-8 text the host never interprets.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Strips a leading `www.` and maps any character outside `[A-Za-z0-9.\-]`
/// to `_`. The fixed sanitization rule from spec §6.
pub fn sanitize_domain(domain: &str) -> String {
    let stripped = domain.strip_prefix("www.").unwrap_or(domain);
    stripped
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Extracts the host from a navigation URL, or the raw string if it doesn't
/// parse as a URL (callers are expected to pass a `goto` target).
pub fn domain_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_else(|| url.to_string())
}

pub fn profile_path(profile_dir: &Path, domain: &str) -> PathBuf {
    profile_dir.join(format!("{}.md", sanitize_domain(domain)))
}

/// Reads the profile for `domain`, returning `None` if no file exists.
pub async fn read_profile(profile_dir: &Path, domain: &str) -> Result<Option<String>> {
    let path = profile_path(profile_dir, domain);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::new(
            crate::error::ErrorKind::Protocol,
            format!("failed to read site profile {}: {e}", path.display()),
        )),
    }
}

/// Writes `content` verbatim to the profile for `domain`, creating the
/// profile directory if needed.
pub async fn write_profile(profile_dir: &Path, domain: &str, content: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(profile_dir).await.map_err(|e| {
        Error::new(
            crate::error::ErrorKind::Protocol,
            format!("failed to create profile dir {}: {e}", profile_dir.display()),
        )
    })?;
    let path = profile_path(profile_dir, domain);
    tokio::fs::write(&path, content).await.map_err(|e| {
        Error::new(
            crate::error::ErrorKind::Protocol,
            format!("failed to write site profile {}: {e}", path.display()),
        )
    })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_leading_www() {
        assert_eq!(sanitize_domain("www.example.com"), "example.com");
    }

    #[test]
    fn sanitize_maps_unsafe_characters_to_underscore() {
        assert_eq!(sanitize_domain("ex ample:8080"), "ex_ample_8080");
    }

    #[test]
    fn sanitize_keeps_dots_and_dashes() {
        assert_eq!(sanitize_domain("sub-domain.example.co"), "sub-domain.example.co");
    }

    #[test]
    fn domain_from_url_extracts_host() {
        assert_eq!(domain_from_url("https://www.example.com/wiki/Albert"), "www.example.com");
    }

    #[tokio::test]
    async fn read_profile_returns_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_profile(dir.path(), "example.com").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn write_then_read_profile_round_trips_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        write_profile(dir.path(), "www.example.com", "# notes\nopaque text").await.unwrap();
        let content = read_profile(dir.path(), "example.com").await.unwrap();
        assert_eq!(content.as_deref(), Some("# notes\nopaque text"));
    }
}
