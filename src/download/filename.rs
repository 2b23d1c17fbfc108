//! Filename sanitization and atomic output-path reservation.
//!
//! Filenames arrive from untrusted sources (URLs, resolver metadata) and are
//! sanitized before touching the filesystem. Output paths are reserved by
//! exclusively creating a zero-byte placeholder, so concurrent downloads of
//! the same name can never race each other onto one path.

use std::path::{Component, Path, PathBuf};

use url::Url;

use super::error::DownloadError;

/// Longest filename we will produce, in bytes. Common filesystems cap
/// component names at 255 bytes.
const MAX_FILENAME_BYTES: usize = 255;

/// How many numbered candidates to try before giving up on a name.
const MAX_NAMING_ATTEMPTS: usize = 1000;

/// Sanitizes a filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |` and control characters) with `_`, rewrites dot
/// segments so the name cannot escape its directory, and truncates overlong
/// names while preserving the extension.
#[must_use]
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    let sanitized = if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    };

    truncate_filename(&sanitized)
}

/// Shortens an overlong filename to the filesystem limit, keeping the
/// extension intact.
fn truncate_filename(name: &str) -> String {
    if name.len() <= MAX_FILENAME_BYTES {
        return name.to_string();
    }

    let (stem, ext) = split_extension(name);
    let budget = MAX_FILENAME_BYTES.saturating_sub(ext.len()).max(1);

    let mut end = budget.min(stem.len());
    while end > 0 && !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{ext}", &stem[..end])
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        // A leading dot is a hidden-file prefix, not an extension
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename, ""),
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Reserves a collision-free output path in `dir` for `filename`.
///
/// Tries the base name first, then `stem_1.ext`, `stem_2.ext`, and so on.
/// Each candidate is claimed by exclusively creating a zero-byte placeholder
/// file, so two concurrent reservations of the same name always end up on
/// distinct paths. The placeholder is atomically replaced when the finished
/// download is moved into place.
///
/// # Errors
///
/// Returns `DownloadError::NamingConflict` when every candidate is taken and
/// `DownloadError::Io` for any filesystem failure other than a collision.
pub(crate) fn reserve_unique_path(dir: &Path, filename: &str) -> Result<PathBuf, DownloadError> {
    let filename = {
        let sanitized = sanitize_filename(filename);
        // Ensure no path separators remain (defense in depth against path traversal)
        if sanitized.contains('/')
            || sanitized.contains('\\')
            || sanitized.trim_matches('_').is_empty()
        {
            "download.bin".to_string()
        } else {
            sanitized
        }
    };
    let (stem, ext) = split_extension(&filename);

    for attempt in 0..MAX_NAMING_ATTEMPTS {
        let candidate = if attempt == 0 {
            dir.join(&filename)
        } else {
            dir.join(format!("{stem}_{attempt}{ext}"))
        };

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(DownloadError::io(candidate, e)),
        }
    }

    Err(DownloadError::naming_conflict(
        dir,
        filename,
        MAX_NAMING_ATTEMPTS,
    ))
}

/// Fallback filename derived from the URL's last path segment, or
/// `download_timestamp.bin` when the path carries none.
pub(crate) fn fallback_filename_from_url(url: &Url) -> String {
    if let Some(mut segments) = url.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
        return sanitize_filename(&decoded);
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("download_{timestamp}.bin")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::Component;

    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_filename_removes_invalid_chars() {
        assert_eq!(sanitize_filename("file/name.bin"), "file_name.bin");
        assert_eq!(sanitize_filename("file\\name.bin"), "file_name.bin");
        assert_eq!(sanitize_filename("file:name.bin"), "file_name.bin");
        assert_eq!(sanitize_filename("file*name.bin"), "file_name.bin");
        assert_eq!(sanitize_filename("file?name.bin"), "file_name.bin");
        assert_eq!(sanitize_filename("file\"name.bin"), "file_name.bin");
        assert_eq!(sanitize_filename("file<name>.bin"), "file_name_.bin");
        assert_eq!(sanitize_filename("file|name.bin"), "file_name.bin");
    }

    #[test]
    fn test_sanitize_filename_rewrites_dot_segments() {
        assert_eq!(sanitize_filename("."), "_");
        assert_eq!(sanitize_filename(".."), "__");
    }

    #[test]
    fn test_sanitize_filename_preserves_valid_chars() {
        assert_eq!(
            sanitize_filename("valid-file_name.tar.gz"),
            "valid-file_name.tar.gz"
        );
        assert_eq!(sanitize_filename("file (1).bin"), "file (1).bin");
        assert_eq!(sanitize_filename("日本語.bin"), "日本語.bin");
    }

    #[test]
    fn test_sanitize_filename_truncates_preserving_extension() {
        let long = format!("{}{}", "a".repeat(300), ".tar.gz");
        let result = sanitize_filename(&long);
        assert!(result.len() <= 255, "got {} bytes", result.len());
        assert!(result.ends_with(".gz"));
    }

    #[test]
    fn test_sanitize_filename_truncation_respects_char_boundaries() {
        let long = "日".repeat(120);
        let result = sanitize_filename(&long);
        assert!(result.len() <= 255);
        assert!(result.chars().all(|c| c == '日'));
    }

    #[test]
    fn test_reserve_unique_path_no_conflict() {
        let temp_dir = TempDir::new().unwrap();
        let path = reserve_unique_path(temp_dir.path(), "test.bin").unwrap();
        assert_eq!(path, temp_dir.path().join("test.bin"));
        // The reservation leaves a placeholder behind
        assert!(path.exists());
    }

    #[test]
    fn test_reserve_unique_path_with_conflict() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("test.bin"), b"existing").unwrap();

        let path = reserve_unique_path(temp_dir.path(), "test.bin").unwrap();
        assert_eq!(path, temp_dir.path().join("test_1.bin"));
    }

    #[test]
    fn test_reserve_unique_path_multiple_conflicts() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("test.bin"), b"1").unwrap();
        std::fs::write(temp_dir.path().join("test_1.bin"), b"2").unwrap();
        std::fs::write(temp_dir.path().join("test_2.bin"), b"3").unwrap();

        let path = reserve_unique_path(temp_dir.path(), "test.bin").unwrap();
        assert_eq!(path, temp_dir.path().join("test_3.bin"));
    }

    #[test]
    fn test_reserve_unique_path_repeated_reservations_are_distinct() {
        let temp_dir = TempDir::new().unwrap();
        let first = reserve_unique_path(temp_dir.path(), "dup.bin").unwrap();
        let second = reserve_unique_path(temp_dir.path(), "dup.bin").unwrap();
        let third = reserve_unique_path(temp_dir.path(), "dup.bin").unwrap();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_ne!(first, third);
    }

    #[test]
    fn test_reserve_unique_path_dot_segment_stays_under_output_dir() {
        let temp_dir = TempDir::new().unwrap();
        let path = reserve_unique_path(temp_dir.path(), "..").unwrap();
        assert_eq!(path, temp_dir.path().join("download.bin"));
    }

    #[test]
    fn test_reserve_unique_path_protects_against_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path();

        // Path traversal attempts must be sanitized; reserved path must stay
        // under base with no literal .. component
        for malicious in ["../../etc/passwd", "subdir/../../../etc/passwd", "a/\\b\\c"] {
            let path = reserve_unique_path(base, malicious).unwrap();
            assert!(
                path.starts_with(base),
                "reserved path must be under output dir: got {}",
                path.display()
            );
            let has_parent_dir = path.components().any(|c| c == Component::ParentDir);
            assert!(
                !has_parent_dir,
                "reserved path must not have .. component: got {}",
                path.display()
            );
        }
    }

    #[test]
    fn test_reserve_unique_path_exhaustion_is_naming_conflict() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("n"), b"x").unwrap();
        for i in 1..1000 {
            std::fs::write(temp_dir.path().join(format!("n_{i}")), b"x").unwrap();
        }

        let result = reserve_unique_path(temp_dir.path(), "n");
        assert!(matches!(
            result,
            Err(DownloadError::NamingConflict { attempts: 1000, .. })
        ));
    }

    #[test]
    fn test_fallback_filename_from_url_uses_last_path_segment() {
        let url = url::Url::parse("https://example.com/files/archive.zip").unwrap();
        assert_eq!(fallback_filename_from_url(&url), "archive.zip");
    }

    #[test]
    fn test_fallback_filename_from_url_decodes_percent_encoding() {
        let url = url::Url::parse("https://example.com/files/my%20archive.zip").unwrap();
        assert_eq!(fallback_filename_from_url(&url), "my archive.zip");
    }

    #[test]
    fn test_fallback_filename_from_url_empty_path_returns_timestamp_fallback() {
        let url = url::Url::parse("https://example.com/").unwrap();
        let result = fallback_filename_from_url(&url);
        assert!(result.starts_with("download_"));
        assert!(result.ends_with(".bin"));
    }

    #[test]
    fn test_fallback_filename_from_url_sanitizes_invalid_chars() {
        // Colons in the decoded segment get sanitized
        let url = url::Url::parse("https://example.com/file%3Aname.bin").unwrap();
        let result = fallback_filename_from_url(&url);
        assert!(!result.contains(':'));
    }
}
