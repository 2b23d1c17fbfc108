//! Direct URL resolver - passthrough for plain file URLs.
//!
//! The [`DirectResolver`] is the simplest resolver implementation. It
//! accepts any HTTP(S) URL and describes it as a single file whose name is
//! taken from the URL path. It serves as the fallback resolver and as a
//! reference implementation for site-specific resolver authors.

use async_trait::async_trait;
use url::Url;

use crate::download::{DownloadError, FileInfo, HttpClient};

use super::{Resolved, Resolver};

/// A resolver that treats any HTTP(S) URL as a single downloadable file.
#[derive(Debug)]
pub struct DirectResolver;

impl DirectResolver {
    /// Creates a new `DirectResolver`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for DirectResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for DirectResolver {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn can_handle(&self, url: &str) -> bool {
        Url::parse(url).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
    }

    #[tracing::instrument(skip(self, _client), fields(resolver = "direct"))]
    async fn resolve(&self, url: &str, _client: &HttpClient) -> Result<Resolved, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        let filename = crate::download::filename::fallback_filename_from_url(&parsed);
        Ok(Resolved::File(FileInfo::new(url, filename)))
    }
}
