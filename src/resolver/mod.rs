//! URL resolution: turning input URLs into downloadable file descriptions.
//!
//! A [`Resolver`] inspects a URL and expands it into either a single
//! [`FileInfo`](crate::download::FileInfo) or a whole
//! [`FolderInfo`](crate::download::FolderInfo) tree of files. Hosts with
//! listing pages or API endpoints get their own resolver; the
//! [`DirectResolver`] is the fallback that treats any plain HTTP(S) URL as a
//! single file.
//!
//! Resolvers run through the engine's [`HttpClient`], so their listing
//! requests share the same rate limiting and retry behavior as payload
//! downloads.

mod direct;

pub use direct::DirectResolver;

use async_trait::async_trait;

use crate::download::{DownloadError, FileInfo, FolderInfo, HttpClient};

/// What a URL resolved to.
#[derive(Debug, Clone)]
pub enum Resolved {
    /// The URL names a single file.
    File(FileInfo),
    /// The URL names a folder of files (possibly nested).
    Folder(FolderInfo),
}

/// Expands URLs into downloadable file descriptions.
///
/// Implementations are registered with the engine; the first resolver whose
/// `can_handle` accepts a URL gets to resolve it.
#[async_trait]
pub trait Resolver: Send + Sync + std::fmt::Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Whether this resolver understands the URL. Must be cheap; no I/O.
    fn can_handle(&self, url: &str) -> bool;

    /// Resolves the URL into file descriptions, fetching listing data
    /// through `client` as needed.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` when the URL is malformed for this resolver
    /// or the listing cannot be fetched.
    async fn resolve(&self, url: &str, client: &HttpClient) -> Result<Resolved, DownloadError>;
}
