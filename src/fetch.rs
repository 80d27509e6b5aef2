//! Remote package retrieval.
//!
//! The resolver fetches a missing package by id and version; the artifact
//! lands as `{id}.{version}.pkg` under the destination directory, ready to
//! be registered with the catalog.

use crate::http::{HttpClient, NonRetryableError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use semver::Version;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default request deadline for registry downloads.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("package {id}@{version} not found in registry")]
    NotFound { id: String, version: Version },
    #[error("registry request timed out")]
    Timeout,
    #[error("registry request failed: {0}")]
    Http(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Trait for remote package sources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Download one package artifact into `dest_dir` and return its path.
    async fn fetch(
        &self,
        id: &str,
        version: &Version,
        dest_dir: &Path,
    ) -> Result<PathBuf, FetchError>;
}

/// Fetcher against the registry's fixed endpoint template
/// `{base}/api/v2/package/{id}/{version}`.
pub struct HttpFetcher {
    base_url: String,
    client: HttpClient,
}

impl HttpFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpFetcher {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: HttpClient::new(client),
        })
    }

    pub fn package_url(&self, id: &str, version: &Version) -> String {
        format!("{}/api/v2/package/{}/{}", self.base_url, id, version)
    }

    fn map_error(id: &str, version: &Version, error: anyhow::Error) -> FetchError {
        if let Some(non_retryable) = error.downcast_ref::<NonRetryableError>() {
            if matches!(non_retryable, NonRetryableError::NotFound(_)) {
                return FetchError::NotFound {
                    id: id.to_string(),
                    version: version.clone(),
                };
            }
            return FetchError::Http(non_retryable.to_string());
        }
        if let Some(req_err) = error.downcast_ref::<reqwest::Error>() {
            if req_err.is_timeout() {
                return FetchError::Timeout;
            }
        }
        FetchError::Http(error.to_string())
    }
}

#[async_trait]
impl PackageFetcher for HttpFetcher {
    #[tracing::instrument(skip(self))]
    async fn fetch(
        &self,
        id: &str,
        version: &Version,
        dest_dir: &Path,
    ) -> Result<PathBuf, FetchError> {
        let url = self.package_url(id, version);
        std::fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(format!("{}.{}.pkg", id, version));

        info!("Fetching {}@{} from {}...", id, version, url);
        let dest_for_writer = dest.clone();
        self.client
            .download_file(&url, || {
                let file = std::fs::File::create(&dest_for_writer).with_context(|| {
                    format!("Failed to create artifact file at {:?}", dest_for_writer)
                })?;
                Ok(file)
            })
            .await
            .map_err(|e| {
                // A half-written artifact must not be picked up by a later scan.
                let _ = std::fs::remove_file(&dest);
                Self::map_error(id, version, e)
            })?;

        info!("Saved artifact to {:?}", dest);
        Ok(dest)
    }
}
