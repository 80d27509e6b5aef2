//! HTTP client with built-in retry logic and error handling.

use anyhow::{Context, Result};
use log::{debug, warn};
use reqwest::Client;
use std::io::Write;

use super::retry::{MAX_RETRIES, NonRetryableError, RETRY_DELAY_MS, check_retryable};

/// HTTP client with built-in retry logic for network operations.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a new HTTP client wrapping the given reqwest Client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Returns a reference to the underlying reqwest Client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Downloads a file from a URL to the specified path.
    /// Automatically retries on transient errors.
    /// Uses a writer function to allow for custom file creation.
    #[tracing::instrument(skip(self, create_writer))]
    pub async fn download_file<W, F>(&self, url: &str, create_writer: F) -> Result<u64>
    where
        W: Write,
        F: Fn() -> Result<W>,
    {
        debug!("Downloading file from {}...", url);

        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match self.download_file_once(url, &create_writer).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    // Check if this is a non-retryable error
                    if e.downcast_ref::<NonRetryableError>().is_some() {
                        return Err(e);
                    }

                    if attempt < MAX_RETRIES {
                        warn!(
                            "Download attempt {}/{} failed ({}), retrying...",
                            attempt, MAX_RETRIES, e
                        );
                        last_error = Some(e);
                        tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS)).await;
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Download failed after {} attempts", MAX_RETRIES)))
    }

    /// Single download attempt without retry.
    async fn download_file_once<W, F>(&self, url: &str, create_writer: &F) -> Result<u64>
    where
        W: Write,
        F: Fn() -> Result<W>,
    {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to start download request")?;

        let mut response = response.error_for_status().map_err(check_retryable)?;

        let mut writer = create_writer()?;
        let mut downloaded_bytes: u64 = 0;

        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed to read chunk from download stream")?
        {
            writer
                .write_all(&chunk)
                .context("Failed to write chunk to file")?;
            downloaded_bytes += chunk.len() as u64;
        }

        debug!(
            "Downloaded {:.2} MB",
            downloaded_bytes as f64 / (1024.0 * 1024.0)
        );

        Ok(downloaded_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;

    #[tokio::test]
    async fn test_download_file() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let mock = server
            .mock("GET", "/acme.geo.1.0.0.pkg")
            .with_status(200)
            .with_body("package bytes")
            .create_async()
            .await;

        let http_client = HttpClient::new(Client::new());
        let result = http_client
            .download_file(&format!("{}/acme.geo.1.0.0.pkg", url), || {
                Ok(std::io::sink())
            })
            .await;

        mock.assert_async().await;
        assert_eq!(result.unwrap(), "package bytes".len() as u64);
    }

    #[tokio::test]
    async fn test_download_file_not_found() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let mock = server
            .mock("GET", "/missing.pkg")
            .with_status(404)
            .create_async()
            .await;

        let http_client = HttpClient::new(Client::new());
        let result = http_client
            .download_file(&format!("{}/missing.pkg", url), || {
                Ok(std::io::sink())
            })
            .await;

        mock.assert_async().await;
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NonRetryableError>(),
            Some(NonRetryableError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_download_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let mock = server
            .mock("GET", "/flaky.pkg")
            .with_status(500)
            .expect(MAX_RETRIES)
            .create_async()
            .await;

        let http_client = HttpClient::new(Client::new());
        let result = http_client
            .download_file(&format!("{}/flaky.pkg", url), || Ok(std::io::sink()))
            .await;

        mock.assert_async().await;
        assert!(result.is_err());
    }
}
