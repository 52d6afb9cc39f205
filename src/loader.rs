use crate::metrics::Metrics;
use anyhow::Context;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const ORIGIN_TIMEOUT: Duration = Duration::from_secs(20);
const ERROR_BODY_EXCERPT: usize = 256;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("origin request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("origin returned {status}: {body_excerpt:?}")]
    Status {
        status: reqwest::StatusCode,
        body_excerpt: String,
    },
}

/// Fetches media from the upstream origin store. The loader itself never
/// caches; the pipeline wraps it with the loader cache tier.
pub struct HttpLoader {
    base_url: String,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl HttpLoader {
    /// `base_url` must already carry its single trailing slash (applied at
    /// config parse time).
    pub fn new(base_url: String, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ORIGIN_TIMEOUT)
            .build()
            .context("build origin http client")?;
        Ok(Self {
            base_url,
            client,
            metrics,
        })
    }

    /// One GET against `base_url + media_path`. Cancelling the caller
    /// drops the future and aborts the in-flight request.
    pub async fn get_media(&self, media_path: &str) -> Result<Vec<u8>, LoaderError> {
        let url = format!("{}{}", self.base_url, media_path);
        debug!(%url, "fetching origin media");
        let start = Instant::now();
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                self.metrics
                    .observe_loader(0, start.elapsed().as_secs_f64(), None);
                return Err(err.into());
            }
        };
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            // Best-effort body read so the error carries a bounded excerpt.
            let body = response.bytes().await.unwrap_or_default();
            self.metrics
                .observe_loader(status.as_u16(), start.elapsed().as_secs_f64(), None);
            let excerpt = String::from_utf8_lossy(&body[..body.len().min(ERROR_BODY_EXCERPT)])
                .into_owned();
            return Err(LoaderError::Status {
                status,
                body_excerpt: excerpt,
            });
        }
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.metrics
                    .observe_loader(status.as_u16(), start.elapsed().as_secs_f64(), None);
                return Err(err.into());
            }
        };
        self.metrics.observe_loader(
            status.as_u16(),
            start.elapsed().as_secs_f64(),
            Some(bytes.len()),
        );
        Ok(bytes.to_vec())
    }
}
