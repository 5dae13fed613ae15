use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use shared::{
    interaction::{KeepAlive, MiningResult, RegisterMiner},
    utils::retry,
};
use thiserror::Error;
use tracing::*;
use url::Url;

const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("fail to send request: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("status code: {status}, response: {body}")]
    Status { status: StatusCode, body: String },
    #[error("invalid endpoint: {0}")]
    Url(#[from] url::ParseError),
}

impl ApiError {
    /// Transport failures and server errors may succeed later; a 4xx is the
    /// coordinator's final answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => status.is_server_error(),
            ApiError::Url(_) => false,
        }
    }
}

/// Where solved blocks go.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn submit_result(&self, result: &MiningResult) -> Result<(), ApiError>;
}

/// HTTP client for the pool coordinator.
pub struct CoordinatorApi {
    base: Url,
    result_path: String,
    submit_retries: u32,
    retry_delay: Duration,
    client: Client,
}

impl CoordinatorApi {
    pub fn new(base: &str, result_path: &str, submit_retries: u32) -> anyhow::Result<Self> {
        // a trailing slash keeps `join` from replacing the last path segment
        let base = if base.ends_with('/') {
            Url::parse(base)?
        } else {
            Url::parse(&format!("{base}/"))?
        };
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base,
            result_path: result_path.trim_matches('/').to_string(),
            submit_retries,
            retry_delay: SUBMIT_RETRY_DELAY,
            client,
        })
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub async fn register(&self, public_key: &str, gpu_miner: bool) -> Result<(), ApiError> {
        let payload = RegisterMiner {
            public_key: public_key.to_string(),
            last_timestamp: shared::timestamp(),
            gpu_miner,
        };
        self.post("register", &payload).await
    }

    pub async fn keep_alive(&self, public_key: &str) -> Result<(), ApiError> {
        let payload = KeepAlive {
            miner_public_key: public_key.to_string(),
        };
        self.post("keep-alive", &payload).await
    }

    /// base request, any 2xx is success and the body is ignored
    async fn post<T: Serialize + Sync>(&self, endpoint: &str, data: &T) -> Result<(), ApiError> {
        let url = self.base.join(endpoint)?;
        trace!("post {url}");
        let response = self.client.post(url).json(data).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status { status, body })
    }
}

#[async_trait]
impl Coordinator for CoordinatorApi {
    async fn submit_result(&self, result: &MiningResult) -> Result<(), ApiError> {
        retry(
            || self.post(&self.result_path, result),
            self.submit_retries,
            self.retry_delay,
            ApiError::is_retryable,
        )
        .await
    }
}
