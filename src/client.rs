use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DEFAULT_CONCURRENCY};
use crate::dispatch::batch::{BatchDispatcher, BatchJob};
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::{CallParams, ChatMessage, Outcome, millis};
use crate::error::FarmError;

/// Handle to one inference server: owns the connection pool and base URL.
///
/// Construct once and pass it where needed; dropping it closes the pool.
#[derive(Clone)]
pub struct ApiPoolClient {
    dispatcher: BatchDispatcher<HttpDispatch>,
}

impl ApiPoolClient {
    pub fn new(server_url: &str) -> Result<Self, FarmError> {
        Self::with_options(server_url, None, DEFAULT_CONCURRENCY)
    }

    pub fn with_options(
        server_url: &str,
        api_key: Option<String>,
        pool_size: usize,
    ) -> Result<Self, FarmError> {
        let http = HttpDispatch::new(server_url, api_key, pool_size)?;
        Ok(Self {
            dispatcher: BatchDispatcher::new(Arc::new(http)),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, FarmError> {
        Self::with_options(&config.server_url, config.api_key.clone(), config.concurrency)
    }

    pub fn server_url(&self) -> &str {
        self.dispatcher.backend().server_url()
    }

    /// Single request, bounded by `timeout`.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        params: &CallParams,
        timeout: Duration,
    ) -> Result<Value, FarmError> {
        params.validate()?;
        tokio::time::timeout(timeout, self.dispatcher.backend().query(messages, params))
            .await
            .map_err(|_| FarmError::Timeout(millis(timeout)))?
    }

    /// One outcome per conversation, in input order. Only invalid arguments
    /// produce `Err`; per-request failures are inside the returned outcomes.
    pub async fn batch_chat_completions(
        &self,
        batch_messages: Vec<Vec<ChatMessage>>,
        model: &str,
        temperature: f64,
        max_tokens: u32,
        concurrency: usize,
        timeout: Duration,
    ) -> Result<Vec<Outcome>, FarmError> {
        let job = BatchJob::new(
            batch_messages,
            CallParams::new(model, temperature, max_tokens),
            concurrency,
            timeout,
        );
        self.dispatcher.dispatch(job).await
    }

    pub async fn batch_chat_completions_with_cancel(
        &self,
        job: BatchJob,
        cancel: CancellationToken,
    ) -> Result<Vec<Outcome>, FarmError> {
        self.dispatcher.dispatch_with_cancel(job, cancel).await
    }
}
