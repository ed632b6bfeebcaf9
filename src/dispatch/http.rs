use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::dispatch::{CallParams, ChatBackend, ChatMessage};
use crate::error::FarmError;

pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Path appended to the server URL for every call.
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// OpenAI-compatible chat completion backend over a pooled reqwest client.
pub struct HttpDispatch {
    client: Client,
    server_url: String,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
}

impl HttpDispatch {
    /// `max_idle_per_host` should match the batch concurrency so pooled
    /// connections are reused instead of reopened per request.
    pub fn new(
        server_url: &str,
        api_key: Option<String>,
        max_idle_per_host: usize,
    ) -> Result<Self, FarmError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(max_idle_per_host)
            .build()?;

        let server_url = server_url.trim_end_matches('/').to_string();
        if server_url.is_empty() {
            return Err(FarmError::Config("server_url must not be empty".to_string()));
        }
        let endpoint = format!("{server_url}{CHAT_COMPLETIONS_PATH}");

        Ok(Self {
            client,
            server_url,
            endpoint,
            api_key,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn query(
        &self,
        messages: &[ChatMessage],
        params: &CallParams,
    ) -> Result<Value, FarmError> {
        let body = ChatCompletionRequest {
            model: &params.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let mut response = request.send().await?;
        let status = response.status();
        let server = self.server_url.clone();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FarmError::RateLimited { server });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FarmError::AuthFailed {
                server,
                message: format!("{status}"),
            });
        }

        // Refuse oversized bodies before buffering them.
        if let Some(len) = response.content_length()
            && len > MAX_RESPONSE_BYTES as u64
        {
            return Err(FarmError::Upstream {
                server,
                message: format!("response too large: {len} bytes (max {MAX_RESPONSE_BYTES})"),
                status: (!status.is_success()).then_some(status.as_u16()),
            });
        }

        if !status.is_success() {
            // Error bodies are diagnostic only: keep what fits, ignore read failures.
            let (error_bytes, _) = read_capped(&mut response, MAX_RESPONSE_BYTES)
                .await
                .unwrap_or_default();
            let text = String::from_utf8_lossy(&error_bytes);
            return Err(FarmError::Upstream {
                server,
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }

        // Chunked bodies carry no Content-Length; stop reading at the cap.
        let (bytes, truncated) = read_capped(&mut response, MAX_RESPONSE_BYTES).await?;
        if truncated {
            return Err(FarmError::Upstream {
                server,
                message: format!("response too large: exceeds {MAX_RESPONSE_BYTES} bytes"),
                status: None,
            });
        }

        let completion: Value = serde_json::from_slice(&bytes)
            .map_err(|e| FarmError::SchemaParse(format!("failed to parse response: {e}")))?;

        check_completion(&server, completion)
    }
}

/// Read the body chunk by chunk, never buffering more than `limit` bytes.
/// The flag is true when the body was longer than `limit`.
async fn read_capped(
    response: &mut reqwest::Response,
    limit: usize,
) -> Result<(Vec<u8>, bool), reqwest::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = limit - buf.len();
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            return Ok((buf, true));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok((buf, false))
}

/// Some servers report failures as a 2xx body with an `error` object.
fn check_completion(server: &str, completion: Value) -> Result<Value, FarmError> {
    if completion.get("choices").is_some() {
        return Ok(completion);
    }
    let message = match completion.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(err) => err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
        None => "response has no choices".to_string(),
    };
    Err(FarmError::Upstream {
        server: server.to_string(),
        message,
        status: None,
    })
}

impl ChatBackend for HttpDispatch {
    async fn call(
        &self,
        messages: &[ChatMessage],
        params: &CallParams,
    ) -> Result<Value, FarmError> {
        self.query(messages, params).await
    }
}
