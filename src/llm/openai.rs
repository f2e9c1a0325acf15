//! OpenAI-compatible chat completions client with SSE streaming.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::types::{
    LLMClient, LLMClientCompletionRequest, LLMClientCompletionResponse, LLMClientError,
    LLMClientMessage,
};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [LLMClientMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl OpenAiCompatibleClient {
    pub fn new(api_base: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
            api_key,
        }
    }

    fn chat_endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    /// Open the SSE stream, retrying transient connection failures with
    /// exponential backoff. Once streaming has started there is no retry.
    async fn open_stream(
        &self,
        wire_request: &WireRequest<'_>,
    ) -> Result<reqwest::Response, LLMClientError> {
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                warn!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying LLM call");
                tokio::time::sleep(backoff).await;
            }

            let response = self
                .client
                .post(self.chat_endpoint())
                .bearer_auth(&self.api_key)
                .timeout(REQUEST_TIMEOUT)
                .json(wire_request)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status == reqwest::StatusCode::UNAUTHORIZED
                        || status == reqwest::StatusCode::FORBIDDEN
                    {
                        return Err(LLMClientError::Auth);
                    }
                    if !status.is_success() {
                        last_error =
                            Some(LLMClientError::Unavailable(format!("provider returned {}", status)));
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) => {
                    last_error = Some(LLMClientError::Unavailable(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or(LLMClientError::FailedToGetResponse))
    }
}

#[async_trait]
impl LLMClient for OpenAiCompatibleClient {
    async fn stream_completion(
        &self,
        request: LLMClientCompletionRequest,
        sender: UnboundedSender<LLMClientCompletionResponse>,
    ) -> Result<String, LLMClientError> {
        let model = request.model().to_owned();
        let wire_request = WireRequest {
            model: &model,
            messages: request.messages(),
            temperature: request.temperature(),
            max_tokens: request.get_max_tokens(),
            stream: true,
        };

        let response = self.open_stream(&wire_request).await?;
        let mut event_source = response.bytes_stream().eventsource();

        let mut buffered_string = String::new();
        while let Some(Ok(event)) = event_source.next().await {
            if event.data.trim() == "[DONE]" {
                break;
            }
            match serde_json::from_str::<StreamChunk>(&event.data) {
                Ok(chunk) => {
                    let Some(choice) = chunk.choices.first() else {
                        continue;
                    };
                    if let Some(content) = &choice.delta.content {
                        buffered_string.push_str(content);
                        let _ = sender.send(LLMClientCompletionResponse::new(
                            buffered_string.clone(),
                            Some(content.clone()),
                            model.clone(),
                        ));
                    }
                }
                Err(e) => {
                    debug!(error = %e, "unparseable stream chunk, skipping");
                }
            }
        }

        Ok(buffered_string)
    }
}
