use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LLMClientRole {
    System,
    User,
    Assistant,
}

impl LLMClientRole {
    pub fn is_system(&self) -> bool {
        matches!(self, LLMClientRole::System)
    }

    pub fn is_user(&self) -> bool {
        matches!(self, LLMClientRole::User)
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, LLMClientRole::Assistant)
    }
}

/// Multi-modal message parts. Images travel as data URLs so the wire shape
/// matches the OpenAI-compatible `image_url` contract.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    ImageUrl { image_url: ImageUrlPart },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImageUrlPart {
    pub url: String,
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    pub fn image_data_url(format: &str, base64_payload: &str) -> Self {
        MessagePart::ImageUrl {
            image_url: ImageUrlPart {
                url: format!("data:image/{};base64,{}", format.to_lowercase(), base64_payload),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<MessagePart>),
}

impl MessageContent {
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    MessagePart::Text { text } => Some(text.as_str()),
                    MessagePart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct LLMClientMessage {
    role: LLMClientRole,
    content: MessageContent,
}

impl LLMClientMessage {
    pub fn new(role: LLMClientRole, content: MessageContent) -> Self {
        Self { role, content }
    }

    pub fn system(message: String) -> Self {
        Self::new(LLMClientRole::System, MessageContent::Text(message))
    }

    pub fn user(message: String) -> Self {
        Self::new(LLMClientRole::User, MessageContent::Text(message))
    }

    pub fn user_with_parts(parts: Vec<MessagePart>) -> Self {
        Self::new(LLMClientRole::User, MessageContent::Parts(parts))
    }

    pub fn assistant(message: String) -> Self {
        Self::new(LLMClientRole::Assistant, MessageContent::Text(message))
    }

    pub fn role(&self) -> &LLMClientRole {
        &self.role
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }
}

#[derive(Debug, Clone)]
pub struct LLMClientCompletionRequest {
    model: String,
    messages: Vec<LLMClientMessage>,
    temperature: f32,
    max_tokens: Option<usize>,
}

impl LLMClientCompletionRequest {
    pub fn new(model: String, messages: Vec<LLMClientMessage>, temperature: f32) -> Self {
        Self {
            model,
            messages,
            temperature,
            max_tokens: None,
        }
    }

    pub fn set_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn messages(&self) -> &[LLMClientMessage] {
        &self.messages
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn get_max_tokens(&self) -> Option<usize> {
        self.max_tokens
    }
}

#[derive(Debug)]
pub struct LLMClientCompletionResponse {
    answer_up_until_now: String,
    delta: Option<String>,
    model: String,
}

impl LLMClientCompletionResponse {
    pub fn new(answer_up_until_now: String, delta: Option<String>, model: String) -> Self {
        Self {
            answer_up_until_now,
            delta,
            model,
        }
    }

    pub fn answer_up_until_now(&self) -> &str {
        &self.answer_up_until_now
    }

    pub fn delta(&self) -> Option<&str> {
        self.delta.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Error, Debug)]
pub enum LLMClientError {
    #[error("failed to get response from LLM")]
    FailedToGetResponse,

    #[error("LLM provider unavailable: {0}")]
    Unavailable(String),

    #[error("LLM provider rejected credentials")]
    Auth,

    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("serde failed: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("send error over channel")]
    SendError,
}

#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Stream tokens into `sender`, returning the concatenated answer.
    async fn stream_completion(
        &self,
        request: LLMClientCompletionRequest,
        sender: UnboundedSender<LLMClientCompletionResponse>,
    ) -> Result<String, LLMClientError>;

    async fn completion(
        &self,
        request: LLMClientCompletionRequest,
    ) -> Result<String, LLMClientError> {
        let (sender, _receiver) = tokio::sync::mpsc::unbounded_channel();
        self.stream_completion(request, sender).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_content_serialises_both_shapes() {
        let plain = LLMClientMessage::user("hello".to_owned());
        let json = serde_json::to_value(&plain).unwrap();
        assert_eq!(json["content"], "hello");
        assert_eq!(json["role"], "user");

        let parts = LLMClientMessage::user_with_parts(vec![
            MessagePart::text("look at this"),
            MessagePart::image_data_url("PNG", "Zm9v"),
        ]);
        let json = serde_json::to_value(&parts).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(
            json["content"][1]["image_url"]["url"],
            "data:image/png;base64,Zm9v"
        );
    }

    #[test]
    fn test_as_text_skips_images() {
        let content = MessageContent::Parts(vec![
            MessagePart::text("a"),
            MessagePart::image_data_url("png", "xxx"),
            MessagePart::text("b"),
        ]);
        assert_eq!(content.as_text(), "a\nb");
    }
}
