pub mod openai;
pub mod types;

pub use openai::OpenAiCompatibleClient;
pub use types::{
    LLMClient, LLMClientCompletionRequest, LLMClientCompletionResponse, LLMClientError,
    LLMClientMessage, LLMClientRole, MessageContent, MessagePart,
};
