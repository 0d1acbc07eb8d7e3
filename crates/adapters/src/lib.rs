mod chat;
mod endpoint;
mod error;
mod sse;

pub use chat::{create_chat_transport, create_chat_transport_from_profile, OpenAiChatTransport};
pub use endpoint::{
    chat_completions_url, check_base_url, default_base_url, is_supported_format,
    resolve_base_url,
};
pub use error::AdapterError;
pub use sse::{parse_event, SseFragments};

pub use story_core::config::{Config, ConfigStore, LlmConfig};
pub use story_core::transport::{ChatRequest, ChatTransport, TransportError, TransportErrorKind};
