use std::io::BufReader;
use std::iter;
use std::time::Duration;

use log::{debug, warn};
use reqwest::blocking::{Client, Response};
use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use story_core::config::{Config, LlmConfig};
use story_core::message::Message;
use story_core::transport::{aggregate_fragments, ChatRequest, ChatTransport, TransportError};

use crate::endpoint::{chat_completions_url, resolve_base_url};
use crate::error::AdapterError;
use crate::sse::SseFragments;

/// An OpenAI-compatible `/chat/completions` endpoint reached over blocking
/// HTTP. One instance may serve many runs concurrently.
#[derive(Debug, Clone)]
pub struct OpenAiChatTransport {
    client: Client,
    url: String,
    api_key: Option<String>,
    max_tokens: Option<u32>,
    stream: bool,
}

impl OpenAiChatTransport {
    pub fn new(profile: &LlmConfig) -> Result<Self, AdapterError> {
        let base_url = resolve_base_url(&profile.base_url, &profile.interface_format)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(profile.timeout.max(1)))
            .build()?;

        Ok(Self {
            client,
            url: chat_completions_url(&base_url),
            api_key: optional_string(&profile.api_key),
            max_tokens: profile.max_tokens(),
            stream: profile.stream,
        })
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_streaming(&self) -> bool {
        self.stream
    }

    fn send(&self, request: &ChatRequest<'_>) -> Result<Response, AdapterError> {
        let body = ChatCompletionRequest {
            model: request.model,
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: self.max_tokens,
            stream: self.stream,
        };

        let mut builder = self.client.post(&self.url).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(
            "POST {} ({} messages, stream={})",
            self.url,
            request.messages.len(),
            self.stream
        );
        let response = builder.json(&body).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            warn!("chat completion returned {status}: {body}");
            return Err(AdapterError::HttpStatus { status, body });
        }
        Ok(response)
    }
}

impl ChatTransport for OpenAiChatTransport {
    fn stream(
        &self,
        request: &ChatRequest<'_>,
        on_fragment: &mut dyn FnMut(&str),
        cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::cancelled());
        }

        let response = self.send(request)?;
        if self.stream {
            return aggregate_fragments(
                SseFragments::new(BufReader::new(response)),
                Some(on_fragment),
                cancel,
            );
        }

        let parsed: ChatCompletionResponse = response.json().map_err(AdapterError::from)?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(AdapterError::EmptyResponse)?;
        aggregate_fragments(iter::once(Ok(Some(content))), Some(on_fragment), cancel)
    }
}

pub fn create_chat_transport(
    config: &Config,
    profile_name: &str,
) -> Result<OpenAiChatTransport, AdapterError> {
    let profile = config.get_llm_profile(profile_name).ok_or_else(|| {
        AdapterError::InvalidConfig(format!("unknown LLM profile `{}`", profile_name))
    })?;
    create_chat_transport_from_profile(profile)
}

pub fn create_chat_transport_from_profile(
    profile: &LlmConfig,
) -> Result<OpenAiChatTransport, AdapterError> {
    if profile.model_name.trim().is_empty() {
        return Err(AdapterError::InvalidConfig(
            "model_name must not be empty".to_string(),
        ));
    }
    OpenAiChatTransport::new(profile)
}

fn optional_string(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.trim().to_string())
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
