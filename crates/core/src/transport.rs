use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::message::Message;

/// What one chat-completion call needs besides the endpoint itself.
#[derive(Clone, Copy, Debug)]
pub struct ChatRequest<'a> {
    pub messages: &'a [Message],
    pub model: &'a str,
    pub temperature: f32,
}

impl<'a> ChatRequest<'a> {
    pub fn new(messages: &'a [Message], model: &'a str, temperature: f32) -> Self {
        Self {
            messages,
            model,
            temperature,
        }
    }
}

/// A chat-completion endpoint.
///
/// One call issues exactly one request. Implementations feed the response
/// through [`aggregate_fragments`] so that `on_fragment` sees every non-empty
/// fragment, in order, before it lands in the returned text. Callers without
/// an observer pass a no-op closure. A triggered
/// `cancel` token abandons the call with [`TransportErrorKind::Cancelled`].
pub trait ChatTransport: Send + Sync {
    fn stream(
        &self,
        request: &ChatRequest<'_>,
        on_fragment: &mut dyn FnMut(&str),
        cancel: &CancellationToken,
    ) -> Result<String, TransportError>;
}

impl<T: ChatTransport + ?Sized> ChatTransport for Arc<T> {
    fn stream(
        &self,
        request: &ChatRequest<'_>,
        on_fragment: &mut dyn FnMut(&str),
        cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        (**self).stream(request, on_fragment, cancel)
    }
}

impl<T: ChatTransport + ?Sized> ChatTransport for Box<T> {
    fn stream(
        &self,
        request: &ChatRequest<'_>,
        on_fragment: &mut dyn FnMut(&str),
        cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        (**self).stream(request, on_fragment, cancel)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    RateLimited,
    Status(u16),
    Malformed,
    Cancelled,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("连接失败"),
            Self::Timeout => f.write_str("请求超时"),
            Self::RateLimited => f.write_str("触发限流"),
            Self::Status(code) => write!(f, "HTTP {code}"),
            Self::Malformed => f.write_str("响应格式错误"),
            Self::Cancelled => f.write_str("已取消"),
            Self::Other => f.write_str("调用失败"),
        }
    }
}

#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(kind: TransportErrorKind, message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, "调用在流式接收期间被取消")
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == TransportErrorKind::Cancelled
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|inner| inner.as_ref() as &(dyn StdError + 'static))
    }
}

/// Concatenates a lazy sequence of response fragments.
///
/// `None` and empty fragments are skipped. The callback runs before each
/// fragment is appended, so it observes exactly the aggregated text, in order.
/// The first error or a cancellation ends consumption of `fragments`.
pub fn aggregate_fragments<I>(
    fragments: I,
    mut on_fragment: Option<&mut dyn FnMut(&str)>,
    cancel: &CancellationToken,
) -> Result<String, TransportError>
where
    I: IntoIterator<Item = Result<Option<String>, TransportError>>,
{
    let mut text = String::new();
    for fragment in fragments {
        if cancel.is_cancelled() {
            return Err(TransportError::cancelled());
        }
        let Some(fragment) = fragment? else {
            continue;
        };
        if fragment.is_empty() {
            continue;
        }
        if let Some(callback) = on_fragment.as_deref_mut() {
            callback(&fragment);
        }
        text.push_str(&fragment);
    }
    Ok(text)
}
