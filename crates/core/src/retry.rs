use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::transport::{ChatRequest, ChatTransport, TransportError};

pub const DEFAULT_MAX_RETRIES: usize = 5;

const SLEEP_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: TransportError,
    },
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl RetryConfig {
    pub const fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
        }
    }

    /// `base_delay * 2^attempt` plus `jitter` seconds, `attempt` counted from 0.
    pub fn backoff(&self, attempt: usize, jitter: f64) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        let base = self.base_delay.checked_mul(factor).unwrap_or(Duration::MAX);
        base.saturating_add(Duration::from_secs_f64(jitter.clamp(0.0, 1.0)))
    }

    fn attempts(&self) -> usize {
        self.max_retries.max(1)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

pub trait Sleeper: Send + Sync {
    /// Waits for `duration`; may return early once `cancel` fires.
    fn sleep(&self, duration: Duration, cancel: &CancellationToken);
}

/// Blocks the calling thread only, waking periodically to honour cancellation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) {
        let deadline = Instant::now() + duration;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

pub trait JitterSource: Send + Sync {
    /// A value in `[0, 1)`.
    fn jitter(&self) -> f64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn jitter(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn jitter(&self) -> f64 {
        self.0
    }
}

/// Collaborators the retry loop needs besides the operation itself.
#[derive(Clone, Copy)]
pub struct RetryContext<'a> {
    pub sleeper: &'a dyn Sleeper,
    pub jitter: &'a dyn JitterSource,
    pub sink: &'a dyn LogSink,
    pub cancel: &'a CancellationToken,
    /// Called with the failed attempt number and the wait before the next one.
    pub on_retry: Option<&'a dyn Fn(usize, Duration)>,
}

/// Runs `f` until it succeeds, at most `config.max_retries` times.
///
/// `f` receives the zero-based attempt number. A cancelled token or a
/// cancelled transport error stops the loop without another attempt.
pub fn call_with_retry<F, T>(
    mut f: F,
    config: &RetryConfig,
    ctx: RetryContext<'_>,
) -> Result<T, RetryError>
where
    F: FnMut(usize) -> Result<T, TransportError>,
{
    let attempts = config.attempts();
    let mut last_error: Option<TransportError> = None;

    for attempt in 0..attempts {
        if ctx.cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match f(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_cancelled() => return Err(RetryError::Cancelled),
            Err(err) => {
                if attempt + 1 < attempts {
                    let wait = config.backoff(attempt, ctx.jitter.jitter());
                    ctx.sink.log(LogRecord::new(
                        LogLevel::Warn,
                        format!(
                            "第 {} 次调用失败，{:.2} 秒后重试... 错误: {}",
                            attempt + 1,
                            wait.as_secs_f64(),
                            err
                        ),
                    ));
                    if let Some(on_retry) = ctx.on_retry {
                        on_retry(attempt + 1, wait);
                    }
                    ctx.sleeper.sleep(wait, ctx.cancel);
                } else {
                    ctx.sink.log(LogRecord::new(
                        LogLevel::Error,
                        format!(
                            "第 {} 次调用失败，已达到最大重试次数。错误: {}",
                            attempt + 1,
                            err
                        ),
                    ));
                }
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(source) => Err(RetryError::RetryExhausted { attempts, source }),
        None => Err(RetryError::Cancelled),
    }
}

/// Sends one chat request through `transport` with backoff.
///
/// An empty message list is rejected before the transport is touched.
pub fn call_transport_with_retry<T>(
    transport: &T,
    request: &ChatRequest<'_>,
    on_fragment: &mut dyn FnMut(&str),
    config: &RetryConfig,
    ctx: RetryContext<'_>,
) -> Result<String, RetryError>
where
    T: ChatTransport + ?Sized,
{
    if request.messages.is_empty() {
        return Err(RetryError::InvalidRequest("消息序列为空".to_string()));
    }
    if request.model.trim().is_empty() {
        return Err(RetryError::InvalidRequest("未指定模型名称".to_string()));
    }

    call_with_retry(
        |_| transport.stream(request, &mut *on_fragment, ctx.cancel),
        config,
        ctx,
    )
}
