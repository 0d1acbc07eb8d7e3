use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::message::format_message_log;
use crate::output::{StoryDocument, StorySink};
use crate::retry::{
    call_transport_with_retry, JitterSource, RandomJitter, RetryConfig, RetryContext,
    RetryError, Sleeper, ThreadSleeper,
};
use crate::transport::{ChatRequest, ChatTransport};

use super::stage::{build_turn, StagePlan};
use super::{ConversationError, ConversationState};

const MESSAGE_LOG_RULE_WIDTH: usize = 80;

/// Model name and sampling temperature shared by every stage of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationSettings {
    pub model: String,
    pub temperature: f32,
}

impl GenerationSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 1.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Progress hooks for live display. Every method defaults to doing nothing.
pub trait ConversationObserver {
    fn stage_started(&self, _stage: usize, _name: &str) {}

    fn fragment(&self, _stage: usize, _fragment: &str) {}

    /// Attempt `attempt` of `stage` failed; the next one starts after `delay`.
    /// Fragments already reported for this stage belong to the failed attempt.
    fn stage_retry(&self, _stage: usize, _attempt: usize, _delay: Duration) {}

    fn stage_finished(&self, _stage: usize, _name: &str, _output: &str) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl ConversationObserver for NoopObserver {}

/// What a completed run produced.
#[derive(Clone, Debug)]
pub struct ConversationOutcome {
    pub document: StoryDocument,
    pub files: Vec<PathBuf>,
}

impl ConversationOutcome {
    pub fn story(&self) -> &str {
        &self.document.story
    }
}

/// Walks a [`ConversationState`] through every stage of a [`StagePlan`],
/// strictly one stage at a time.
pub struct ConversationDriver<'a, T: ChatTransport + ?Sized> {
    transport: &'a T,
    settings: GenerationSettings,
    plan: StagePlan,
    retry: RetryConfig,
    sink: &'a dyn LogSink,
    sleeper: &'a dyn Sleeper,
    jitter: &'a dyn JitterSource,
    observer: &'a dyn ConversationObserver,
    output: Option<&'a dyn StorySink>,
    checkpoint_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl<'a, T: ChatTransport + ?Sized> ConversationDriver<'a, T> {
    pub fn new(transport: &'a T, settings: GenerationSettings, sink: &'a dyn LogSink) -> Self {
        Self {
            transport,
            settings,
            plan: StagePlan::canonical(),
            retry: RetryConfig::default(),
            sink,
            sleeper: &ThreadSleeper,
            jitter: &RandomJitter,
            observer: &NoopObserver,
            output: None,
            checkpoint_dir: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_plan(mut self, plan: StagePlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.retry.max_retries = max_retries.max(1);
        self
    }

    pub fn with_sleeper(mut self, sleeper: &'a dyn Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_jitter(mut self, jitter: &'a dyn JitterSource) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn ConversationObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_output(mut self, output: &'a dyn StorySink) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Starts a fresh run: previous outputs in `state` are discarded.
    pub fn run(
        &self,
        state: &mut ConversationState,
    ) -> Result<ConversationOutcome, ConversationError> {
        state.begin(self.plan.len())?;
        self.log(
            LogLevel::Info,
            format!("开始新的生成流程，共 {} 个阶段。", self.plan.len()),
        );
        self.drive(state)
    }

    /// Continues from the first stage without a recorded output.
    ///
    /// A state that already finished every stage is returned as is, without
    /// contacting the transport or delivering the story again.
    pub fn resume(
        &self,
        state: &mut ConversationState,
    ) -> Result<ConversationOutcome, ConversationError> {
        state.resume(self.plan.len())?;
        if state.is_done() {
            self.log(LogLevel::Info, "全部阶段此前已完成，无需继续生成。");
            let document = StoryDocument::from_state(&self.plan, state)?;
            return Ok(ConversationOutcome {
                document,
                files: Vec::new(),
            });
        }
        self.log(
            LogLevel::Info,
            format!(
                "从第 {} 阶段继续生成（已完成 {} 个阶段）。",
                state.completed_stages() + 1,
                state.completed_stages()
            ),
        );
        self.drive(state)
    }

    fn drive(
        &self,
        state: &mut ConversationState,
    ) -> Result<ConversationOutcome, ConversationError> {
        for stage in state.completed_stages()..self.plan.len() {
            if self.cancel.is_cancelled() {
                self.log(LogLevel::Warn, format!("第 {} 阶段开始前已取消。", stage + 1));
                return Err(ConversationError::Cancelled { stage });
            }
            state.enter(stage);
            self.execute_stage(state, stage)?;
        }

        state.finish();
        self.log(LogLevel::Info, "全部阶段完成！");

        let document = StoryDocument::from_state(&self.plan, state)?;
        let files = match self.output {
            Some(output) => output.deliver(&document)?,
            None => Vec::new(),
        };
        for path in &files {
            self.log(LogLevel::Info, format!("结果已保存至: {}", path.display()));
        }

        if let Some(dir) = &self.checkpoint_dir {
            self.cleanup_checkpoint(dir)?;
        }

        Ok(ConversationOutcome { document, files })
    }

    fn execute_stage(
        &self,
        state: &mut ConversationState,
        stage: usize,
    ) -> Result<(), ConversationError> {
        let name = self.plan.stage_name(stage);
        let turn = build_turn(&self.plan, state, stage)?;

        self.log(
            LogLevel::Info,
            format!(
                "第 {} 阶段（{}）：发送 {} 条消息...",
                stage + 1,
                name,
                turn.messages.len()
            ),
        );
        self.log(
            LogLevel::Debug,
            format_message_log(&turn.messages, stage, MESSAGE_LOG_RULE_WIDTH),
        );
        self.observer.stage_started(stage, name);

        let request = ChatRequest::new(
            &turn.messages,
            &self.settings.model,
            self.settings.temperature,
        );
        let observer = self.observer;
        let on_retry =
            |attempt: usize, delay: Duration| observer.stage_retry(stage, attempt, delay);
        let ctx = RetryContext {
            sleeper: self.sleeper,
            jitter: self.jitter,
            sink: self.sink,
            cancel: &self.cancel,
            on_retry: Some(&on_retry),
        };
        let mut on_fragment = |fragment: &str| observer.fragment(stage, fragment);

        let output = match call_transport_with_retry(
            self.transport,
            &request,
            &mut on_fragment,
            &self.retry,
            ctx,
        ) {
            Ok(output) => output,
            Err(RetryError::Cancelled) => {
                self.log(
                    LogLevel::Warn,
                    format!("第 {} 阶段（{}）已取消，未记录输出。", stage + 1, name),
                );
                return Err(ConversationError::Cancelled { stage });
            }
            Err(source) => {
                self.log(
                    LogLevel::Error,
                    format!("第 {} 阶段（{}）失败：{}", stage + 1, name, source),
                );
                self.save_checkpoint(state);
                return Err(ConversationError::Stage {
                    stage,
                    name,
                    source,
                });
            }
        };

        if output.trim().is_empty() {
            self.log(
                LogLevel::Warn,
                format!("第 {} 阶段（{}）模型返回内容为空。", stage + 1, name),
            );
        }

        state.record_output(stage, turn.composed_input, output)?;
        self.log(
            LogLevel::Info,
            format!(
                "第 {} 阶段（{}）完成，输出 {} 字。",
                stage + 1,
                name,
                state.output(stage).map(|o| o.chars().count()).unwrap_or(0)
            ),
        );
        self.observer
            .stage_finished(stage, name, state.output(stage).unwrap_or_default());
        self.save_checkpoint(state);
        Ok(())
    }

    fn save_checkpoint(&self, state: &ConversationState) {
        let Some(dir) = &self.checkpoint_dir else {
            return;
        };
        match state.save_to_dir(dir) {
            Ok(path) => self.log(
                LogLevel::Debug,
                format!("阶段性数据已保存至 {}", path.display()),
            ),
            Err(err) => self.log(LogLevel::Warn, format!("无法保存阶段性数据：{err}")),
        }
    }

    fn cleanup_checkpoint(&self, dir: &Path) -> Result<(), ConversationError> {
        if ConversationState::remove_checkpoint(dir)? {
            self.log(
                LogLevel::Info,
                format!("{} 已移除（全部阶段完成）。", super::CHECKPOINT_FILE_NAME),
            );
        }
        Ok(())
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::VecLogSink;
    use crate::message::Message;
    use crate::retry::FixedJitter;
    use crate::transport::{aggregate_fragments, TransportError, TransportErrorKind};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&self, _duration: Duration, _cancel: &CancellationToken) {}
    }

    struct MockTransport {
        responses: Mutex<VecDeque<Result<String, TransportErrorKind>>>,
        requests: Mutex<Vec<Vec<Message>>>,
    }

    impl MockTransport {
        fn new(responses: Vec<Result<String, TransportErrorKind>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<Vec<Message>> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl ChatTransport for MockTransport {
        fn stream(
            &self,
            request: &ChatRequest<'_>,
            on_fragment: &mut dyn FnMut(&str),
            cancel: &CancellationToken,
        ) -> Result<String, TransportError> {
            self.requests.lock().unwrap().push(request.messages.to_vec());
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok(text)) => {
                    let (head, tail) = text.split_at(text.len() / 2);
                    aggregate_fragments(
                        vec![Ok(Some(head.to_string())), Ok(Some(tail.to_string()))],
                        Some(on_fragment),
                        cancel,
                    )
                }
                Some(Err(kind)) => Err(TransportError::new(kind, "mock failure")),
                None => Err(TransportError::new(TransportErrorKind::Other, "no response")),
            }
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl ConversationObserver for RecordingObserver {
        fn stage_started(&self, stage: usize, _name: &str) {
            self.events.lock().unwrap().push(format!("start{stage}"));
        }

        fn fragment(&self, stage: usize, fragment: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("frag{stage}:{fragment}"));
        }

        fn stage_retry(&self, stage: usize, attempt: usize, delay: Duration) {
            self.events
                .lock()
                .unwrap()
                .push(format!("retry{stage}:{attempt}:{}", delay.as_secs()));
        }

        fn stage_finished(&self, stage: usize, _name: &str, output: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("done{stage}:{output}"));
        }
    }

    #[derive(Default)]
    struct CapturingSink {
        documents: Mutex<Vec<StoryDocument>>,
    }

    impl StorySink for CapturingSink {
        fn deliver(
            &self,
            document: &StoryDocument,
        ) -> Result<Vec<PathBuf>, crate::output::OutputError> {
            let mut documents = self.documents.lock().unwrap();
            documents.push(document.clone());
            Ok(vec![PathBuf::from(format!("story_{}.txt", documents.len()))])
        }
    }

    fn lifecycle(events: &[String]) -> Vec<String> {
        events
            .iter()
            .filter(|event| !event.starts_with("frag"))
            .cloned()
            .collect()
    }

    fn inputs() -> Vec<String> {
        (1..=5).map(|i| format!("U{i}")).collect()
    }

    fn responses() -> Vec<Result<String, TransportErrorKind>> {
        (1..=5).map(|i| Ok(format!("AA{i}"))).collect()
    }

    #[test]
    fn runs_all_stages_in_order() {
        let transport = MockTransport::new(responses());
        let sink = VecLogSink::new();
        let observer = RecordingObserver::default();
        let driver = ConversationDriver::new(&transport, GenerationSettings::new("m"), &sink)
            .with_sleeper(&NoSleep)
            .with_observer(&observer);
        let mut state = ConversationState::new("系统", inputs());

        let outcome = driver.run(&mut state).unwrap();

        assert!(state.is_done());
        assert_eq!(state.assistant_outputs().len(), 5);
        assert_eq!(outcome.story(), "AA1\nAA3\nAA4\nAA5");
        let requests = transport.requests();
        assert_eq!(requests.len(), 5);
        assert_eq!(
            requests[1].last(),
            Some(&Message::user("【导语】：\nAA1\nU2"))
        );
        let events = lifecycle(&observer.events.lock().unwrap());
        assert_eq!(events[0], "start0");
        assert_eq!(events[1], "done0:AA1");
        assert_eq!(events.len(), 10);
    }

    #[test]
    fn intro_only_plan_finishes_after_one_exchange() {
        let transport = MockTransport::new(vec![Ok("新的导语".to_string())]);
        let sink = VecLogSink::new();
        let output = CapturingSink::default();
        let driver = ConversationDriver::new(&transport, GenerationSettings::new("m"), &sink)
            .with_plan(StagePlan::intro_only())
            .with_sleeper(&NoSleep)
            .with_output(&output);
        let mut state = ConversationState::new("自定义系统提示", ["改写这段导语"]);

        let outcome = driver.run(&mut state).unwrap();

        assert!(state.is_done());
        assert_eq!(state.assistant_outputs(), ["新的导语"]);
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0],
            vec![
                Message::system("自定义系统提示"),
                Message::user("改写这段导语")
            ]
        );
        assert_eq!(outcome.story(), "新的导语");
        let delivered = output.documents.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].story, "新的导语");
        assert_eq!(delivered[0].stages.len(), 1);
    }

    #[test]
    fn failed_attempt_is_reported_before_the_stream_restarts() {
        let transport = MockTransport::new(vec![
            Ok("AA1".to_string()),
            Err(TransportErrorKind::Timeout),
            Ok("BB2".to_string()),
        ]);
        let sink = VecLogSink::new();
        let observer = RecordingObserver::default();
        let driver = ConversationDriver::new(&transport, GenerationSettings::new("m"), &sink)
            .with_plan(StagePlan::new(&StagePlan::canonical().stages()[..2]))
            .with_sleeper(&NoSleep)
            .with_jitter(&FixedJitter(0.0))
            .with_observer(&observer);
        let mut state = ConversationState::new("系统", ["U1", "U2"]);

        driver.run(&mut state).unwrap();

        let events = observer.events.lock().unwrap().clone();
        let retry = events.iter().position(|e| e == "retry1:1:1").unwrap();
        let first_fragment = events.iter().position(|e| e == "frag1:B").unwrap();
        assert!(retry < first_fragment);
        assert_eq!(events.last().map(String::as_str), Some("done1:BB2"));
        assert_eq!(events.iter().filter(|e| e.starts_with("retry")).count(), 1);
    }

    #[test]
    fn resuming_a_finished_state_delivers_nothing() {
        let transport = MockTransport::new(responses());
        let sink = VecLogSink::new();
        let output = CapturingSink::default();
        let driver = ConversationDriver::new(&transport, GenerationSettings::new("m"), &sink)
            .with_sleeper(&NoSleep)
            .with_output(&output);
        let mut state = ConversationState::new("系统", inputs());
        driver.run(&mut state).unwrap();
        assert_eq!(output.documents.lock().unwrap().len(), 1);

        let outcome = driver.resume(&mut state).unwrap();

        assert!(state.is_done());
        assert!(outcome.files.is_empty());
        assert_eq!(outcome.story(), "AA1\nAA3\nAA4\nAA5");
        assert_eq!(output.documents.lock().unwrap().len(), 1);
        assert_eq!(transport.requests().len(), 5);
    }

    #[test]
    fn retry_exhaustion_halts_at_failing_stage() {
        let mut script = vec![Ok("AA1".to_string()), Ok("AA2".to_string())];
        script.extend((0..3).map(|_| Err(TransportErrorKind::Timeout)));
        let transport = MockTransport::new(script);
        let sink = VecLogSink::new();
        let driver = ConversationDriver::new(&transport, GenerationSettings::new("m"), &sink)
            .with_sleeper(&NoSleep)
            .with_jitter(&FixedJitter(0.0))
            .with_max_retries(3);
        let mut state = ConversationState::new("系统", inputs());

        let err = driver.run(&mut state).unwrap_err();

        assert!(matches!(
            err,
            ConversationError::Stage {
                stage: 2,
                source: RetryError::RetryExhausted { attempts: 3, .. },
                ..
            }
        ));
        assert_eq!(state.assistant_outputs(), ["AA1", "AA2"]);
        assert_eq!(state.position(), crate::conversation::StagePosition::Stage(2));
    }

    #[test]
    fn incomplete_input_never_reaches_transport() {
        let transport = MockTransport::new(responses());
        let sink = VecLogSink::new();
        let driver = ConversationDriver::new(&transport, GenerationSettings::new("m"), &sink);
        let mut bad = inputs();
        bad[4].clear();
        let mut state = ConversationState::new("系统", bad);

        let err = driver.run(&mut state).unwrap_err();

        assert!(matches!(err, ConversationError::IncompleteInput { .. }));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn cancelled_before_start_records_nothing() {
        let transport = MockTransport::new(responses());
        let sink = VecLogSink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let driver = ConversationDriver::new(&transport, GenerationSettings::new("m"), &sink)
            .with_cancel_token(cancel);
        let mut state = ConversationState::new("系统", inputs());

        let err = driver.run(&mut state).unwrap_err();

        assert!(matches!(err, ConversationError::Cancelled { stage: 0 }));
        assert_eq!(state.completed_stages(), 0);
        assert!(transport.requests().is_empty());
    }
}
