use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use story_core::conversation::{
    ConversationDriver, ConversationError, ConversationObserver, ConversationState,
    GenerationSettings,
};
use story_core::library::{FragmentLibrary, LibraryError, Seeding, StoryInputs};
use story_core::logging::{LogLevel, LogRecord, LogSink};
use story_core::output::StorySink;
use story_core::prompts::PromptRegistry;
use story_core::retry::DEFAULT_MAX_RETRIES;
use story_core::transport::ChatTransport;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type EventSender = UnboundedSender<TaskEvent>;

type TokenMap = Arc<Mutex<HashMap<RunId, CancellationToken>>>;

/// Identifies one submitted generation run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a run's system prompt and stage inputs come from.
pub enum RunInputs {
    /// Picks fresh library records for every run.
    Seeded {
        library: Arc<FragmentLibrary>,
        prompts: Arc<PromptRegistry>,
        seeding: Seeding,
        /// Replaces the registry's system prompt when set.
        system_prompt: Option<String>,
    },
    Prepared(StoryInputs),
    /// Continues a checkpointed conversation.
    Resume(ConversationState),
}

impl RunInputs {
    /// Seeded runs follow their mode; prepared and resumed ones are judged
    /// by how many stage inputs they carry.
    pub fn seeding(&self) -> Seeding {
        match self {
            RunInputs::Seeded { seeding, .. } => *seeding,
            RunInputs::Prepared(inputs) => Seeding::for_input_count(inputs.user_inputs.len()),
            RunInputs::Resume(state) => Seeding::for_input_count(state.user_inputs().len()),
        }
    }
}

impl fmt::Debug for RunInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunInputs::Seeded {
                library,
                seeding,
                system_prompt,
                ..
            } => f
                .debug_struct("Seeded")
                .field("intros", &library.intros().len())
                .field("plots", &library.plots().len())
                .field("seeding", seeding)
                .field("custom_system_prompt", &system_prompt.is_some())
                .finish(),
            RunInputs::Prepared(inputs) => f.debug_tuple("Prepared").field(inputs).finish(),
            RunInputs::Resume(state) => f
                .debug_struct("Resume")
                .field("completed_stages", &state.completed_stages())
                .finish(),
        }
    }
}

pub struct GenerateStoryCommand {
    pub transport: Arc<dyn ChatTransport>,
    pub settings: GenerationSettings,
    pub inputs: RunInputs,
    pub max_retries: usize,
    pub output: Option<Arc<dyn StorySink>>,
    /// Each run checkpoints into its own subdirectory named after its id.
    pub checkpoint_root: Option<PathBuf>,
}

impl GenerateStoryCommand {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        settings: GenerationSettings,
        inputs: RunInputs,
    ) -> Self {
        Self {
            transport,
            settings,
            inputs,
            max_retries: DEFAULT_MAX_RETRIES,
            output: None,
            checkpoint_root: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_output(mut self, output: Arc<dyn StorySink>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_checkpoint_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.checkpoint_root = Some(root.into());
        self
    }
}

impl fmt::Debug for GenerateStoryCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerateStoryCommand")
            .field("settings", &self.settings)
            .field("inputs", &self.inputs)
            .field("max_retries", &self.max_retries)
            .field("has_output", &self.output.is_some())
            .field("checkpoint_root", &self.checkpoint_root)
            .finish()
    }
}

/// Runs submitted stories on a background worker, each on its own blocking
/// thread with its own cancellation token.
#[derive(Debug)]
pub struct TaskController {
    sender: UnboundedSender<(RunId, GenerateStoryCommand, CancellationToken)>,
    receiver: UnboundedReceiver<TaskEvent>,
    tokens: TokenMap,
    _worker: thread::JoinHandle<()>,
}

impl TaskController {
    pub fn new() -> Self {
        let (command_tx, mut command_rx) =
            mpsc::unbounded_channel::<(RunId, GenerateStoryCommand, CancellationToken)>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker_tx = event_tx.clone();
        let tokens: TokenMap = Arc::new(Mutex::new(HashMap::new()));
        let worker_tokens = tokens.clone();

        let handle = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = worker_tx.send(TaskEvent::WorkerStopped(err.to_string()));
                    return;
                }
            };

            runtime.block_on(async move {
                while let Some((run, command, cancel)) = command_rx.recv().await {
                    let sender = worker_tx.clone();
                    tokio::spawn(run_command(
                        run,
                        command,
                        cancel,
                        sender,
                        worker_tokens.clone(),
                    ));
                }
            });
        });

        Self {
            sender: command_tx,
            receiver: event_rx,
            tokens,
            _worker: handle,
        }
    }

    /// Queues a run and returns its id.
    pub fn submit(&self, command: GenerateStoryCommand) -> Result<RunId, TaskSendError> {
        let run = RunId::new();
        let cancel = CancellationToken::new();
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(run, cancel.clone());
        }
        self.sender.send((run, command, cancel)).map_err(|_| {
            if let Ok(mut tokens) = self.tokens.lock() {
                tokens.remove(&run);
            }
            TaskSendError::ChannelClosed
        })?;
        Ok(run)
    }

    /// Triggers one run's token. Returns false when the run is unknown or
    /// already finished.
    pub fn cancel(&self, run: RunId) -> bool {
        match self.tokens.lock() {
            Ok(tokens) => match tokens.get(&run) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn cancel_all(&self) {
        if let Ok(tokens) = self.tokens.lock() {
            for token in tokens.values() {
                token.cancel();
            }
        }
    }

    pub fn active_runs(&self) -> usize {
        self.tokens.lock().map(|tokens| tokens.len()).unwrap_or(0)
    }

    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        self.receiver.try_recv().ok()
    }

    /// Waits for the next event. Must not be called from async code.
    pub fn blocking_recv(&mut self) -> Option<TaskEvent> {
        self.receiver.blocking_recv()
    }
}

impl Default for TaskController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum TaskSendError {
    #[error("任务通道已关闭")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("素材库错误: {0}")]
    Library(#[from] LibraryError),
    #[error("生成流程错误: {0}")]
    Conversation(#[from] ConversationError),
    #[error("后台任务崩溃: {0}")]
    Join(String),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Conversation(err) if err.is_cancelled())
    }
}

/// What a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub story: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug)]
pub enum TaskEvent {
    Log {
        run: RunId,
        record: LogRecord,
    },
    RunStarted(RunId),
    StageStarted {
        run: RunId,
        stage: usize,
        name: String,
    },
    Fragment {
        run: RunId,
        stage: usize,
        text: String,
    },
    /// An attempt failed; fragments sent since `StageStarted` are void.
    StageRetry {
        run: RunId,
        stage: usize,
        attempt: usize,
        delay: Duration,
    },
    StageFinished {
        run: RunId,
        stage: usize,
        name: String,
        chars: usize,
    },
    RunFinished {
        run: RunId,
        result: Result<RunReport, TaskError>,
        /// Present when the run stopped early and its progress was saved.
        checkpoint: Option<PathBuf>,
    },
    WorkerStopped(String),
}

impl TaskEvent {
    pub fn run(&self) -> Option<RunId> {
        match self {
            TaskEvent::Log { run, .. }
            | TaskEvent::StageStarted { run, .. }
            | TaskEvent::Fragment { run, .. }
            | TaskEvent::StageRetry { run, .. }
            | TaskEvent::StageFinished { run, .. }
            | TaskEvent::RunFinished { run, .. } => Some(*run),
            TaskEvent::RunStarted(run) => Some(*run),
            TaskEvent::WorkerStopped(_) => None,
        }
    }
}

struct ChannelLogSink {
    run: RunId,
    sender: EventSender,
}

impl ChannelLogSink {
    fn new(run: RunId, sender: EventSender) -> Self {
        Self { run, sender }
    }

    fn emit(&self, record: LogRecord) {
        let _ = self.sender.send(TaskEvent::Log {
            run: self.run,
            record,
        });
    }
}

impl LogSink for ChannelLogSink {
    fn log(&self, record: LogRecord) {
        self.emit(record);
    }
}

struct ChannelObserver {
    run: RunId,
    sender: EventSender,
}

impl ConversationObserver for ChannelObserver {
    fn stage_started(&self, stage: usize, name: &str) {
        let _ = self.sender.send(TaskEvent::StageStarted {
            run: self.run,
            stage,
            name: name.to_string(),
        });
    }

    fn fragment(&self, stage: usize, fragment: &str) {
        let _ = self.sender.send(TaskEvent::Fragment {
            run: self.run,
            stage,
            text: fragment.to_string(),
        });
    }

    fn stage_retry(&self, stage: usize, attempt: usize, delay: Duration) {
        let _ = self.sender.send(TaskEvent::StageRetry {
            run: self.run,
            stage,
            attempt,
            delay,
        });
    }

    fn stage_finished(&self, stage: usize, name: &str, output: &str) {
        let _ = self.sender.send(TaskEvent::StageFinished {
            run: self.run,
            stage,
            name: name.to_string(),
            chars: output.chars().count(),
        });
    }
}

async fn run_command(
    run: RunId,
    command: GenerateStoryCommand,
    cancel: CancellationToken,
    sender: EventSender,
    tokens: TokenMap,
) {
    let _ = sender.send(TaskEvent::RunStarted(run));
    let checkpoint_dir = command
        .checkpoint_root
        .as_ref()
        .map(|root| root.join(run.to_string()));
    let sender_clone = sender.clone();
    let dir_clone = checkpoint_dir.clone();
    let result = tokio::task::spawn_blocking(move || {
        execute_command(run, command, dir_clone, cancel, sender_clone)
    })
    .await;
    let outcome = match result {
        Ok(res) => res,
        Err(err) => Err(TaskError::Join(err.to_string())),
    };
    if let Ok(mut tokens) = tokens.lock() {
        tokens.remove(&run);
    }

    let checkpoint = match (&outcome, checkpoint_dir) {
        (Err(_), Some(dir)) => {
            let path = dir.join(story_core::CHECKPOINT_FILE_NAME);
            path.exists().then_some(path)
        }
        (Ok(_), Some(dir)) => {
            let _ = fs::remove_dir(dir);
            None
        }
        _ => None,
    };
    let _ = sender.send(TaskEvent::RunFinished {
        run,
        result: outcome,
        checkpoint,
    });
}

fn execute_command(
    run: RunId,
    command: GenerateStoryCommand,
    checkpoint_dir: Option<PathBuf>,
    cancel: CancellationToken,
    sender: EventSender,
) -> Result<RunReport, TaskError> {
    let sink = ChannelLogSink::new(run, sender.clone());
    let observer = ChannelObserver {
        run,
        sender: sender.clone(),
    };
    let GenerateStoryCommand {
        transport,
        settings,
        inputs,
        max_retries,
        output,
        ..
    } = command;

    sink.emit(LogRecord::new(
        LogLevel::Info,
        format!("任务 {run} 使用模型：{}", settings.model),
    ));

    let mut driver = ConversationDriver::new(transport.as_ref(), settings, &sink)
        .with_plan(inputs.seeding().plan())
        .with_max_retries(max_retries)
        .with_observer(&observer)
        .with_cancel_token(cancel);
    if let Some(output) = output.as_deref() {
        driver = driver.with_output(output);
    }
    if let Some(dir) = checkpoint_dir {
        driver = driver.with_checkpoint_dir(dir);
    }

    let outcome = match inputs {
        RunInputs::Seeded {
            library,
            prompts,
            seeding,
            system_prompt,
        } => {
            let mut inputs = seed_inputs(&library, &prompts, seeding, &sink)?;
            if let Some(system_prompt) = system_prompt {
                sink.emit(LogRecord::new(LogLevel::Info, "使用自定义系统提示词。"));
                inputs = inputs.with_system_prompt(system_prompt);
            }
            let mut state = inputs.into_state();
            driver.run(&mut state)?
        }
        RunInputs::Prepared(inputs) => {
            let mut state = inputs.into_state();
            driver.run(&mut state)?
        }
        RunInputs::Resume(mut state) => driver.resume(&mut state)?,
    };

    Ok(RunReport {
        story: outcome.document.story,
        files: outcome.files,
    })
}

fn seed_inputs(
    library: &FragmentLibrary,
    prompts: &PromptRegistry,
    seeding: Seeding,
    sink: &ChannelLogSink,
) -> Result<StoryInputs, LibraryError> {
    let mut rng = rand::thread_rng();
    match seeding {
        Seeding::FullStory => {
            let selection = library.pick(&mut rng)?;
            sink.emit(LogRecord::new(
                LogLevel::Info,
                format!(
                    "随机选取导语 #{}，主线剧情 #{}",
                    selection.intro_index + 1,
                    selection.plot_index + 1
                ),
            ));
            StoryInputs::seeded(prompts, &selection)
        }
        Seeding::IntroOnly => {
            let (index, intro) = library.pick_intro(&mut rng)?;
            sink.emit(LogRecord::new(
                LogLevel::Info,
                format!("随机选取导语 #{}，仅仿写导语", index + 1),
            ));
            StoryInputs::seeded_intro(prompts, intro)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use story_core::library::IntroRecord;
    use story_core::message::Role;
    use story_core::transport::{ChatRequest, TransportError, TransportErrorKind};
    use tempfile::tempdir;

    /// Answers every stage with the last user message, split into two fragments.
    struct EchoTransport;

    impl ChatTransport for EchoTransport {
        fn stream(
            &self,
            request: &ChatRequest<'_>,
            on_fragment: &mut dyn FnMut(&str),
            _cancel: &CancellationToken,
        ) -> Result<String, TransportError> {
            let last = request
                .messages
                .iter()
                .rev()
                .find(|message| message.role == Role::User)
                .map(|message| message.content.clone())
                .unwrap_or_default();
            let reply = format!("回复:{}", last.lines().last().unwrap_or_default());
            on_fragment("回复:");
            on_fragment(&reply["回复:".len()..]);
            Ok(reply)
        }
    }

    /// Echoes, except that a run whose inputs carry `held` stalls in its
    /// second stage until cancelled, and every other run waits there until
    /// `release` fires.
    struct GatedTransport {
        held: &'static str,
        release: CancellationToken,
    }

    impl ChatTransport for GatedTransport {
        fn stream(
            &self,
            request: &ChatRequest<'_>,
            on_fragment: &mut dyn FnMut(&str),
            cancel: &CancellationToken,
        ) -> Result<String, TransportError> {
            if request.messages.len() > 2 && request.messages.len() <= 4 {
                let held = request
                    .messages
                    .iter()
                    .any(|message| message.content.contains(self.held));
                let gate = if held { cancel } else { &self.release };
                for _ in 0..500 {
                    if cancel.is_cancelled() {
                        return Err(TransportError::cancelled());
                    }
                    if gate.is_cancelled() {
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                if !gate.is_cancelled() {
                    return Err(TransportError::new(TransportErrorKind::Other, "gate stayed shut"));
                }
            }
            EchoTransport.stream(request, on_fragment, cancel)
        }
    }

    /// Times out on the first call, then echoes.
    struct FlakyTransport {
        failed: Mutex<bool>,
    }

    impl ChatTransport for FlakyTransport {
        fn stream(
            &self,
            request: &ChatRequest<'_>,
            on_fragment: &mut dyn FnMut(&str),
            cancel: &CancellationToken,
        ) -> Result<String, TransportError> {
            let mut failed = self.failed.lock().unwrap();
            if !*failed {
                *failed = true;
                on_fragment("半截");
                return Err(TransportError::new(TransportErrorKind::Timeout, "读取超时"));
            }
            drop(failed);
            EchoTransport.stream(request, on_fragment, cancel)
        }
    }

    /// Replies with the system prompt of each request.
    struct SystemEchoTransport;

    impl ChatTransport for SystemEchoTransport {
        fn stream(
            &self,
            request: &ChatRequest<'_>,
            on_fragment: &mut dyn FnMut(&str),
            _cancel: &CancellationToken,
        ) -> Result<String, TransportError> {
            let system = request
                .messages
                .first()
                .map(|message| message.content.clone())
                .unwrap_or_default();
            on_fragment(&system);
            Ok(system)
        }
    }

    struct FailingTransport;

    impl ChatTransport for FailingTransport {
        fn stream(
            &self,
            request: &ChatRequest<'_>,
            _on_fragment: &mut dyn FnMut(&str),
            _cancel: &CancellationToken,
        ) -> Result<String, TransportError> {
            if request.messages.len() <= 2 {
                Ok("导语".to_string())
            } else {
                Err(TransportError::new(TransportErrorKind::Status(500), "服务器错误"))
            }
        }
    }

    fn prepared(tag: &str) -> RunInputs {
        let inputs = (1..=5).map(|n| format!("{tag}-{n}")).collect::<Vec<_>>();
        RunInputs::Prepared(StoryInputs::manual("系统", inputs).unwrap())
    }

    fn command(transport: Arc<dyn ChatTransport>, inputs: RunInputs) -> GenerateStoryCommand {
        GenerateStoryCommand::new(transport, GenerationSettings::new("mock-model"), inputs)
            .with_max_retries(1)
    }

    fn wait_finished(
        controller: &mut TaskController,
        run: RunId,
        events: &mut Vec<TaskEvent>,
    ) -> (Result<RunReport, TaskError>, Option<PathBuf>) {
        while let Some(event) = controller.blocking_recv() {
            match event {
                TaskEvent::RunFinished {
                    run: finished,
                    result,
                    checkpoint,
                } if finished == run => return (result, checkpoint),
                other => events.push(other),
            }
        }
        panic!("event channel closed before run finished");
    }

    #[test]
    fn run_reports_fragments_stages_and_story() {
        let mut controller = TaskController::new();
        let run = controller
            .submit(command(Arc::new(EchoTransport), prepared("甲")))
            .unwrap();

        let mut events = Vec::new();
        let (result, checkpoint) = wait_finished(&mut controller, run, &mut events);
        let report = result.unwrap();

        assert!(checkpoint.is_none());
        assert!(report.files.is_empty());
        assert_eq!(report.story, "回复:甲-1\n回复:甲-3\n回复:甲-4\n回复:甲-5");
        assert!(matches!(events.first(), Some(TaskEvent::RunStarted(id)) if *id == run));

        let finished: Vec<usize> = events
            .iter()
            .filter_map(|event| match event {
                TaskEvent::StageFinished { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec![0, 1, 2, 3, 4]);

        let first_stage_text: String = events
            .iter()
            .filter_map(|event| match event {
                TaskEvent::Fragment { stage: 0, text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(first_stage_text, "回复:甲-1");
        assert!(events
            .iter()
            .any(|event| matches!(event, TaskEvent::Log { run: id, .. } if *id == run)));
        assert_eq!(controller.active_runs(), 0);
    }

    #[test]
    fn concurrent_runs_keep_their_own_state() {
        let mut controller = TaskController::new();
        let transport: Arc<dyn ChatTransport> = Arc::new(EchoTransport);
        let first = controller
            .submit(command(transport.clone(), prepared("甲")))
            .unwrap();
        let second = controller
            .submit(command(transport, prepared("乙")))
            .unwrap();
        assert_ne!(first, second);

        let mut stories = HashMap::new();
        while stories.len() < 2 {
            match controller.blocking_recv() {
                Some(TaskEvent::RunFinished { run, result, .. }) => {
                    stories.insert(run, result.unwrap().story);
                }
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
        assert!(stories[&first].starts_with("回复:甲-1"));
        assert!(stories[&second].starts_with("回复:乙-1"));
    }

    #[test]
    fn cancel_stops_only_the_targeted_run() {
        let mut controller = TaskController::new();
        let release = CancellationToken::new();
        let transport: Arc<dyn ChatTransport> = Arc::new(GatedTransport {
            held: "丙",
            release: release.clone(),
        });
        let held = controller
            .submit(command(transport.clone(), prepared("丙")))
            .unwrap();
        let free = controller
            .submit(command(transport, prepared("己")))
            .unwrap();

        let mut results = HashMap::new();
        let mut free_started_second_stage = false;
        while results.len() < 2 {
            match controller.blocking_recv() {
                Some(TaskEvent::StageStarted { run, stage: 1, .. }) if run == held => {
                    assert!(controller.cancel(held));
                }
                Some(TaskEvent::StageStarted { run, stage: 1, .. }) if run == free => {
                    free_started_second_stage = true;
                }
                Some(TaskEvent::RunFinished { run, result, .. }) => {
                    if run == held {
                        assert!(results.is_empty(), "the free run must still be waiting");
                        release.cancel();
                    }
                    results.insert(run, result);
                }
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }

        assert!(free_started_second_stage);
        let err = results.remove(&held).unwrap().unwrap_err();
        assert!(err.is_cancelled());
        let report = results.remove(&free).unwrap().unwrap();
        assert_eq!(report.story, "回复:己-1\n回复:己-3\n回复:己-4\n回复:己-5");
        assert!(!controller.cancel(held));
        assert_eq!(controller.active_runs(), 0);
    }

    #[test]
    fn retried_stage_is_announced_before_the_new_stream() {
        let mut controller = TaskController::new();
        let transport = Arc::new(FlakyTransport {
            failed: Mutex::new(false),
        });
        let run = controller
            .submit(command(transport, prepared("庚")).with_max_retries(2))
            .unwrap();

        let mut events = Vec::new();
        let (result, _) = wait_finished(&mut controller, run, &mut events);
        assert!(result.is_ok());

        let retry = events
            .iter()
            .position(|event| {
                matches!(
                    event,
                    TaskEvent::StageRetry {
                        stage: 0,
                        attempt: 1,
                        ..
                    }
                )
            })
            .unwrap();
        let fragments: Vec<(usize, &str)> = events
            .iter()
            .enumerate()
            .filter_map(|(index, event)| match event {
                TaskEvent::Fragment { stage: 0, text, .. } => Some((index, text.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(fragments[0].1, "半截");
        assert!(fragments[0].0 < retry);
        assert!(fragments[1..].iter().all(|(index, _)| *index > retry));
        assert_eq!(events[retry].run(), Some(run));
    }

    #[test]
    fn seeded_intro_run_stops_after_the_intro() {
        let library = Arc::new(FragmentLibrary::new(
            vec![IntroRecord {
                content: "导语原文".into(),
                structure: "反转".into(),
            }],
            Vec::new(),
        ));
        let inputs = RunInputs::Seeded {
            library,
            prompts: Arc::new(PromptRegistry::new().unwrap()),
            seeding: Seeding::IntroOnly,
            system_prompt: Some("只写导语".to_string()),
        };
        assert_eq!(inputs.seeding(), Seeding::IntroOnly);

        let mut controller = TaskController::new();
        let run = controller
            .submit(command(Arc::new(SystemEchoTransport), inputs))
            .unwrap();

        let mut events = Vec::new();
        let (result, _) = wait_finished(&mut controller, run, &mut events);
        assert_eq!(result.unwrap().story, "只写导语");
        let finished: Vec<usize> = events
            .iter()
            .filter_map(|event| match event {
                TaskEvent::StageFinished { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec![0]);
    }

    #[test]
    fn failed_run_leaves_checkpoint_under_its_id() {
        let root = tempdir().unwrap();
        let mut controller = TaskController::new();
        let run = controller
            .submit(
                command(Arc::new(FailingTransport), prepared("丁"))
                    .with_checkpoint_root(root.path()),
            )
            .unwrap();

        let mut events = Vec::new();
        let (result, checkpoint) = wait_finished(&mut controller, run, &mut events);
        assert!(matches!(result, Err(TaskError::Conversation(_))));

        let checkpoint = checkpoint.unwrap();
        assert_eq!(
            checkpoint,
            root.path()
                .join(run.to_string())
                .join(story_core::CHECKPOINT_FILE_NAME)
        );
        let state = ConversationState::load(&checkpoint).unwrap();
        assert_eq!(state.completed_stages(), 1);
        assert_eq!(state.output(0), Some("导语"));
    }

    #[test]
    fn resumed_run_finishes_remaining_stages() {
        let mut state = ConversationState::new("系统", (1..=5).map(|n| format!("戊-{n}")));
        state.begin(5).unwrap();
        state.record_output(0, "戊-1".to_string(), "既有导语".to_string()).unwrap();

        let mut controller = TaskController::new();
        let run = controller
            .submit(command(Arc::new(EchoTransport), RunInputs::Resume(state)))
            .unwrap();

        let mut events = Vec::new();
        let (result, _) = wait_finished(&mut controller, run, &mut events);
        let report = result.unwrap();
        assert!(report.story.starts_with("既有导语\n"));
        assert!(!events
            .iter()
            .any(|event| matches!(event, TaskEvent::StageStarted { stage: 0, .. })));
    }
}
