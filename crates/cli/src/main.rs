use clap::{Args, Parser, Subcommand};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use story_adapters::{create_chat_transport_from_profile, AdapterError};
use story_core::prompts::CONNECTION_TEST;
use story_core::{
    ChatRequest, ChatTransport, CheckpointError, Config, ConfigError, ConfigStore,
    ConversationState, DirectorySink, FragmentLibrary, GenerationSettings, LibraryError, LlmConfig,
    LogLevel, LogRecord, LogSink, Message, PromptError, PromptRegistry, Seeding, StdoutLogSink,
    StoryInputs, StorySink, TransportError,
};
use story_tasks::{
    GenerateStoryCommand, RunId, RunInputs, TaskController, TaskEvent, TaskSendError,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Config(command) => handle_config(&cli.config, command),
        Command::Story(command) => handle_story(&cli.config, command),
    }
}

fn handle_config(config_path: &Path, command: ConfigCommand) -> Result<(), CliError> {
    match command {
        ConfigCommand::TestLlm(args) => run_test_llm(config_path, args),
    }
}

fn handle_story(config_path: &Path, command: StoryCommand) -> Result<(), CliError> {
    match command {
        StoryCommand::Generate(args) => run_generate(config_path, args),
        StoryCommand::Intro(args) => run_intro(config_path, args),
        StoryCommand::Turns(args) => run_turns(config_path, args),
        StoryCommand::Resume(args) => run_resume(config_path, args),
    }
}

fn open_store(config_path: &Path) -> Result<(ConfigStore, StdoutLogSink), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();
    log::debug!("loaded config from {}", store.path().display());
    let sink = StdoutLogSink::with_min_level(LogLevel::from_debug_flag(store.config().debug));
    Ok((store, sink))
}

fn select_profile(
    store: &ConfigStore,
    preferred: Option<String>,
) -> Result<(String, LlmConfig), CliError> {
    let preferred = normalize_preference(preferred);
    let (name, profile) = store.config().resolve_llm_profile(preferred.as_deref())?;
    Ok((name.to_string(), profile.clone()))
}

fn run_test_llm(config_path: &Path, args: TestLlmArgs) -> Result<(), CliError> {
    let (mut store, sink) = open_store(config_path)?;
    let (selected, profile) = select_profile(&store, args.interface)?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("开始测试 LLM 配置：{selected}"),
    ));
    sink.log(LogRecord::new(
        LogLevel::Debug,
        format!(
            "模型: {} | 接口模式: {} | Base URL: {}",
            profile.model_name, profile.interface_format, profile.base_url
        ),
    ));

    let prompts = PromptRegistry::from_prompt_config(&store.config().prompts)?;
    let test_prompt = prompts.text(CONNECTION_TEST)?;
    let transport = create_chat_transport_from_profile(&profile)?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("发送测试提示词: {test_prompt}"),
    ));

    let messages = [Message::user(test_prompt)];
    let request = ChatRequest::new(&messages, &profile.model_name, profile.temperature);
    let response = transport.stream(&request, &mut |_| {}, &CancellationToken::new())?;
    if response.trim().is_empty() {
        sink.log(LogRecord::new(
            LogLevel::Error,
            "❌ LLM配置测试失败：未获取到响应",
        ));
        return Err(CliError::TestFailed(
            "LLM配置测试失败：未获取到响应".to_string(),
        ));
    }

    sink.log(LogRecord::new(LogLevel::Info, "✅ LLM配置测试成功！"));
    sink.log(LogRecord::new(
        LogLevel::Debug,
        format!("测试回复: {response}"),
    ));

    store.touch_llm_interface(selected);
    store.save()?;
    Ok(())
}

/// Everything a run needs that comes from the config file and shared flags.
struct RunSetup {
    selected: String,
    transport: Arc<dyn ChatTransport>,
    settings: GenerationSettings,
    max_retries: usize,
    output: Arc<dyn StorySink>,
    checkpoint_root: Option<PathBuf>,
}

impl RunSetup {
    fn new(
        config: &Config,
        args: &RunArgs,
        file_prefix: &str,
        sink: &dyn LogSink,
    ) -> Result<Self, CliError> {
        let preferred = normalize_preference(args.llm_interface.clone());
        let (selected, profile) = config.resolve_llm_profile(preferred.as_deref())?;
        let stream = profile.stream && !args.no_stream;
        let transport = create_chat_transport_from_profile(profile)?.with_stream(stream);

        let directory = args
            .output_dir
            .clone()
            .unwrap_or_else(|| config.output.directory.clone());
        let output = DirectorySink::new(&directory)
            .with_prefix(file_prefix)
            .with_transcript(args.transcript)
            .with_input_log(args.input_log);
        let checkpoint_root = (!args.no_checkpoint).then(|| directory.join("checkpoints"));

        sink.log(LogRecord::new(
            LogLevel::Info,
            format!("使用 LLM 接口：{selected}（模型：{}）", profile.model_name),
        ));
        sink.log(LogRecord::new(
            LogLevel::Info,
            format!("输出目录：{}", directory.display()),
        ));
        if !stream {
            sink.log(LogRecord::new(LogLevel::Debug, "已关闭流式输出。"));
        }

        Ok(Self {
            selected: selected.to_string(),
            transport: Arc::new(transport),
            settings: GenerationSettings::new(profile.model_name.clone())
                .with_temperature(profile.temperature),
            max_retries: args
                .max_retries
                .unwrap_or(config.generation.max_retries),
            output: Arc::new(output),
            checkpoint_root,
        })
    }

    fn command(&self, inputs: RunInputs) -> GenerateStoryCommand {
        let command = GenerateStoryCommand::new(
            Arc::clone(&self.transport),
            self.settings.clone(),
            inputs,
        )
        .with_max_retries(self.max_retries)
        .with_output(Arc::clone(&self.output));
        match &self.checkpoint_root {
            Some(root) => command.with_checkpoint_root(root),
            None => command,
        }
    }
}

fn run_generate(config_path: &Path, args: GenerateArgs) -> Result<(), CliError> {
    let (mut store, sink) = open_store(config_path)?;
    let prefix = store.config().output.file_prefix.clone();
    let setup = RunSetup::new(store.config(), &args.run, &prefix, &sink)?;
    let prompts = Arc::new(PromptRegistry::from_prompt_config(&store.config().prompts)?);
    let library = Arc::new(FragmentLibrary::load(
        &store.config().library,
        Seeding::FullStory,
        &sink,
    )?);

    let seeded = || RunInputs::Seeded {
        library: Arc::clone(&library),
        prompts: Arc::clone(&prompts),
        seeding: Seeding::FullStory,
        system_prompt: None,
    };
    let batch = Batch {
        count: args.count.max(1),
        parallel: args.parallel,
        pause: Duration::from_secs(store.config().generation.pause_between_runs_secs),
        label: "篇故事",
    };
    let result = batch.run(&setup, seeded, &sink);

    store.touch_llm_interface(setup.selected.clone());
    store.save()?;
    result
}

/// Rewrites library intros only; each run is a single stage.
fn run_intro(config_path: &Path, args: IntroArgs) -> Result<(), CliError> {
    let (mut store, sink) = open_store(config_path)?;
    let prefix = format!("{}_intro", store.config().output.file_prefix);
    let setup = RunSetup::new(store.config(), &args.run, &prefix, &sink)?;
    let prompts = Arc::new(PromptRegistry::from_prompt_config(&store.config().prompts)?);
    let library = Arc::new(FragmentLibrary::load(
        &store.config().library,
        Seeding::IntroOnly,
        &sink,
    )?);
    let system_prompt = args
        .system_prompt
        .as_deref()
        .map(read_text_or_literal)
        .transpose()?;

    let seeded = || RunInputs::Seeded {
        library: Arc::clone(&library),
        prompts: Arc::clone(&prompts),
        seeding: Seeding::IntroOnly,
        system_prompt: system_prompt.clone(),
    };
    let batch = Batch {
        count: args.count.max(1),
        parallel: args.parallel,
        pause: Duration::from_secs(store.config().generation.pause_between_runs_secs),
        label: "条导语",
    };
    let result = batch.run(&setup, seeded, &sink);

    store.touch_llm_interface(setup.selected.clone());
    store.save()?;
    result
}

/// Repeated seeded runs, either one after another or all at once.
struct Batch {
    count: usize,
    parallel: bool,
    pause: Duration,
    label: &'static str,
}

impl Batch {
    fn run(
        &self,
        setup: &RunSetup,
        inputs: impl Fn() -> RunInputs,
        sink: &dyn LogSink,
    ) -> Result<(), CliError> {
        let count = self.count;
        let mut controller = TaskController::new();
        let mut failed = 0usize;
        if self.parallel && count > 1 {
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!("并行提交 {count} 个生成任务。"),
            ));
            let mut pending = HashSet::new();
            for _ in 0..count {
                pending.insert(controller.submit(setup.command(inputs()))?);
            }
            failed += wait_for_runs(&mut controller, pending, sink, false)?;
        } else {
            for index in 0..count {
                sink.log(LogRecord::new(
                    LogLevel::Info,
                    format!("===== 开始生成第 {} / {} 个任务 =====", index + 1, count),
                ));
                let run = controller.submit(setup.command(inputs()))?;
                let pending = HashSet::from([run]);
                failed += wait_for_runs(&mut controller, pending, sink, count == 1)?;
                if index + 1 < count && !self.pause.is_zero() {
                    sink.log(LogRecord::new(
                        LogLevel::Info,
                        format!("等待 {} 秒后开始下一个任务...", self.pause.as_secs()),
                    ));
                    thread::sleep(self.pause);
                }
            }
        }

        if failed > 0 {
            return Err(CliError::RunsFailed {
                failed,
                total: count,
            });
        }
        sink.log(LogRecord::new(
            LogLevel::Info,
            format!("全部 {count} {}生成完成。", self.label),
        ));
        Ok(())
    }
}

fn run_turns(config_path: &Path, args: TurnsArgs) -> Result<(), CliError> {
    let (store, sink) = open_store(config_path)?;
    let setup = RunSetup::new(
        store.config(),
        &args.run,
        &store.config().output.file_prefix,
        &sink,
    )?;

    let system_prompt = read_text(&args.system)?;
    let inputs = args
        .inputs
        .iter()
        .map(|path| read_text(path))
        .collect::<Result<Vec<_>, _>>()?;
    let inputs = StoryInputs::manual(system_prompt, inputs)?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("已读取系统提示词与 {} 轮用户输入。", inputs.user_inputs.len()),
    ));

    let mut controller = TaskController::new();
    let run = controller.submit(setup.command(RunInputs::Prepared(inputs)))?;
    match wait_for_runs(&mut controller, HashSet::from([run]), &sink, true)? {
        0 => Ok(()),
        failed => Err(CliError::RunsFailed { failed, total: 1 }),
    }
}

fn run_resume(config_path: &Path, args: ResumeArgs) -> Result<(), CliError> {
    let (store, sink) = open_store(config_path)?;
    let state = ConversationState::load(&args.checkpoint)?;
    let prefix = match Seeding::for_input_count(state.user_inputs().len()) {
        Seeding::FullStory => store.config().output.file_prefix.clone(),
        Seeding::IntroOnly => format!("{}_intro", store.config().output.file_prefix),
    };
    let setup = RunSetup::new(store.config(), &args.run, &prefix, &sink)?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "已从 {} 读取进度：完成 {} 个阶段。",
            args.checkpoint.display(),
            state.completed_stages()
        ),
    ));

    let mut controller = TaskController::new();
    let run = controller.submit(setup.command(RunInputs::Resume(state)))?;
    if wait_for_runs(&mut controller, HashSet::from([run]), &sink, true)? > 0 {
        return Err(CliError::RunsFailed {
            failed: 1,
            total: 1,
        });
    }

    let removed_dir = ConversationState::discard_checkpoint_file(&args.checkpoint)?;
    sink.log(LogRecord::new(
        LogLevel::Debug,
        format!("已删除进度文件：{}", args.checkpoint.display()),
    ));
    if removed_dir {
        sink.log(LogRecord::new(LogLevel::Debug, "已删除空的进度目录。"));
    }
    Ok(())
}

/// Relays events until every run in `pending` finished; returns how many failed.
fn wait_for_runs(
    controller: &mut TaskController,
    mut pending: HashSet<RunId>,
    sink: &dyn LogSink,
    live: bool,
) -> Result<usize, CliError> {
    let mut failed = 0;
    while !pending.is_empty() {
        let Some(event) = controller.blocking_recv() else {
            return Err(CliError::Worker("任务通道已关闭".to_string()));
        };
        match event {
            TaskEvent::Log { record, .. } => sink.log(record),
            TaskEvent::RunStarted(run) => sink.log(LogRecord::new(
                LogLevel::Debug,
                format!("任务 {run} 已启动。"),
            )),
            TaskEvent::StageStarted { stage, name, .. } if live => {
                println!("\n----- 第 {} 阶段（{name}）-----", stage + 1);
            }
            TaskEvent::Fragment { text, .. } if live => {
                print!("{text}");
                let _ = io::stdout().flush();
            }
            TaskEvent::StageRetry {
                stage,
                attempt,
                delay,
                ..
            } if live => {
                println!();
                println!(
                    "[第 {} 阶段第 {attempt} 次尝试中断，以上内容作废，{:.1} 秒后重新生成]",
                    stage + 1,
                    delay.as_secs_f64()
                );
            }
            TaskEvent::StageFinished {
                stage, name, chars, ..
            } => {
                if live {
                    println!();
                }
                sink.log(LogRecord::new(
                    LogLevel::Info,
                    format!("第 {} 阶段（{name}）完成，共 {chars} 字。", stage + 1),
                ));
            }
            TaskEvent::RunFinished {
                run,
                result,
                checkpoint,
            } => {
                if !pending.remove(&run) {
                    continue;
                }
                match result {
                    Ok(report) => sink.log(LogRecord::new(
                        LogLevel::Info,
                        format!(
                            "任务 {run} 完成，故事共 {} 字，写入 {} 个文件。",
                            report.story.chars().count(),
                            report.files.len()
                        ),
                    )),
                    Err(err) => {
                        failed += 1;
                        sink.log(LogRecord::new(
                            LogLevel::Error,
                            format!("任务 {run} 失败：{err}"),
                        ));
                        if let Some(path) = checkpoint {
                            sink.log(LogRecord::new(
                                LogLevel::Info,
                                format!(
                                    "进度已保存，可执行 `storyctl story resume --checkpoint {}` 继续。",
                                    path.display()
                                ),
                            ));
                        }
                    }
                }
            }
            TaskEvent::WorkerStopped(reason) => return Err(CliError::Worker(reason)),
            _ => {}
        }
    }
    Ok(failed)
}

/// Reads `value` as a file when one exists at that path, else takes it as text.
fn read_text_or_literal(value: &str) -> Result<String, CliError> {
    let path = Path::new(value);
    if path.is_file() {
        read_text(path)
    } else {
        Ok(value.to_string())
    }
}

fn read_text(path: &Path) -> Result<String, CliError> {
    fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn normalize_preference(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[derive(Debug, Error)]
enum CliError {
    #[error("配置文件错误: {0}")]
    Config(#[from] ConfigError),
    #[error("读取文件 `{path}` 失败: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("适配器初始化失败: {0}")]
    Adapter(#[from] AdapterError),
    #[error("LLM 调用失败: {0}")]
    Transport(#[from] TransportError),
    #[error("提示词加载失败: {0}")]
    Prompt(#[from] PromptError),
    #[error("素材库加载失败: {0}")]
    Library(#[from] LibraryError),
    #[error("进度文件错误: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("{0}")]
    Send(#[from] TaskSendError),
    #[error("后台任务异常: {0}")]
    Worker(String),
    #[error("{failed} / {total} 个生成任务失败")]
    RunsFailed { failed: usize, total: usize },
    #[error("{0}")]
    TestFailed(String),
}

#[derive(Parser)]
#[command(name = "storyctl", version, about = "分阶段故事生成命令行工具")]
struct Cli {
    /// 指定配置文件路径
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 配置相关操作
    #[command(subcommand)]
    Config(ConfigCommand),
    /// 故事生成相关操作
    #[command(subcommand)]
    Story(StoryCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// 测试当前 LLM 接口配置
    TestLlm(TestLlmArgs),
}

#[derive(Subcommand)]
enum StoryCommand {
    /// 从素材库随机取材，生成一篇或多篇故事
    Generate(GenerateArgs),
    /// 只仿写导语，每次随机取一条导语素材
    Intro(IntroArgs),
    /// 使用本地文件提供的系统提示词和五轮输入生成
    Turns(TurnsArgs),
    /// 从进度文件继续未完成的生成
    Resume(ResumeArgs),
}

#[derive(Args)]
struct TestLlmArgs {
    /// 指定要测试的接口名称，默认为最近使用的接口
    #[arg(long)]
    interface: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    /// 指定用于生成的 LLM 接口名称
    #[arg(long)]
    llm_interface: Option<String>,
    /// 每个阶段的最大尝试次数，默认读取配置
    #[arg(long, value_name = "N")]
    max_retries: Option<usize>,
    /// 关闭流式输出，整段接收模型回复
    #[arg(long)]
    no_stream: bool,
    /// 输出目录，默认读取配置
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
    /// 额外写出逐轮对话记录
    #[arg(long)]
    transcript: bool,
    /// 额外写出每轮完整输入日志
    #[arg(long)]
    input_log: bool,
    /// 不在输出目录下保存中间进度
    #[arg(long)]
    no_checkpoint: bool,
}

#[derive(Args)]
struct GenerateArgs {
    /// 生成篇数
    #[arg(long, default_value_t = 1, value_name = "N")]
    count: usize,
    /// 同时运行全部任务，不在两篇之间等待
    #[arg(long)]
    parallel: bool,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct IntroArgs {
    /// 生成条数
    #[arg(long, default_value_t = 1, value_name = "N")]
    count: usize,
    /// 同时运行全部任务，不在两次之间等待
    #[arg(long)]
    parallel: bool,
    /// 自定义系统提示词（文件路径或文本），默认使用配置中的系统提示词
    #[arg(long, value_name = "FILE|TEXT")]
    system_prompt: Option<String>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct TurnsArgs {
    /// 系统提示词文件
    #[arg(long, value_name = "FILE")]
    system: PathBuf,
    /// 各轮用户输入文件，按顺序给出五次
    #[arg(long = "input", value_name = "FILE", required = true)]
    inputs: Vec<PathBuf>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct ResumeArgs {
    /// partial_conversation.json 路径
    #[arg(long, value_name = "FILE")]
    checkpoint: PathBuf,
    #[command(flatten)]
    run: RunArgs,
}
