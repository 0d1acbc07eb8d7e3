use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Local;
use thiserror::Error;

use crate::conversation::{replay_messages, ConversationState, StagePlan, TurnError};
use crate::message::{format_message_log, Message};

pub const DEFAULT_FILE_PREFIX: &str = "story";

const INPUT_LOG_RULE_WIDTH: usize = 100;
const TRANSCRIPT_RULE_WIDTH: usize = 50;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to prepare output directory `{path}`: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write output file `{path}`: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot assemble story document: {0}")]
    Assemble(#[from] TurnError),
}

/// One completed stage as it appears in the transcript and input log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageTranscript {
    pub stage: usize,
    pub name: String,
    pub raw_input: String,
    pub sent_input: String,
    pub output: String,
    pub messages: Vec<Message>,
}

/// The result of a finished run, handed to a [`StorySink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoryDocument {
    pub story: String,
    pub stages: Vec<StageTranscript>,
}

impl StoryDocument {
    /// Collects every completed stage with the user text recorded as sent.
    pub fn from_state(plan: &StagePlan, state: &ConversationState) -> Result<Self, OutputError> {
        let mut stages = Vec::with_capacity(state.completed_stages());
        for (stage, output) in state.assistant_outputs().iter().enumerate() {
            let sent_input = state
                .composed_input(stage)
                .ok_or(TurnError::MissingSentInput { stage })?
                .to_string();
            let mut messages = replay_messages(plan, state, stage)?;
            messages.push(Message::user(sent_input.clone()));
            stages.push(StageTranscript {
                stage,
                name: plan.stage_name(stage).to_string(),
                raw_input: state.user_input(stage).unwrap_or_default().to_string(),
                sent_input,
                output: output.clone(),
                messages,
            });
        }
        Ok(Self {
            story: state.story_text(plan),
            stages,
        })
    }

    pub fn render_transcript(&self) -> String {
        let rule = "-".repeat(TRANSCRIPT_RULE_WIDTH);
        let mut out = String::new();
        for stage in &self.stages {
            out.push_str(&format!("===== 第 {} 轮 ({}) =====\n", stage.stage + 1, stage.name));
            out.push_str(&format!("[原始用户输入]\n{}\n\n", stage.raw_input));
            out.push_str(&format!(
                "[实际发送的输入（可能包含拼接）]\n{}\n\n",
                stage.sent_input
            ));
            out.push_str(&format!("[模型输出]\n{}\n\n", stage.output));
            out.push_str(&format!("{rule}\n\n"));
        }
        out
    }

    pub fn render_input_log(&self) -> String {
        let heavy = "=".repeat(INPUT_LOG_RULE_WIDTH);
        let mut out = format!(
            "{heavy}\n{}轮对话完整输入日志\n{heavy}\n\n",
            self.stages.len()
        );
        for stage in &self.stages {
            out.push_str(&format_message_log(
                &stage.messages,
                stage.stage,
                INPUT_LOG_RULE_WIDTH,
            ));
        }
        out
    }
}

/// Receives finished stories; returns the paths it wrote.
pub trait StorySink: Send + Sync {
    fn deliver(&self, document: &StoryDocument) -> Result<Vec<PathBuf>, OutputError>;
}

/// Writes `{prefix}_{YYYYmmdd_HHMMSS}_{n}.txt` files into one directory,
/// optionally with a transcript and an input log beside each story.
pub struct DirectorySink {
    directory: PathBuf,
    prefix: String,
    transcript: bool,
    input_log: bool,
    counter: AtomicUsize,
}

impl DirectorySink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            prefix: DEFAULT_FILE_PREFIX.to_string(),
            transcript: false,
            input_log: false,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if !prefix.trim().is_empty() {
            self.prefix = prefix.trim().to_string();
        }
        self
    }

    pub fn with_transcript(mut self, enabled: bool) -> Self {
        self.transcript = enabled;
        self
    }

    pub fn with_input_log(mut self, enabled: bool) -> Self {
        self.input_log = enabled;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn next_stem(&self) -> String {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        loop {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let stem = format!("{}_{}_{}", self.prefix, timestamp, n);
            if !self.directory.join(format!("{stem}.txt")).exists() {
                return stem;
            }
        }
    }

    fn write(&self, file_name: String, contents: &str) -> Result<PathBuf, OutputError> {
        let path = self.directory.join(file_name);
        fs::write(&path, contents).map_err(|source| OutputError::WriteFile {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

impl StorySink for DirectorySink {
    fn deliver(&self, document: &StoryDocument) -> Result<Vec<PathBuf>, OutputError> {
        fs::create_dir_all(&self.directory).map_err(|source| OutputError::CreateDir {
            path: self.directory.clone(),
            source,
        })?;

        let stem = self.next_stem();
        let mut written = vec![self.write(format!("{stem}.txt"), &document.story)?];
        if self.transcript {
            written.push(self.write(
                format!("{stem}_transcript.txt"),
                &document.render_transcript(),
            )?);
        }
        if self.input_log {
            written.push(self.write(
                format!("{stem}_input_log.txt"),
                &document.render_input_log(),
            )?);
        }
        Ok(written)
    }
}
