mod driver;
mod stage;

pub use driver::{
    ConversationDriver, ConversationObserver, ConversationOutcome, GenerationSettings,
    NoopObserver,
};
pub use stage::{
    build_turn, compose_input, replay_messages, Fold, Replay, StagePlan, StageSpec, Turn,
    INTRO_HEADER, OUTLINE_HEADER,
};

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::output::OutputError;
use crate::retry::RetryError;

pub const CHECKPOINT_FILE_NAME: &str = "partial_conversation.json";

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("stage {stage} is outside the plan ({count} stages)")]
    UnknownStage { stage: usize, count: usize },
    #[error("stage {stage} has no user input")]
    MissingInput { stage: usize },
    #[error("stage {stage} requires the output of stage {prior}, which is not recorded")]
    MissingOutput { stage: usize, prior: usize },
    #[error("stage {stage} folds the output of stage {source_stage}, which does not precede it")]
    InvalidFold { stage: usize, source_stage: usize },
    #[error("stage {stage} has an output but no record of the input sent")]
    MissingSentInput { stage: usize },
    #[error("expected output for stage {expected}, got stage {got}")]
    OutOfOrder { expected: usize, got: usize },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to create checkpoint directory `{path}`: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read checkpoint `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse checkpoint `{path}`: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write checkpoint `{path}`: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize checkpoint `{path}`: {source}")]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to remove checkpoint `{path}`: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("incomplete input, missing: {}", .missing.join(", "))]
    IncompleteInput { missing: Vec<String> },
    #[error("stage {stage} ({name}) failed: {source}")]
    Stage {
        stage: usize,
        name: &'static str,
        #[source]
        source: RetryError,
    },
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error("run cancelled before stage {stage} finished")]
    Cancelled { stage: usize },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Output(#[from] OutputError),
}

impl ConversationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Where a run stands: before stage 0, at a stage, or past the last one.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePosition {
    #[default]
    NotStarted,
    Stage(usize),
    Done,
}

impl StagePosition {
    /// `-1` before the run starts, the stage index while running, `None` once done.
    pub fn index(&self) -> Option<i64> {
        match self {
            Self::NotStarted => Some(-1),
            Self::Stage(stage) => Some(*stage as i64),
            Self::Done => None,
        }
    }
}

/// Everything one run owns: the inputs, the outputs recorded so far and the
/// user text actually sent for each completed stage.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    system_prompt: String,
    user_inputs: Vec<String>,
    #[serde(default)]
    assistant_outputs: Vec<String>,
    #[serde(default)]
    composed_inputs: Vec<String>,
    #[serde(default)]
    position: StagePosition,
}

impl ConversationState {
    pub fn new<S, I>(system_prompt: impl Into<String>, user_inputs: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        Self {
            system_prompt: system_prompt.into(),
            user_inputs: user_inputs.into_iter().map(Into::into).collect(),
            assistant_outputs: Vec::new(),
            composed_inputs: Vec::new(),
            position: StagePosition::NotStarted,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn user_inputs(&self) -> &[String] {
        &self.user_inputs
    }

    pub fn user_input(&self, stage: usize) -> Option<&str> {
        self.user_inputs.get(stage).map(String::as_str)
    }

    pub fn assistant_outputs(&self) -> &[String] {
        &self.assistant_outputs
    }

    pub fn output(&self, stage: usize) -> Option<&str> {
        self.assistant_outputs.get(stage).map(String::as_str)
    }

    pub fn composed_input(&self, stage: usize) -> Option<&str> {
        self.composed_inputs.get(stage).map(String::as_str)
    }

    pub fn position(&self) -> StagePosition {
        self.position
    }

    pub fn completed_stages(&self) -> usize {
        self.assistant_outputs.len()
    }

    pub fn is_done(&self) -> bool {
        self.position == StagePosition::Done
    }

    /// First stage without a recorded output, if any remain.
    pub fn next_stage(&self) -> Option<usize> {
        if self.is_done() || self.completed_stages() >= self.user_inputs.len() {
            None
        } else {
            Some(self.completed_stages())
        }
    }

    /// Names of the required fields that are empty for a plan of `stage_count`.
    pub fn missing_fields(&self, stage_count: usize) -> Vec<String> {
        let mut missing = Vec::new();
        if self.system_prompt.trim().is_empty() {
            missing.push("system_prompt".to_string());
        }
        for stage in 0..stage_count {
            let present = self
                .user_inputs
                .get(stage)
                .map(|input| !input.trim().is_empty())
                .unwrap_or(false);
            if !present {
                missing.push(format!("user_input[{}]", stage + 1));
            }
        }
        missing
    }

    /// Clears recorded outputs and moves to stage 0. Fails and stays put when
    /// a required field is empty.
    pub fn begin(&mut self, stage_count: usize) -> Result<(), ConversationError> {
        self.validate(stage_count)?;
        self.assistant_outputs.clear();
        self.composed_inputs.clear();
        self.position = if stage_count == 0 {
            StagePosition::Done
        } else {
            StagePosition::Stage(0)
        };
        Ok(())
    }

    /// Re-enters a partially completed run at its first missing stage.
    pub fn resume(&mut self, stage_count: usize) -> Result<(), ConversationError> {
        self.validate(stage_count)?;
        self.position = match self.completed_stages() {
            done if done >= stage_count => StagePosition::Done,
            next => StagePosition::Stage(next),
        };
        Ok(())
    }

    fn validate(&self, stage_count: usize) -> Result<(), ConversationError> {
        let missing = self.missing_fields(stage_count);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConversationError::IncompleteInput { missing })
        }
    }

    /// Appends the output of `stage`, which must be the next missing one.
    pub fn record_output(
        &mut self,
        stage: usize,
        composed_input: impl Into<String>,
        output: impl Into<String>,
    ) -> Result<(), TurnError> {
        let expected = self.completed_stages();
        if stage != expected {
            return Err(TurnError::OutOfOrder {
                expected,
                got: stage,
            });
        }
        self.composed_inputs.truncate(expected);
        self.composed_inputs.push(composed_input.into());
        self.assistant_outputs.push(output.into());
        Ok(())
    }

    pub(crate) fn enter(&mut self, stage: usize) {
        self.position = StagePosition::Stage(stage);
    }

    pub(crate) fn finish(&mut self) {
        self.position = StagePosition::Done;
    }

    /// Outputs of the stages that belong to the story, joined by newlines.
    pub fn story_text(&self, plan: &StagePlan) -> String {
        self.assistant_outputs
            .iter()
            .enumerate()
            .filter(|(stage, _)| plan.get(*stage).map(|spec| spec.in_story).unwrap_or(false))
            .map(|(_, output)| output.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| CheckpointError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| CheckpointError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_dir(&self, dir: impl AsRef<Path>) -> Result<PathBuf, CheckpointError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| CheckpointError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(CHECKPOINT_FILE_NAME);
        let file = File::create(&path).map_err(|source| CheckpointError::Write {
            path: path.clone(),
            source,
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(|source| {
            CheckpointError::Serialize {
                path: path.clone(),
                source,
            }
        })?;
        Ok(path)
    }

    /// Removes the checkpoint in `dir`; returns whether one existed.
    pub fn remove_checkpoint(dir: impl AsRef<Path>) -> Result<bool, CheckpointError> {
        let path = dir.as_ref().join(CHECKPOINT_FILE_NAME);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|source| CheckpointError::Remove { path, source })?;
        Ok(true)
    }

    /// Deletes the checkpoint file at `path`, then its directory when nothing
    /// else is left in it. Returns whether the directory was removed.
    pub fn discard_checkpoint_file(path: impl AsRef<Path>) -> Result<bool, CheckpointError> {
        let path = path.as_ref();
        fs::remove_file(path).map_err(|source| CheckpointError::Remove {
            path: path.to_path_buf(),
            source,
        })?;
        let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
            return Ok(false);
        };
        let empty = fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        Ok(empty && fs::remove_dir(dir).is_ok())
    }
}
