use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LibraryConfig;
use crate::conversation::{ConversationState, StagePlan};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::{self, PromptError, PromptRegistry};

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("library path for `{0}` is not configured")]
    NotConfigured(&'static str),
    #[error("failed to read library `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse library `{path}`: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("library `{0}` has no records")]
    Empty(&'static str),
    #[error("failed to render seed prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("expected {expected} inputs, got {got}")]
    InputCount { expected: usize, got: usize },
}

/// One entry of the intro library.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroRecord {
    #[serde(rename = "导语内容")]
    pub content: String,
    #[serde(rename = "导语结构分析", default)]
    pub structure: String,
}

/// One entry of the main-plot library.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotRecord {
    #[serde(rename = "开篇剧情概述", default)]
    pub opening: String,
    #[serde(rename = "付费点剧情概述", default)]
    pub paid: String,
    #[serde(rename = "结尾剧情概述", default)]
    pub ending: String,
}

/// Which stages a library-seeded run walks through.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Seeding {
    /// Intro, outline and all three draft rounds.
    #[default]
    FullStory,
    /// Only the intro rewrite; the plot library is not needed.
    IntroOnly,
}

impl Seeding {
    pub fn plan(self) -> StagePlan {
        match self {
            Seeding::FullStory => StagePlan::canonical(),
            Seeding::IntroOnly => StagePlan::intro_only(),
        }
    }

    /// Infers the mode from how many stage inputs a run carries.
    pub fn for_input_count(count: usize) -> Self {
        if count == 1 {
            Seeding::IntroOnly
        } else {
            Seeding::FullStory
        }
    }
}

#[derive(Clone, Debug)]
pub struct FragmentLibrary {
    intros: Vec<IntroRecord>,
    plots: Vec<PlotRecord>,
}

/// The records chosen for one run, with their indices for the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentSelection {
    pub intro_index: usize,
    pub intro: IntroRecord,
    pub plot_index: usize,
    pub plot: PlotRecord,
}

fn read_records<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, LibraryError> {
    let contents = fs::read_to_string(path).map_err(|source| LibraryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| LibraryError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl FragmentLibrary {
    pub fn new(intros: Vec<IntroRecord>, plots: Vec<PlotRecord>) -> Self {
        Self { intros, plots }
    }

    /// Reads the libraries `seeding` needs; intro-only runs skip the plots.
    pub fn load(
        config: &LibraryConfig,
        seeding: Seeding,
        sink: &dyn LogSink,
    ) -> Result<Self, LibraryError> {
        let intro_path = config
            .intro_path
            .as_deref()
            .ok_or(LibraryError::NotConfigured("intro"))?;
        let intros: Vec<IntroRecord> = read_records(intro_path)?;

        let plots: Vec<PlotRecord> = match seeding {
            Seeding::FullStory => {
                let plot_path = config
                    .plot_path
                    .as_deref()
                    .ok_or(LibraryError::NotConfigured("plot"))?;
                read_records(plot_path)?
            }
            Seeding::IntroOnly => Vec::new(),
        };

        sink.log(LogRecord::new(
            LogLevel::Info,
            format!(
                "素材库加载完成：导语 {} 条，主线剧情 {} 条。",
                intros.len(),
                plots.len()
            ),
        ));

        Ok(Self { intros, plots })
    }

    pub fn intros(&self) -> &[IntroRecord] {
        &self.intros
    }

    pub fn plots(&self) -> &[PlotRecord] {
        &self.plots
    }

    /// Uniformly picks one intro, returning its index too.
    pub fn pick_intro<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<(usize, &IntroRecord), LibraryError> {
        if self.intros.is_empty() {
            return Err(LibraryError::Empty("intro"));
        }
        let index = rng.gen_range(0..self.intros.len());
        Ok((index, &self.intros[index]))
    }

    /// Uniformly picks one intro and one plot.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<FragmentSelection, LibraryError> {
        let (intro_index, intro) = self.pick_intro(rng)?;
        if self.plots.is_empty() {
            return Err(LibraryError::Empty("plot"));
        }
        let plot_index = rng.gen_range(0..self.plots.len());
        Ok(FragmentSelection {
            intro_index,
            intro: intro.clone(),
            plot_index,
            plot: self.plots[plot_index].clone(),
        })
    }
}

/// The system prompt plus one user input per stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoryInputs {
    pub system_prompt: String,
    pub user_inputs: Vec<String>,
}

impl StoryInputs {
    pub const STAGE_COUNT: usize = 5;

    /// Builds the five stage inputs from library records and prompt templates.
    pub fn seeded(
        prompts: &PromptRegistry,
        selection: &FragmentSelection,
    ) -> Result<Self, LibraryError> {
        let intro_seed = intro_seed(prompts, &selection.intro)?;
        let plot_seed = prompts.format_with(
            prompts::PLOT_SEED,
            [
                ("opening", selection.plot.opening.as_str()),
                ("paid", selection.plot.paid.as_str()),
                ("ending", selection.plot.ending.as_str()),
                ("instruction", prompts.text(prompts::PLOT_OUTLINE)?),
            ],
        )?;

        Ok(Self {
            system_prompt: prompts.text(prompts::SYSTEM)?.to_string(),
            user_inputs: vec![
                intro_seed,
                plot_seed,
                prompts.text(prompts::DRAFT_OPENING)?.to_string(),
                prompts.text(prompts::DRAFT_CONTINUE_MIDDLE)?.to_string(),
                prompts.text(prompts::DRAFT_CONTINUE_FINAL)?.to_string(),
            ],
        })
    }

    /// The single input of an intro-only run.
    pub fn seeded_intro(
        prompts: &PromptRegistry,
        intro: &IntroRecord,
    ) -> Result<Self, LibraryError> {
        Ok(Self {
            system_prompt: prompts.text(prompts::SYSTEM)?.to_string(),
            user_inputs: vec![intro_seed(prompts, intro)?],
        })
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    /// Inputs supplied directly, one per stage.
    pub fn manual<S: Into<String>>(
        system_prompt: impl Into<String>,
        user_inputs: Vec<S>,
    ) -> Result<Self, LibraryError> {
        if user_inputs.len() != Self::STAGE_COUNT {
            return Err(LibraryError::InputCount {
                expected: Self::STAGE_COUNT,
                got: user_inputs.len(),
            });
        }
        Ok(Self {
            system_prompt: system_prompt.into(),
            user_inputs: user_inputs.into_iter().map(Into::into).collect(),
        })
    }

    pub fn into_state(self) -> ConversationState {
        ConversationState::new(self.system_prompt, self.user_inputs)
    }
}

fn intro_seed(prompts: &PromptRegistry, intro: &IntroRecord) -> Result<String, LibraryError> {
    let seed = prompts.format_with(
        prompts::INTRO_SEED,
        [
            ("intro", intro.content.as_str()),
            ("structure", intro.structure.as_str()),
            ("instruction", prompts.text(prompts::INTRO_REWRITE)?),
        ],
    )?;
    Ok(seed)
}
