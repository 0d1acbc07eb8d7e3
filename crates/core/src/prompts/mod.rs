use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::PromptConfig;

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex for prompt placeholders")
});

pub const SYSTEM: &str = "system";
pub const INTRO_REWRITE: &str = "intro_rewrite";
pub const PLOT_OUTLINE: &str = "plot_outline";
pub const DRAFT_OPENING: &str = "draft_opening";
pub const DRAFT_CONTINUE_MIDDLE: &str = "draft_continue_middle";
pub const DRAFT_CONTINUE_FINAL: &str = "draft_continue_final";
pub const INTRO_SEED: &str = "intro_seed";
pub const PLOT_SEED: &str = "plot_seed";
pub const CONNECTION_TEST: &str = "connection_test";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(String),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: String, argument: String },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse built-in prompt definitions: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error("failed to parse prompt file `{path}` as TOML: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to parse prompt file `{path}` as YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Prompt {
    text: String,
    /// Read verbatim from a prompt file; braces are never placeholders.
    literal: bool,
}

/// Stage prompts and seed templates, keyed by name.
///
/// Later sources override earlier ones: the built-in TOML, then every
/// `*.toml`/`*.yaml` document in the custom directories (sorted by file
/// name), then single-prompt files mapped by key.
#[derive(Debug)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, Prompt>,
}

impl PromptRegistry {
    pub fn new() -> Result<Self, PromptError> {
        Self::from_prompt_config(&PromptConfig::default())
    }

    pub fn from_prompt_config(config: &PromptConfig) -> Result<Self, PromptError> {
        let mut prompts = BTreeMap::new();

        let built_in: PromptDocument =
            toml::from_str(BUILT_IN_PROMPTS).map_err(PromptError::ParseBuiltIn)?;
        insert_templates(&mut prompts, built_in);

        for dir in &config.custom_directories {
            load_directory(dir, &mut prompts)?;
        }

        for (key, path) in &config.files {
            let text = read_file(path)?;
            prompts.insert(
                key.clone(),
                Prompt {
                    text,
                    literal: true,
                },
            );
        }

        Ok(Self { prompts })
    }

    /// The unrendered prompt text, for prompts sent as they are.
    pub fn text(&self, key: &str) -> Result<&str, PromptError> {
        self.prompts
            .get(key)
            .map(|prompt| prompt.text.as_str())
            .ok_or_else(|| PromptError::NotFound(key.to_string()))
    }

    /// Substitutes every `{name}` in the prompt; each one must be supplied.
    pub fn format_with<I, K, V>(&self, key: &str, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let prompt = self
            .prompts
            .get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?;
        if prompt.literal {
            return Ok(prompt.text.clone());
        }
        let arguments: HashMap<String, String> = arguments
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        render(key, &prompt.text, &arguments)
    }
}

fn render(
    key: &str,
    template: &str,
    arguments: &HashMap<String, String>,
) -> Result<String, PromptError> {
    let mut output = String::with_capacity(template.len());
    let mut last = 0;
    for captures in PLACEHOLDER_RE.captures_iter(template) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = arguments
            .get(name.as_str())
            .ok_or_else(|| PromptError::MissingArgument {
                key: key.to_string(),
                argument: name.as_str().to_string(),
            })?;
        output.push_str(&template[last..whole.start()]);
        output.push_str(value);
        last = whole.end();
    }
    output.push_str(&template[last..]);
    Ok(output)
}

#[derive(Debug, Default, Deserialize)]
struct PromptDocument {
    #[serde(default)]
    prompts: BTreeMap<String, String>,
}

fn insert_templates(prompts: &mut BTreeMap<String, Prompt>, document: PromptDocument) {
    for (key, text) in document.prompts {
        prompts.insert(
            key,
            Prompt {
                text,
                literal: false,
            },
        );
    }
}

fn read_file(path: &Path) -> Result<String, PromptError> {
    fs::read_to_string(path).map_err(|source| PromptError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load_directory(dir: &Path, prompts: &mut BTreeMap<String, Prompt>) -> Result<(), PromptError> {
    if !dir.is_dir() {
        return Ok(());
    }

    let read_dir = fs::read_dir(dir).map_err(|source| PromptError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| PromptError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let document: PromptDocument = match ext.as_deref() {
            Some("toml") => {
                toml::from_str(&read_file(&path)?).map_err(|source| PromptError::ParseToml {
                    path: path.clone(),
                    source,
                })?
            }
            Some("yaml" | "yml") => serde_yaml::from_str(&read_file(&path)?).map_err(|source| {
                PromptError::ParseYaml {
                    path: path.clone(),
                    source,
                }
            })?,
            _ => continue,
        };
        insert_templates(prompts, document);
    }

    Ok(())
}
