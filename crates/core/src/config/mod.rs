use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::retry::DEFAULT_MAX_RETRIES;

pub const DEFAULT_PROFILE_NAME: &str = "default";

fn default_temperature() -> f32 {
    1.0
}

fn default_timeout() -> u64 {
    600
}

fn default_stream() -> bool {
    true
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("output")
}

fn default_file_prefix() -> String {
    "story".to_string()
}

fn default_max_retries() -> usize {
    DEFAULT_MAX_RETRIES
}

fn default_pause_between_runs() -> u64 {
    3
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("LLM profile `{0}` is not configured")]
    UnknownProfile(String),
    #[error("no LLM profile is configured")]
    NoProfile,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub interface_format: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// `0` leaves the limit to the endpoint.
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            interface_format: String::new(),
            model_name: String::new(),
            temperature: default_temperature(),
            max_tokens: 0,
            timeout: default_timeout(),
            stream: default_stream(),
        }
    }
}

impl LlmConfig {
    pub fn is_meaningful(&self) -> bool {
        !(self.api_key.is_empty()
            && self.base_url.is_empty()
            && self.interface_format.is_empty()
            && self.model_name.is_empty())
    }

    pub fn max_tokens(&self) -> Option<u32> {
        (self.max_tokens > 0).then_some(self.max_tokens)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptConfig {
    #[serde(default)]
    pub custom_directories: Vec<PathBuf>,
    /// Prompt key to a file whose whole content replaces that prompt.
    #[serde(default)]
    pub files: BTreeMap<String, PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    #[serde(default)]
    pub intro_path: Option<PathBuf>,
    #[serde(default)]
    pub plot_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            file_prefix: default_file_prefix(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_pause_between_runs")]
    pub pause_between_runs_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            pause_between_runs_secs: default_pause_between_runs(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RecentUsage {
    #[serde(default)]
    pub last_llm_interface: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub llm_profiles: BTreeMap<String, LlmConfig>,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub recent: RecentUsage,
}

const MODERN_KEYS: [&str; 6] = [
    "llm_profiles",
    "prompts",
    "library",
    "output",
    "generation",
    "recent",
];

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_llm_profile(&self, name: &str) -> Option<&LlmConfig> {
        self.llm_profiles.get(name)
    }

    pub fn upsert_llm_profile<S: Into<String>>(&mut self, name: S, profile: LlmConfig) {
        self.llm_profiles.insert(name.into(), profile);
    }

    pub fn remove_llm_profile(&mut self, name: &str) -> Option<LlmConfig> {
        self.llm_profiles.remove(name)
    }

    pub fn primary_llm_profile(&self) -> Option<(&String, &LlmConfig)> {
        self.llm_profiles.iter().next()
    }

    /// Picks `name`, else the last used interface, else the first profile.
    pub fn resolve_llm_profile(
        &self,
        name: Option<&str>,
    ) -> Result<(&str, &LlmConfig), ConfigError> {
        if let Some(name) = name {
            return self
                .llm_profiles
                .get_key_value(name)
                .map(|(key, profile)| (key.as_str(), profile))
                .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()));
        }
        if let Some((key, profile)) = self
            .recent
            .last_llm_interface
            .as_deref()
            .and_then(|last| self.llm_profiles.get_key_value(last))
        {
            return Ok((key.as_str(), profile));
        }
        self.primary_llm_profile()
            .map(|(key, profile)| (key.as_str(), profile))
            .ok_or(ConfigError::NoProfile)
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }

        let value: Value = serde_json::from_str(input)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        if MODERN_KEYS.iter().any(|key| value.get(key).is_some()) {
            Ok(serde_json::from_value(value)?)
        } else {
            let legacy: LegacyConfig = serde_json::from_value(value)?;
            Ok(Self::from_legacy(legacy))
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    fn from_legacy(legacy: LegacyConfig) -> Self {
        let mut config = Self::default();

        if let Some(profile) = legacy.llm_profile() {
            config.recent.last_llm_interface = Some(DEFAULT_PROFILE_NAME.to_string());
            config
                .llm_profiles
                .insert(DEFAULT_PROFILE_NAME.to_string(), profile);
        }

        let prompt_files = [
            ("system", &legacy.prompt_path_sys),
            ("intro_rewrite", &legacy.prompt_path_ins),
            ("plot_outline", &legacy.prompt_path_change),
            ("draft_opening", &legacy.prompt_path_text),
        ];
        for (key, path) in prompt_files {
            if let Some(path) = path.as_ref().filter(|p| !p.as_os_str().is_empty()) {
                config.prompts.files.insert(key.to_string(), path.clone());
            }
        }

        config.library = LibraryConfig {
            intro_path: legacy.intro_library.clone(),
            plot_path: legacy.plot_library.clone(),
        };
        if let Some(directory) = legacy.output_dir.clone() {
            config.output.directory = directory;
        }
        if let Some(max_retries) = legacy.max_retries {
            config.generation.max_retries = max_retries;
        }
        config.debug = legacy.log_debug.unwrap_or(false);

        config
    }
}

/// The flat key layout of older configuration files.
///
/// `prompt_path_text_copy` and `emotion_plot_library` no longer feed any stage;
/// they land in `extra` and are ignored.
#[derive(Clone, Debug, Default, Deserialize)]
struct LegacyConfig {
    #[serde(default)]
    url: Option<String>,
    #[serde(default, alias = "api-key")]
    api_key: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    log_debug: Option<bool>,
    #[serde(default)]
    prompt_path_sys: Option<PathBuf>,
    #[serde(default)]
    prompt_path_ins: Option<PathBuf>,
    #[serde(default)]
    prompt_path_change: Option<PathBuf>,
    #[serde(default)]
    prompt_path_text: Option<PathBuf>,
    #[serde(default)]
    intro_library: Option<PathBuf>,
    #[serde(default)]
    plot_library: Option<PathBuf>,
    #[serde(default)]
    output_dir: Option<PathBuf>,
    #[serde(default)]
    max_retries: Option<usize>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl LegacyConfig {
    /// Keys such as `api-key-main` carry an account label after the prefix.
    fn labelled_api_key(&self) -> Option<String> {
        self.extra
            .iter()
            .filter(|(key, _)| key.starts_with("api-key") || key.starts_with("api_key"))
            .find_map(|(_, value)| value.as_str().map(str::to_string))
    }

    fn llm_profile(&self) -> Option<LlmConfig> {
        let api_key = self.api_key.clone().or_else(|| self.labelled_api_key());
        if api_key.is_none() && self.url.is_none() && self.model.is_none() {
            return None;
        }

        Some(LlmConfig {
            api_key: api_key.unwrap_or_default(),
            base_url: self.url.clone().unwrap_or_default(),
            interface_format: "OpenAI".to_string(),
            model_name: self.model.clone().unwrap_or_default(),
            temperature: self.temperature.unwrap_or_else(default_temperature),
            ..LlmConfig::default()
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            Config::from_path(&path)?
        } else {
            Config::default()
        };

        Ok(Self { path, config })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        Config::from_path(path.as_ref())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn reload(&mut self) -> Result<(), ConfigError> {
        if self.path.exists() {
            self.config = Config::from_path(&self.path)?;
        } else {
            self.config = Config::default();
        }
        Ok(())
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.to_path(&self.path)
    }

    pub fn touch_llm_interface<S: Into<String>>(&mut self, name: S) {
        self.config.recent.last_llm_interface = Some(name.into());
    }

    pub fn last_llm_interface(&self) -> Option<&str> {
        self.config
            .recent
            .last_llm_interface
            .as_deref()
            .and_then(|name| self.config.llm_profiles.get(name).map(|_| name))
    }

    pub fn ensure_recent_defaults(&mut self) {
        if self
            .config
            .recent
            .last_llm_interface
            .as_ref()
            .map(|name| self.config.llm_profiles.contains_key(name))
            != Some(true)
        {
            let next = self.config.llm_profiles.keys().next().cloned();
            self.config.recent.last_llm_interface = next;
        }
    }
}
