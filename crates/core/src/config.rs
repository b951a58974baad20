use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub agent: AgentConfig,
    pub guard: GuardConfig,
    pub tools: ToolsConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub embedding_model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub index_path: PathBuf,
    pub top_k: usize,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_node_iterations: u32,
    pub max_tool_hops: u32,
    pub temperature: f32,
    pub observation_max_chars: usize,
}

#[derive(Clone, Debug)]
pub struct GuardConfig {
    pub sandbox_root: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ToolsConfig {
    pub calendar_path: PathBuf,
    pub chat_token: Option<SecretString>,
    pub chat_default_channel: String,
    pub chat_base_url: String,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub index_path: Option<PathBuf>,
    pub top_k: Option<usize>,
    pub max_tool_hops: Option<u32>,
    pub sandbox_root: Option<PathBuf>,
    pub calendar_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: None,
                model: "gpt-4o-mini".to_string(),
                embedding_model: "text-embedding-3-small".to_string(),
                timeout_secs: 30,
            },
            retrieval: RetrievalConfig {
                index_path: PathBuf::from("data/index/corpus.json"),
                top_k: 5,
            },
            agent: AgentConfig {
                max_node_iterations: 10,
                max_tool_hops: 3,
                temperature: 0.0,
                observation_max_chars: 500,
            },
            guard: GuardConfig { sandbox_root: PathBuf::from("data/sandbox") },
            tools: ToolsConfig {
                calendar_path: PathBuf::from("data/calendar.json"),
                chat_token: None,
                chat_default_channel: "#general".to_string(),
                chat_base_url: "https://slack.com/api".to_string(),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("concierge.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn has_llm_api_key(&self) -> bool {
        has_secret(self.llm.api_key.as_ref())
    }

    pub fn has_chat_token(&self) -> bool {
        has_secret(self.tools.chat_token.as_ref())
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(embedding_model) = llm.embedding_model {
                self.llm.embedding_model = embedding_model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(retrieval) = patch.retrieval {
            if let Some(index_path) = retrieval.index_path {
                self.retrieval.index_path = index_path;
            }
            if let Some(top_k) = retrieval.top_k {
                self.retrieval.top_k = top_k;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(max_node_iterations) = agent.max_node_iterations {
                self.agent.max_node_iterations = max_node_iterations;
            }
            if let Some(max_tool_hops) = agent.max_tool_hops {
                self.agent.max_tool_hops = max_tool_hops;
            }
            if let Some(temperature) = agent.temperature {
                self.agent.temperature = temperature;
            }
            if let Some(observation_max_chars) = agent.observation_max_chars {
                self.agent.observation_max_chars = observation_max_chars;
            }
        }

        if let Some(guard) = patch.guard {
            if let Some(sandbox_root) = guard.sandbox_root {
                self.guard.sandbox_root = sandbox_root;
            }
        }

        if let Some(tools) = patch.tools {
            if let Some(calendar_path) = tools.calendar_path {
                self.tools.calendar_path = calendar_path;
            }
            if let Some(chat_token) = tools.chat_token {
                self.tools.chat_token = Some(secret_value(chat_token));
            }
            if let Some(chat_default_channel) = tools.chat_default_channel {
                self.tools.chat_default_channel = chat_default_channel;
            }
            if let Some(chat_base_url) = tools.chat_base_url {
                self.tools.chat_base_url = chat_base_url;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CONCIERGE_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        let api_key = read_env("CONCIERGE_LLM_API_KEY").or_else(|| read_env("OPENAI_API_KEY"));
        if let Some(value) = api_key {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = value;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CONCIERGE_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_RETRIEVAL_INDEX_PATH") {
            self.retrieval.index_path = PathBuf::from(value);
        }
        if let Some(value) = read_env("CONCIERGE_RETRIEVAL_TOP_K") {
            self.retrieval.top_k = parse_usize("CONCIERGE_RETRIEVAL_TOP_K", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_AGENT_MAX_NODE_ITERATIONS") {
            self.agent.max_node_iterations =
                parse_u32("CONCIERGE_AGENT_MAX_NODE_ITERATIONS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_AGENT_MAX_TOOL_HOPS") {
            self.agent.max_tool_hops = parse_u32("CONCIERGE_AGENT_MAX_TOOL_HOPS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_AGENT_TEMPERATURE") {
            self.agent.temperature = parse_f32("CONCIERGE_AGENT_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_AGENT_OBSERVATION_MAX_CHARS") {
            self.agent.observation_max_chars =
                parse_usize("CONCIERGE_AGENT_OBSERVATION_MAX_CHARS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_GUARD_SANDBOX_ROOT") {
            self.guard.sandbox_root = PathBuf::from(value);
        }

        if let Some(value) = read_env("CONCIERGE_TOOLS_CALENDAR_PATH") {
            self.tools.calendar_path = PathBuf::from(value);
        }
        let chat_token =
            read_env("CONCIERGE_TOOLS_CHAT_TOKEN").or_else(|| read_env("SLACK_BOT_TOKEN"));
        if let Some(value) = chat_token {
            self.tools.chat_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("CONCIERGE_TOOLS_CHAT_DEFAULT_CHANNEL") {
            self.tools.chat_default_channel = value;
        }
        if let Some(value) = read_env("CONCIERGE_TOOLS_CHAT_BASE_URL") {
            self.tools.chat_base_url = value;
        }

        let log_level =
            read_env("CONCIERGE_LOGGING_LEVEL").or_else(|| read_env("CONCIERGE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CONCIERGE_LOGGING_FORMAT").or_else(|| read_env("CONCIERGE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(index_path) = overrides.index_path {
            self.retrieval.index_path = index_path;
        }
        if let Some(top_k) = overrides.top_k {
            self.retrieval.top_k = top_k;
        }
        if let Some(max_tool_hops) = overrides.max_tool_hops {
            self.agent.max_tool_hops = max_tool_hops;
        }
        if let Some(sandbox_root) = overrides.sandbox_root {
            self.guard.sandbox_root = sandbox_root;
        }
        if let Some(calendar_path) = overrides.calendar_path {
            self.tools.calendar_path = calendar_path;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_llm(&self.llm)?;
        validate_retrieval(&self.retrieval)?;
        validate_agent(&self.agent)?;
        validate_guard(&self.guard)?;
        validate_tools(&self.tools)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn has_secret(secret: Option<&SecretString>) -> bool {
    secret.map(|value| !value.expose_secret().trim().is_empty()).unwrap_or(false)
}

fn is_http_url(value: &str) -> bool {
    let value = value.trim();
    value.starts_with("http://") || value.starts_with("https://")
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if !is_http_url(&llm.base_url) {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }

    if llm.model.trim().is_empty() || llm.embedding_model.trim().is_empty() {
        return Err(ConfigError::Validation(
            "llm.model and llm.embedding_model must not be empty".to_string(),
        ));
    }

    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_retrieval(retrieval: &RetrievalConfig) -> Result<(), ConfigError> {
    if retrieval.top_k == 0 {
        return Err(ConfigError::Validation(
            "retrieval.top_k must be greater than zero".to_string(),
        ));
    }

    if retrieval.index_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation("retrieval.index_path must not be empty".to_string()));
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.max_node_iterations == 0 {
        return Err(ConfigError::Validation(
            "agent.max_node_iterations must be greater than zero".to_string(),
        ));
    }

    if agent.max_tool_hops == 0 || agent.max_tool_hops > 20 {
        return Err(ConfigError::Validation(
            "agent.max_tool_hops must be in range 1..=20".to_string(),
        ));
    }

    if !(0.0..=2.0).contains(&agent.temperature) {
        return Err(ConfigError::Validation(
            "agent.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    if agent.observation_max_chars == 0 {
        return Err(ConfigError::Validation(
            "agent.observation_max_chars must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_guard(guard: &GuardConfig) -> Result<(), ConfigError> {
    if guard.sandbox_root.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "guard.sandbox_root must not be empty; point it at the directory file arguments may use"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_tools(tools: &ToolsConfig) -> Result<(), ConfigError> {
    if tools.calendar_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation("tools.calendar_path must not be empty".to_string()));
    }

    if !is_http_url(&tools.chat_base_url) {
        return Err(ConfigError::Validation(
            "tools.chat_base_url must start with http:// or https://".to_string(),
        ));
    }

    if let Some(token) = &tools.chat_token {
        let token = token.expose_secret();
        if !token.trim().is_empty() && !token.starts_with("xoxb-") {
            let hint = if token.starts_with("xapp-") {
                " (hint: you may have used an app-level token instead of the bot token)"
            } else {
                ""
            };
            return Err(ConfigError::Validation(format!(
                "tools.chat_token must be a bot token starting with `xoxb-`{hint}"
            )));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|parsed| parsed.is_finite())
        .ok_or_else(|| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    retrieval: Option<RetrievalPatch>,
    agent: Option<AgentPatch>,
    guard: Option<GuardPatch>,
    tools: Option<ToolsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    embedding_model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrievalPatch {
    index_path: Option<PathBuf>,
    top_k: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    max_node_iterations: Option<u32>,
    max_tool_hops: Option<u32>,
    temperature: Option<f32>,
    observation_max_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct GuardPatch {
    sandbox_root: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolsPatch {
    calendar_path: Option<PathBuf>,
    chat_token: Option<String>,
    chat_default_channel: Option<String>,
    chat_base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
