use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use concierge_core::config::AppConfig;
use secrecy::ExposeSecret;
use toml::Value;

use crate::commands::load_options;

pub fn run(config_path: Option<&Path>) -> String {
    match AppConfig::load(load_options(config_path)) {
        Ok(config) => render(&config, config_path),
        Err(error) => format!("config validation failed: {error}"),
    }
}

pub fn render(config: &AppConfig, explicit_path: Option<&Path>) -> String {
    let config_file_path = detect_config_path(explicit_path);
    let doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_keys: &[&str]| {
        field_source(key_path, env_keys, doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line(
        "llm.base_url",
        &config.llm.base_url,
        source("llm.base_url", &["CONCIERGE_LLM_BASE_URL"]),
    ));
    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_token(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());
    lines.push(render_line(
        "llm.api_key",
        &api_key,
        source("llm.api_key", &["CONCIERGE_LLM_API_KEY", "OPENAI_API_KEY"]),
    ));
    lines.push(render_line("llm.model", &config.llm.model, source("llm.model", &["CONCIERGE_LLM_MODEL"])));
    lines.push(render_line(
        "llm.embedding_model",
        &config.llm.embedding_model,
        source("llm.embedding_model", &["CONCIERGE_LLM_EMBEDDING_MODEL"]),
    ));
    lines.push(render_line(
        "llm.timeout_secs",
        &config.llm.timeout_secs.to_string(),
        source("llm.timeout_secs", &["CONCIERGE_LLM_TIMEOUT_SECS"]),
    ));

    lines.push(render_line(
        "retrieval.index_path",
        &config.retrieval.index_path.display().to_string(),
        source("retrieval.index_path", &["CONCIERGE_RETRIEVAL_INDEX_PATH"]),
    ));
    lines.push(render_line(
        "retrieval.top_k",
        &config.retrieval.top_k.to_string(),
        source("retrieval.top_k", &["CONCIERGE_RETRIEVAL_TOP_K"]),
    ));

    lines.push(render_line(
        "agent.max_node_iterations",
        &config.agent.max_node_iterations.to_string(),
        source("agent.max_node_iterations", &["CONCIERGE_AGENT_MAX_NODE_ITERATIONS"]),
    ));
    lines.push(render_line(
        "agent.max_tool_hops",
        &config.agent.max_tool_hops.to_string(),
        source("agent.max_tool_hops", &["CONCIERGE_AGENT_MAX_TOOL_HOPS"]),
    ));
    lines.push(render_line(
        "agent.temperature",
        &config.agent.temperature.to_string(),
        source("agent.temperature", &["CONCIERGE_AGENT_TEMPERATURE"]),
    ));
    lines.push(render_line(
        "agent.observation_max_chars",
        &config.agent.observation_max_chars.to_string(),
        source("agent.observation_max_chars", &["CONCIERGE_AGENT_OBSERVATION_MAX_CHARS"]),
    ));

    lines.push(render_line(
        "guard.sandbox_root",
        &config.guard.sandbox_root.display().to_string(),
        source("guard.sandbox_root", &["CONCIERGE_GUARD_SANDBOX_ROOT"]),
    ));

    lines.push(render_line(
        "tools.calendar_path",
        &config.tools.calendar_path.display().to_string(),
        source("tools.calendar_path", &["CONCIERGE_TOOLS_CALENDAR_PATH"]),
    ));
    let chat_token = config
        .tools
        .chat_token
        .as_ref()
        .map(|token| redact_token(token.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());
    lines.push(render_line(
        "tools.chat_token",
        &chat_token,
        source("tools.chat_token", &["CONCIERGE_TOOLS_CHAT_TOKEN", "SLACK_BOT_TOKEN"]),
    ));
    lines.push(render_line(
        "tools.chat_default_channel",
        &config.tools.chat_default_channel,
        source("tools.chat_default_channel", &["CONCIERGE_TOOLS_CHAT_DEFAULT_CHANNEL"]),
    ));
    lines.push(render_line(
        "tools.chat_base_url",
        &config.tools.chat_base_url,
        source("tools.chat_base_url", &["CONCIERGE_TOOLS_CHAT_BASE_URL"]),
    ));

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", &["CONCIERGE_LOGGING_LEVEL", "CONCIERGE_LOG_LEVEL"]),
    ));
    lines.push(render_line(
        "logging.format",
        config.logging.format.as_str(),
        source("logging.format", &["CONCIERGE_LOGGING_FORMAT", "CONCIERGE_LOG_FORMAT"]),
    ));

    lines.join("\n")
}

fn detect_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then(|| path.to_path_buf());
    }

    let root = PathBuf::from("concierge.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/concierge.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
