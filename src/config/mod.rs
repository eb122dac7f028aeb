//! Process configuration: CLI arguments merged with environment variables,
//! plus the model catalog and workspace scaffolding.

use crate::security::{parse_allowed_commands_env, CommandListPatch};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Which executor variant tools run under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxMode {
    Host,
    /// Named, already-running container with the workspace mounted at
    /// `/workspace`.
    Container(String),
}

impl SandboxMode {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            anyhow::bail!("--sandbox must be 'host' or a container name");
        }
        if raw.eq_ignore_ascii_case("host") {
            Ok(Self::Host)
        } else {
            Ok(Self::Container(raw.to_string()))
        }
    }
}

/// One entry of the `MODELS_JSON` catalog, keyed by model id.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelInfo {
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default)]
    pub input_cost_per_mtok: f64,
    #[serde(default)]
    pub output_cost_per_mtok: f64,
}

fn default_context_window() -> u32 {
    200_000
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            input_cost_per_mtok: 0.0,
            output_cost_per_mtok: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_dir: PathBuf,
    pub sandbox: SandboxMode,
    pub cli_mode: bool,
    pub bot_token: Option<String>,
    pub guild_id: Option<String>,
    pub model_provider: String,
    pub model_id: String,
    pub llm_url: String,
    pub api_key: Option<String>,
    pub models: HashMap<String, ModelInfo>,
    pub allowed_paths: Vec<PathBuf>,
    pub allowed_commands: CommandListPatch,
    /// Delegate tool subprocess, when configured.
    pub agent_cmd: Option<Vec<String>>,
    /// Post model thinking to threads in addition to logging it.
    pub thinking_to_thread: bool,
}

impl Config {
    /// Merge CLI arguments with the environment. Fails on usage errors and
    /// missing required chat credentials; the caller maps that to exit 1.
    pub fn load(workspace_dir: PathBuf, sandbox: &str, cli_mode: bool) -> Result<Self> {
        let sandbox = SandboxMode::parse(sandbox)?;

        let bot_token = non_empty_env("BOT_TOKEN");
        let guild_id = non_empty_env("GUILD_ID");
        if !cli_mode {
            if bot_token.is_none() {
                anyhow::bail!("BOT_TOKEN is required unless --cli is passed");
            }
            if guild_id.is_none() {
                anyhow::bail!("GUILD_ID is required unless --cli is passed");
            }
        }

        let model_provider =
            non_empty_env("MODEL_PROVIDER").unwrap_or_else(|| "openrouter".to_string());
        let model_id = non_empty_env("MODEL_ID")
            .unwrap_or_else(|| "anthropic/claude-sonnet-4-20250514".to_string());
        let llm_url = non_empty_env("LLM_URL").unwrap_or_else(|| default_llm_url(&model_provider));

        let models = match non_empty_env("MODELS_JSON") {
            Some(raw) => parse_models_json(&raw)?,
            None => HashMap::new(),
        };

        let allowed_paths = non_empty_env("ALLOWED_PATHS")
            .map(|raw| parse_allowed_paths(&raw))
            .unwrap_or_default();
        let allowed_commands = non_empty_env("ALLOWED_COMMANDS")
            .map(|raw| parse_allowed_commands_env(&raw))
            .unwrap_or_default();

        let agent_cmd = non_empty_env("MOTHER_AGENT_CMD")
            .map(|raw| raw.split_whitespace().map(str::to_string).collect());

        Ok(Self {
            workspace_dir,
            sandbox,
            cli_mode,
            bot_token,
            guild_id,
            model_provider,
            model_id,
            llm_url,
            api_key: non_empty_env("LLM_API_KEY"),
            models,
            allowed_paths,
            allowed_commands,
            agent_cmd,
            thinking_to_thread: non_empty_env("MOTHER_SHOW_THINKING").is_some(),
        })
    }

    /// Catalog entry for the active model, or catalog defaults.
    pub fn model_info(&self) -> ModelInfo {
        self.models.get(&self.model_id).cloned().unwrap_or_default()
    }

    pub fn is_local_provider(&self) -> bool {
        matches!(self.model_provider.as_str(), "local" | "ollama")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn default_llm_url(provider: &str) -> String {
    match provider {
        "local" | "ollama" => "http://localhost:11434".to_string(),
        _ => "https://openrouter.ai/api".to_string(),
    }
}

/// Colon-separated extra path prefixes for the path guard.
pub fn parse_allowed_paths(raw: &str) -> Vec<PathBuf> {
    raw.split(':')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

pub fn parse_models_json(raw: &str) -> Result<HashMap<String, ModelInfo>> {
    serde_json::from_str(raw).context("MODELS_JSON must map model ids to model info")
}

/// Create the workspace directories and seed files the agent expects.
/// Existing files are never touched.
pub fn scaffold_workspace(workspace_dir: &Path) -> Result<()> {
    for sub in ["events", "skills"] {
        std::fs::create_dir_all(workspace_dir.join(sub))
            .with_context(|| format!("creating {}", workspace_dir.join(sub).display()))?;
    }
    let seeds: &[(&str, &str)] = &[
        ("MOTHER.md", "# MOTHER\n\nStanding instructions for this workspace.\n"),
        ("MEMORY.md", "# Memory\n"),
    ];
    for (name, body) in seeds {
        let path = workspace_dir.join(name);
        if !path.exists() {
            std::fs::write(&path, body).with_context(|| format!("seeding {name}"))?;
        }
    }
    Ok(())
}
