// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default/fallback model, also used by the `run`/`check-config` CLI
    /// commands for a single-model smoke test.
    #[serde(default)]
    pub model: ModelConfig,
    /// The two model tiers the router dispatches turns to.
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub surface: SurfaceConfig,
    #[serde(default)]
    pub entity: EntityConfig,
    /// Named provider configurations, selectable via `models.main.model =
    /// "<key>/<modelId>"` or a session-mode override.
    #[serde(default)]
    pub providers: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" | "anthropic" | "google" | "azure" |
    /// "aws" | "groq" | "openrouter" | "ollama" | "mistral" | "deepseek" |
    /// "mock". The concrete HTTP/SDK drivers for the hosted providers live
    /// outside this crate's boundary; only "mock" resolves to a working
    /// `ModelProvider` here.
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override. Useful for local proxies or self-hosted endpoints.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,

    // ── Azure OpenAI ─────────────────────────────────────────────────────────
    pub azure_resource: Option<String>,
    pub azure_deployment: Option<String>,
    pub azure_api_version: Option<String>,

    // ── AWS Bedrock ───────────────────────────────────────────────────────────
    pub aws_region: Option<String>,

    // ── Prompt caching ────────────────────────────────────────────────────────
    /// Attach an explicit cache-control marker to the system message
    /// (Anthropic only; no-op for providers that cache automatically).
    #[serde(default = "default_true")]
    pub cache_system_prompt: bool,
    /// Use the extended (1-hour) cache TTL instead of the default 5-minute window.
    #[serde(default)]
    pub extended_cache_time: bool,
    /// Cache tool definitions (stable across requests within a session).
    #[serde(default = "default_true")]
    pub cache_tools: bool,
    /// Cache conversation history up to the last message.
    #[serde(default = "default_true")]
    pub cache_conversation: bool,

    // ── Provider-specific extras ──────────────────────────────────────────────
    /// Free-form provider-specific options forwarded as-is to the driver.
    #[serde(default)]
    pub driver_options: serde_json::Value,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            azure_resource: None,
            azure_deployment: None,
            azure_api_version: None,
            aws_region: None,
            cache_system_prompt: true,
            extended_cache_time: false,
            cache_tools: true,
            cache_conversation: true,
            driver_options: serde_json::Value::Null,
        }
    }
}

/// A named reference to a model, used by `models.main`/`models.fast`: either
/// a bare `provider/modelId` string or (via the `providers` map) a key that
/// resolves to a full [`ModelConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRef {
    /// `provider/modelId`, e.g. `"anthropic/claude-opus-4-5"`, or a key into
    /// the top-level `providers` map.
    pub model: String,
    /// Provider-specific overrides forwarded as-is.
    #[serde(default)]
    pub options: serde_json::Value,
}

impl Default for ModelRef {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o".into(),
            options: serde_json::Value::Null,
        }
    }
}

/// The two model tiers the Request Router / Turn Engine select between: a
/// capable default and a cheap/fast tier for gate disambiguation and other
/// low-stakes calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub main: ModelRef,
    #[serde(default)]
    pub fast: ModelRef,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            main: ModelRef::default(),
            fast: ModelRef {
                model: "openai/gpt-4o-mini".into(),
                options: serde_json::Value::Null,
            },
        }
    }
}

fn default_max_tool_rounds() -> u32 {
    50
}
fn default_compaction_threshold() -> f32 {
    0.85
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of autonomous tool-call rounds before the Turn Engine
    /// injects a wrap-up nudge.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Token fraction of the input budget at which proactive compaction is
    /// scheduled.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// System prompt override; leave unset to use the caller-supplied default.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            compaction_threshold: default_compaction_threshold(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Automatically approve tool calls matching these glob patterns
    #[serde(default)]
    pub auto_approve_patterns: Vec<String>,
    /// Block tool calls matching these glob patterns
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    /// Timeout in seconds for a single tool call
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: Vec::new(),
            deny_patterns: Vec::new(),
            timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// `surface.router.defaultMode`: whether the router treats every message in
/// a channel as addressed to the bot ("active") or only explicit mentions
/// and replies ("mention").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterMode {
    Mention,
    Active,
}

impl Default for RouterMode {
    fn default() -> Self {
        RouterMode::Mention
    }
}

/// `surface.router.activeGate`: whether to disambiguate an "active" mode
/// batch with a fast-model yes/no gate call before composing a prompt, and
/// how long to wait for that gate before failing open/closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveGateConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gate_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_gate_timeout_ms() -> u64 {
    1500
}

impl Default for ActiveGateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: default_gate_timeout_ms(),
        }
    }
}

/// Per-session override of the router's default behavior, keyed by session
/// id under `surface.router.sessionModes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionModeOverride {
    pub mode: Option<RouterMode>,
    pub gate: Option<bool>,
    pub model: Option<String>,
    pub additional_prompts: Option<Vec<String>>,
}

fn default_active_debounce_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default)]
    pub default_mode: RouterMode,
    #[serde(default)]
    pub session_modes: HashMap<String, SessionModeOverride>,
    #[serde(default = "default_active_debounce_ms")]
    pub active_debounce_ms: u64,
    #[serde(default)]
    pub active_gate: ActiveGateConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_mode: RouterMode::default(),
            session_modes: HashMap::new(),
            active_debounce_ms: default_active_debounce_ms(),
            active_gate: ActiveGateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordSurfaceConfig {
    pub bot_name: Option<String>,
    #[serde(default)]
    pub allowed_channel_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub mention_notifications: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurfaceConfig {
    #[serde(default)]
    pub discord: DiscordSurfaceConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

/// `entity.users[alias] = {discord: userId}`: resolves a human-friendly
/// alias used in prompts/directives to a platform user id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserAlias {
    pub discord: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityConfig {
    #[serde(default)]
    pub users: HashMap<String, UserAlias>,
}

/// Coarse-grained mode a tool's availability can be scoped to.
///
/// Carried forward from the reference agent's read/write/plan split; the
/// router/runner built on top of this crate do not currently branch on it,
/// but `convo-tools`' registry still filters schemas by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Research,
    Plan,
    Agent,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Research => write!(f, "research"),
            AgentMode::Plan => write!(f, "plan"),
            AgentMode::Agent => write!(f, "agent"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_model_provider_is_openai() {
        let c = Config::default();
        assert_eq!(c.model.provider, "openai");
    }

    #[test]
    fn config_default_models_main_and_fast_differ() {
        let c = Config::default();
        assert_ne!(c.models.main.model, c.models.fast.model);
    }

    #[test]
    fn config_default_api_key_env_is_none() {
        let c = Config::default();
        assert!(c.model.api_key_env.is_none());
    }

    #[test]
    fn config_default_agent_max_tool_rounds_positive() {
        let c = Config::default();
        assert!(c.agent.max_tool_rounds > 0);
    }

    #[test]
    fn config_default_compaction_threshold_in_range() {
        let c = Config::default();
        assert!(c.agent.compaction_threshold > 0.0);
        assert!(c.agent.compaction_threshold < 1.0);
    }

    #[test]
    fn config_default_no_system_prompt_override() {
        let c = Config::default();
        assert!(c.agent.system_prompt.is_none());
    }

    #[test]
    fn config_default_tools_patterns_empty() {
        let c = Config::default();
        assert!(c.tools.auto_approve_patterns.is_empty());
        assert!(c.tools.deny_patterns.is_empty());
    }

    #[test]
    fn config_default_router_mode_is_mention() {
        let c = Config::default();
        assert_eq!(c.surface.router.default_mode, RouterMode::Mention);
    }

    #[test]
    fn config_default_active_gate_disabled() {
        let c = Config::default();
        assert!(!c.surface.router.active_gate.enabled);
    }

    #[test]
    fn config_default_entity_users_empty() {
        let c = Config::default();
        assert!(c.entity.users.is_empty());
    }

    // ── Prompt caching defaults ───────────────────────────────────────────────

    #[test]
    fn config_default_caching_enabled_except_extended_ttl() {
        let c = Config::default();
        assert!(c.model.cache_system_prompt);
        assert!(c.model.cache_tools);
        assert!(c.model.cache_conversation);
        assert!(!c.model.extended_cache_time);
    }

    #[test]
    fn config_cache_flags_can_be_disabled_via_yaml() {
        let yaml_str = "model:\n  provider: anthropic\n  name: claude-sonnet-4-5\n  \
                        cache_system_prompt: false\n  cache_tools: false\n  \
                        cache_conversation: false\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert!(!c.model.cache_system_prompt);
        assert!(!c.model.cache_tools);
        assert!(!c.model.cache_conversation);
    }

    // ── YAML round-trip ───────────────────────────────────────────────────────

    #[test]
    fn config_serialises_to_valid_yaml() {
        let c = Config::default();
        let yaml_str = serde_yaml::to_string(&c).unwrap();
        assert!(yaml_str.contains("provider"));
        assert!(yaml_str.contains("openai"));
    }

    #[test]
    fn config_deserialises_from_yaml() {
        let yaml_str =
            "model:\n  provider: anthropic\n  name: claude-opus-4-5\n  max_tokens: 8192\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(c.model.provider, "anthropic");
        assert_eq!(c.model.name, "claude-opus-4-5");
        assert_eq!(c.model.max_tokens, Some(8192));
    }

    #[test]
    fn config_partial_yaml_fills_in_defaults() {
        let yaml_str = "model:\n  name: gpt-4o-mini\n  provider: openai\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(c.model.name, "gpt-4o-mini");
        assert_eq!(
            c.agent.max_tool_rounds,
            AgentConfig::default().max_tool_rounds
        );
    }

    #[test]
    fn agent_mode_display_research() {
        assert_eq!(AgentMode::Research.to_string(), "research");
    }

    // ── surface.router / surface.discord / models / entity round-trips ───────

    #[test]
    fn router_session_mode_override_round_trips() {
        let yaml = r#"
surface:
  router:
    defaultMode: active
    activeDebounceMs: 500
    activeGate:
      enabled: true
      timeoutMs: 2000
    sessionModes:
      general:
        mode: mention
        gate: false
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.surface.router.default_mode, RouterMode::Active);
        assert_eq!(c.surface.router.active_debounce_ms, 500);
        assert!(c.surface.router.active_gate.enabled);
        assert_eq!(c.surface.router.active_gate.timeout_ms, 2000);
        let over = c.surface.router.session_modes.get("general").unwrap();
        assert_eq!(over.mode, Some(RouterMode::Mention));
        assert_eq!(over.gate, Some(false));
    }

    #[test]
    fn discord_surface_allowed_channel_ids_round_trip() {
        let yaml = r#"
surface:
  discord:
    botName: convo-bot
    allowedChannelIds: ["123", "456"]
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.surface.discord.bot_name.as_deref(), Some("convo-bot"));
        assert_eq!(c.surface.discord.allowed_channel_ids, vec!["123", "456"]);
    }

    #[test]
    fn models_main_and_fast_deserialise() {
        let yaml = r#"
models:
  main:
    model: anthropic/claude-opus-4-5
  fast:
    model: anthropic/claude-haiku-4-5
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.models.main.model, "anthropic/claude-opus-4-5");
        assert_eq!(c.models.fast.model, "anthropic/claude-haiku-4-5");
    }

    #[test]
    fn entity_users_alias_resolves_discord_id() {
        let yaml = r#"
entity:
  users:
    martin:
      discord: "111222333"
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        let alias = c.entity.users.get("martin").unwrap();
        assert_eq!(alias.discord.as_deref(), Some("111222333"));
    }

    // ── providers map ─────────────────────────────────────────────────────────

    #[test]
    fn config_default_providers_is_empty() {
        let c = Config::default();
        assert!(c.providers.is_empty());
    }

    #[test]
    fn config_providers_deserialised_from_yaml() {
        let yaml = r#"
providers:
  my_ollama:
    provider: openai
    base_url: http://localhost:11434/v1
    name: llama3.2
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.providers.len(), 1);
        let p = c.providers.get("my_ollama").unwrap();
        assert_eq!(p.provider, "openai");
        assert_eq!(p.base_url.as_deref(), Some("http://localhost:11434/v1"));
        assert_eq!(p.name, "llama3.2");
    }
}
