//! Profile-based tool selection configuration.
//!
//! A profile maps category names (`meta`, `task`, `plan`, `execution`,
//! `worker`) to a candidate list plus a selection strategy. The runtime
//! selector lives in the `agent-runner` crate.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const CATEGORY_META: &str = "meta";
pub const CATEGORY_TASK: &str = "task";
pub const CATEGORY_PLAN: &str = "plan";
pub const CATEGORY_EXECUTION: &str = "execution";
pub const CATEGORY_WORKER: &str = "worker";

/// Cooldown applied when a category does not set one.
pub const DEFAULT_COOLDOWN_SEC: u64 = 120;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_profile: Option<String>,
    pub profiles: Vec<ToolProfile>,
    pub force: ToolForce,
}

impl ToolingConfig {
    /// The active profile by id, else the first profile.
    pub fn resolve_profile(&self) -> Option<&ToolProfile> {
        if let Some(active) = self.active_profile.as_deref().filter(|id| !id.is_empty()) {
            if let Some(profile) = self.profiles.iter().find(|p| p.id == active) {
                return Some(profile);
            }
        }
        self.profiles.first()
    }

    /// The forced candidate, when the override switch is on.
    pub fn forced_candidate(&self) -> Option<ToolCandidate> {
        if !self.force.enabled || self.force.tool.trim().is_empty() {
            return None;
        }
        Some(ToolCandidate {
            tool: self.force.tool.clone(),
            model: self.force.model.clone(),
            ..ToolCandidate::default()
        })
    }
}

/// Operator override that bypasses every category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolForce {
    pub enabled: bool,
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolProfile {
    pub id: String,
    pub name: String,
    pub categories: HashMap<String, CategoryConfig>,
}

impl ToolProfile {
    /// Category config, falling back to `meta` for any other category.
    pub fn category(&self, name: &str) -> Option<&CategoryConfig> {
        match self.categories.get(name) {
            Some(config) => Some(config),
            None if name != CATEGORY_META => self.categories.get(CATEGORY_META),
            None => None,
        }
    }
}

/// Selection strategy. Unrecognized values fall back to `weighted`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Strategy {
    #[default]
    Weighted,
    RoundRobin,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weighted => "weighted",
            Self::RoundRobin => "round_robin",
        }
    }
}

impl From<String> for Strategy {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "round_robin" | "round-robin" | "roundrobin" => Self::RoundRobin,
            _ => Self::Weighted,
        }
    }
}

impl From<Strategy> for String {
    fn from(value: Strategy) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryConfig {
    pub strategy: Strategy,
    pub candidates: Vec<ToolCandidate>,
    pub fallback_on_rate_limit: bool,
    pub cooldown_sec: i64,
}

impl CategoryConfig {
    /// Configured cooldown; non-positive values mean the default.
    pub fn effective_cooldown_sec(&self) -> u64 {
        u64::try_from(self.cooldown_sec)
            .ok()
            .filter(|sec| *sec > 0)
            .unwrap_or(DEFAULT_COOLDOWN_SEC)
    }
}

/// A concrete (tool, model) choice plus execution overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCandidate {
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub weight: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl ToolCandidate {
    pub fn new(tool: impl Into<String>, model: Option<&str>) -> Self {
        Self {
            tool: tool.into(),
            model: model.map(str::to_string),
            ..Self::default()
        }
    }

    /// `tool` or `tool:model`; identifies the candidate in cooldown maps.
    pub fn key(&self) -> String {
        match self.model.as_deref().filter(|m| !m.is_empty()) {
            Some(model) => format!("{}:{model}", self.tool),
            None => self.tool.clone(),
        }
    }

    /// Weight used by the weighted strategy; non-positive counts as 1.
    pub fn effective_weight(&self) -> u64 {
        u64::try_from(self.weight)
            .ok()
            .filter(|w| *w > 0)
            .unwrap_or(1)
    }

    /// Binary probed on PATH for availability.
    pub fn binary_name(&self) -> &str {
        if let Some(path) = self.cli_path.as_deref().filter(|p| !p.is_empty()) {
            return path;
        }
        match self.tool.as_str() {
            "codex-cli" | "codex" => "codex",
            "claude-code" | "claude-code-cli" | "claude" => "claude",
            "gemini-cli" | "gemini" => "gemini",
            "cursor-cli" | "cursor" => "cursor",
            other => other,
        }
    }
}
