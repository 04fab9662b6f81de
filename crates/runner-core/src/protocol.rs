//! Planner wire protocol.
//!
//! Planner adapters exchange YAML documents shaped as
//! `{type, version, payload}`. The payload decodes into one of the typed
//! responses below.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::TaskState;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed planner YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unexpected planner message type: expected {expected}, got {actual}")]
    UnexpectedType {
        expected: &'static str,
        actual: String,
    },
}

/// Envelope around every planner response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub payload: serde_yaml::Value,
}

impl PlannerMessage {
    pub fn new<T: Serialize>(kind: &str, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: kind.to_string(),
            version: PROTOCOL_VERSION,
            payload: serde_yaml::to_value(payload)?,
        })
    }

    /// Parse an envelope and decode its payload, checking the message type.
    pub fn decode<T: PlannerPayload>(yaml: &str) -> Result<T, ProtocolError> {
        let message: PlannerMessage = serde_yaml::from_str(yaml)?;
        if message.kind != T::MESSAGE_TYPE {
            return Err(ProtocolError::UnexpectedType {
                expected: T::MESSAGE_TYPE,
                actual: message.kind,
            });
        }
        Ok(serde_yaml::from_value(message.payload)?)
    }
}

/// A typed payload with its envelope `type` tag.
pub trait PlannerPayload: serde::de::DeserializeOwned {
    const MESSAGE_TYPE: &'static str;
}

// --- plan_task ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTaskRequest {
    pub prd_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTaskResponse {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<PlannedCriterion>,
}

impl PlannerPayload for PlanTaskResponse {
    const MESSAGE_TYPE: &'static str = "plan_task";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedCriterion {
    pub id: String,
    pub description: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub critical: bool,
}

// --- next_action ---

/// What the planner wants to happen next.
///
/// Anything outside the known set decodes to `Unknown` and is treated as a
/// protocol violation by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PlannerAction {
    RunWorker,
    MarkComplete,
    Abort,
    Unknown(String),
}

impl PlannerAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::RunWorker => "run_worker",
            Self::MarkComplete => "mark_complete",
            Self::Abort => "abort",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for PlannerAction {
    fn from(value: String) -> Self {
        match value.trim() {
            "run_worker" => Self::RunWorker,
            "mark_complete" => Self::MarkComplete,
            "abort" => Self::Abort,
            _ => Self::Unknown(value),
        }
    }
}

impl From<PlannerAction> for String {
    fn from(value: PlannerAction) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for PlannerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: PlannerAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Planner-issued request to run the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCall {
    #[serde(default)]
    pub worker_type: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub use_stdin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextActionResponse {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_call: Option<WorkerCall>,
}

impl PlannerPayload for NextActionResponse {
    const MESSAGE_TYPE: &'static str = "next_action";
}

// --- completion_assessment ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    Passed,
    Failed,
    Skipped,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionVerdict {
    pub id: String,
    pub status: CriterionStatus,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionAssessment {
    pub all_criteria_satisfied: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub by_criterion: Vec<CriterionVerdict>,
}

impl PlannerPayload for CompletionAssessment {
    const MESSAGE_TYPE: &'static str = "completion_assessment";
}

// --- task summary ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionSnapshot {
    pub id: String,
    pub description: String,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRunDigest {
    pub id: String,
    pub exit_code: i32,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Task snapshot sent with `next_action` and `assess_completion`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub title: String,
    pub state: TaskState,
    pub acceptance_criteria: Vec<CriterionSnapshot>,
    pub worker_runs_count: usize,
    #[serde(default)]
    pub worker_runs: Vec<WorkerRunDigest>,
}

/// Render a request or response body for the audit log.
pub fn to_yaml<T: Serialize>(value: &T) -> String {
    serde_yaml::to_string(value).unwrap_or_else(|err| format!("# unserializable: {err}\n"))
}
