pub mod wire;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub use wire::Envelope;

pub const EXTRACTION_STAGE: &str = "extraction";
pub const PAYMENT_STAGE: &str = "payment";
pub const BLOCKCHAIN_STAGE: &str = "blockchain";
pub const EMAIL_STAGE: &str = "email";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStage {
    pub id: &'static str,
    pub name: &'static str,
}

/// Fixed processing order of the backend order pipeline.
pub const PIPELINE_STAGES: &[PipelineStage] = &[
    PipelineStage {
        id: "planning",
        name: "Planning",
    },
    PipelineStage {
        id: EXTRACTION_STAGE,
        name: "Order Extraction",
    },
    PipelineStage {
        id: "validation",
        name: "Validation",
    },
    PipelineStage {
        id: "merge",
        name: "Merge Fields",
    },
    PipelineStage {
        id: "inventory",
        name: "Inventory Check",
    },
    PipelineStage {
        id: "pricing",
        name: "Pricing",
    },
    PipelineStage {
        id: "supplier",
        name: "Supplier Quotes",
    },
    PipelineStage {
        id: "logistics",
        name: "Logistics & Shipping",
    },
    PipelineStage {
        id: "finance",
        name: "Finance",
    },
    PipelineStage {
        id: "confirmation",
        name: "Order Confirmation",
    },
    PipelineStage {
        id: PAYMENT_STAGE,
        name: "Payment",
    },
    PipelineStage {
        id: "order",
        name: "Order Record",
    },
    PipelineStage {
        id: BLOCKCHAIN_STAGE,
        name: "Blockchain Anchor",
    },
    PipelineStage {
        id: EMAIL_STAGE,
        name: "Email Notification",
    },
];

pub fn stage_position(id: &str) -> Option<usize> {
    PIPELINE_STAGES.iter().position(|stage| stage.id == id)
}

pub fn stage_display_name(id: &str) -> Option<&'static str> {
    PIPELINE_STAGES
        .iter()
        .find(|stage| stage.id == id)
        .map(|stage| stage.name)
}

pub fn is_known_stage(id: &str) -> bool {
    stage_position(id).is_some()
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Waiting,
    Skipped,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Active => "active",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Waiting => "waiting",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Position in the monotonic status lattice. `Active` and `Waiting` share a
    /// level; among terminal states a completion outranks a failure, which
    /// outranks a skip, so a retried tool that finally succeeds wins.
    pub fn lattice_rank(&self) -> u8 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::Active | StepStatus::Waiting => 1,
            StepStatus::Skipped => 2,
            StepStatus::Failed => 3,
            StepStatus::Completed => 4,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" | "queued" => Ok(StepStatus::Pending),
            "active" | "started" | "running" | "processing" | "in_progress" | "in-progress" => {
                Ok(StepStatus::Active)
            }
            "completed" | "complete" | "done" | "success" | "succeeded" => {
                Ok(StepStatus::Completed)
            }
            "failed" | "error" => Ok(StepStatus::Failed),
            "waiting" | "waiting_clarification" => Ok(StepStatus::Waiting),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("Unknown step status: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for StepStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Ok(RunStatus::Pending),
            "started" | "starting" | "running" | "waiting_clarification" | "processing" => {
                Ok(RunStatus::Running)
            }
            "completed" | "complete" | "done" | "success" => Ok(RunStatus::Completed),
            "failed" | "error" | "cancelled" | "canceled" => Ok(RunStatus::Failed),
            other => Err(format!("Unknown run status: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepLog {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A raw step update as delivered by the backend, before canonicalization.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub raw_id: Option<String>,
    pub tool_name: Option<String>,
    pub name: Option<String>,
    pub status: StepStatus,
    pub observed_at: DateTime<Utc>,
    pub progress: Option<f64>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub logs: Vec<StepLog>,
}

impl StepUpdate {
    pub fn new(status: StepStatus, observed_at: DateTime<Utc>) -> Self {
        Self {
            raw_id: None,
            tool_name: None,
            name: None,
            status,
            observed_at,
            progress: None,
            output: None,
            error: None,
            execution_time_ms: None,
            logs: Vec::new(),
        }
    }

    pub fn with_raw_id(mut self, raw_id: impl Into<String>) -> Self {
        self.raw_id = Some(raw_id.into());
        self
    }

    pub fn with_tool_name(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// One canonical pipeline stage within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub raw_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub logs: Vec<StepLog>,
}

impl Step {
    pub fn from_update(canonical_id: &str, update: &StepUpdate) -> Self {
        let name = stage_display_name(canonical_id)
            .map(str::to_string)
            .or_else(|| non_empty(update.name.as_deref()))
            .or_else(|| non_empty(update.tool_name.as_deref()))
            .unwrap_or_else(|| canonical_id.to_string());
        let start_time = if update.status == StepStatus::Pending {
            None
        } else {
            Some(update.observed_at)
        };
        let end_time = if update.status.is_terminal() {
            Some(update.observed_at)
        } else {
            None
        };
        let mut logs = update.logs.clone();
        logs.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.message.cmp(&b.message))
        });
        logs.dedup();
        Self {
            id: canonical_id.to_string(),
            name,
            status: update.status,
            start_time,
            end_time,
            progress: update.progress,
            output: update.output.clone().filter(has_content),
            error: non_empty(update.error.as_deref()),
            tool_name: non_empty(update.tool_name.as_deref()),
            raw_ids: update.raw_id.iter().cloned().collect(),
            updated_at: update.observed_at,
            execution_time_ms: update.execution_time_ms,
            logs,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingClarification {
    pub clarification_id: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// One execution of the backend workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub steps: Vec<Step>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub progress: f64,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub payment_link: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub final_output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub pending_clarification: Option<PendingClarification>,
}

impl WorkflowRun {
    pub fn new(id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            order_id: None,
            status: RunStatus::Pending,
            steps: Vec::new(),
            start_time,
            end_time: None,
            total_steps: PIPELINE_STAGES.len(),
            completed_steps: 0,
            progress: 0.0,
            current_step: None,
            current_phase: None,
            payment_link: None,
            transaction_hash: None,
            final_output: None,
            error: None,
            pending_clarification: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStats {
    pub reconnect_attempts: u32,
    pub messages_received: u64,
    pub messages_sent: u64,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub client_id: String,
    pub stats: ConnectionStats,
    #[serde(default)]
    pub last_event: Option<Envelope>,
}

impl ConnectionState {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            client_id: client_id.into(),
            stats: ConnectionStats::default(),
            last_event: None,
        }
    }
}

/// Startup client id, stable for the process lifetime.
pub fn new_client_id() -> String {
    format!("dashboard-{}", uuid::Uuid::new_v4())
}

/// RFC 3339, or the offset-less ISO form the backend writes
/// (`2025-10-09T08:53:20.000000`), read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(value) = DateTime::parse_from_rfc3339(raw) {
        return Some(value.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|value| value.and_utc())
}

pub fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Presence test for opaque tool output: null, empty strings and empty
/// containers count as absent.
pub fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}
