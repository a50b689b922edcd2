use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

/// Output shown in place of converted SQL when a conversion request fails.
pub const CONVERSION_FAILED_MARKER: &str = "Conversion failed";

/// Effective settings for one run, printed by `migration-console config`.
#[derive(Debug, Clone, Serialize)]
pub struct ConsoleConfig {
    pub base_url: String,
    pub login_url: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub stop_policy: StopPolicy,
    pub user_agent: String,
}

/// Which observed statuses end polling for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Only `completed` cancels the timer; an `error` status keeps being polled.
    #[default]
    CompletedOnly,
    /// Both `completed` and `error` cancel the timer.
    CompletedOrError,
}

impl StopPolicy {
    pub fn is_terminal(self, status: TaskStatus) -> bool {
        match self {
            StopPolicy::CompletedOnly => status == TaskStatus::Completed,
            StopPolicy::CompletedOrError => {
                matches!(status, TaskStatus::Completed | TaskStatus::Error)
            }
        }
    }
}

/// Backend-assigned task identifier.
///
/// The service has been seen to return both strings and bare numbers, so
/// both are accepted and kept as an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => TaskId(s),
            Raw::Number(n) => TaskId(n.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
    /// Any status string the console does not recognise.
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts migrated so far. Always replaced as a whole, never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub tables: u64,
    pub rows: u64,
    pub sprocs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: TaskStatus,
    #[serde(default)]
    pub tables: Option<u64>,
    #[serde(default)]
    pub rows: Option<u64>,
    #[serde(default)]
    pub sprocs: Option<u64>,
}

impl StatusResponse {
    /// Progress carried by this response, if it reported any counts at all.
    pub fn progress(&self) -> Option<ProgressSnapshot> {
        if self.tables.is_none() && self.rows.is_none() && self.sprocs.is_none() {
            return None;
        }
        Some(ProgressSnapshot {
            tables: self.tables.unwrap_or(0),
            rows: self.rows.unwrap_or(0),
            sprocs: self.sprocs.unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertRequest<'a> {
    pub sql: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionResult {
    #[serde(rename = "converted")]
    pub converted_sql: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ConversionResult {
    pub fn failed() -> Self {
        Self {
            converted_sql: CONVERSION_FAILED_MARKER.to_string(),
            warnings: Vec::new(),
        }
    }

    pub fn is_failure_marker(&self) -> bool {
        self.converted_sql == CONVERSION_FAILED_MARKER && self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// What the console currently knows about its migration task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TaskSnapshot {
    pub task_id: Option<TaskId>,
    pub status: TaskStatus,
    pub progress: Option<ProgressSnapshot>,
}

#[derive(Debug, Clone)]
pub enum ConsoleEvent {
    TaskStarted {
        task_id: TaskId,
    },
    TaskStartFailed {
        message: String,
    },
    TaskUpdated {
        snapshot: TaskSnapshot,
    },
    PollSkipped {
        task_id: TaskId,
        message: String,
    },
    PollingStopped {
        task_id: TaskId,
        status: TaskStatus,
    },
    ConversionFinished {
        result: ConversionResult,
        ok: bool,
    },
    SessionExpired {
        login_url: String,
    },
    Info(String),
}

impl ConsoleEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            ConsoleEvent::TaskStarted { task_id } => format!("Migration task {task_id} started"),
            ConsoleEvent::TaskStartFailed { message } => {
                format!("Failed to start migration: {message}")
            }
            ConsoleEvent::TaskUpdated { snapshot } => {
                crate::presenter::status_line(snapshot)
            }
            ConsoleEvent::PollSkipped { task_id, message } => {
                format!("Status poll for {task_id} skipped: {message}")
            }
            ConsoleEvent::PollingStopped { task_id, status } => {
                format!("Stopped polling {task_id} ({status})")
            }
            ConsoleEvent::ConversionFinished { ok: true, result } => format!(
                "Conversion finished with {} warning(s)",
                result.warnings.len()
            ),
            ConsoleEvent::ConversionFinished { ok: false, .. } => {
                CONVERSION_FAILED_MARKER.to_string()
            }
            ConsoleEvent::SessionExpired { login_url } => {
                format!("Session expired, log in again at {login_url}")
            }
            ConsoleEvent::Info(msg) => msg.clone(),
        }
    }
}
