use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_PATH_PREFIX: &str = "/status";
pub const ERROR_MALFORMED_REQUEST: &str = "malformed_request";
pub const ERROR_CONFLICT: &str = "conflict";
pub const ERROR_UNAUTHORIZED: &str = "unauthorized";
pub const ERROR_FORBIDDEN_ORIGIN: &str = "forbidden_origin";
pub const ERROR_NOT_FOUND: &str = "not_found";

/// Lifecycle stage of the compute instance bound to a device.
///
/// The only legal cycle is `Idle -> Starting -> Running -> Stopping -> Idle`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ControlRequest {
    pub device_id: String,
    #[serde(default)]
    pub timestamp: String,
    pub run: bool,
}

/// Outcome reported in the `status` field of a control response.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlStatus {
    Init,
    Stopping,
    AlreadyRunning,
    AlreadyIdle,
    InTransition,
}

impl ControlStatus {
    /// Status for a request that was rejected while the record sat in `phase`.
    pub fn rejected(phase: Phase) -> Self {
        match phase {
            Phase::Running => Self::AlreadyRunning,
            Phase::Idle => Self::AlreadyIdle,
            Phase::Starting | Phase::Stopping => Self::InTransition,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ControlResponse {
    pub status: ControlStatus,
    pub phase: Phase,
    pub websocket_url: String,
    pub compute_instance: String,
    pub ready: bool,
    pub cost_per_hour: f64,
    pub idle_after_min: f64,
}

/// One state transition as delivered on the status stream.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StatusEvent {
    #[serde(rename = "status")]
    pub phase: Phase,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl StatusEvent {
    pub fn new(device_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            phase,
            device_id: device_id.into(),
            timestamp: Utc::now(),
            error_detail: None,
        }
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InferenceRequest {
    pub device_id: String,
    #[serde(default)]
    pub timestamp: String,
    pub prompt: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InferenceResponse {
    pub status: String,
    pub response: String,
    pub latency: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            error: error.into(),
        }
    }
}

pub fn status_path(device_id: &str) -> String {
    format!("{STATUS_PATH_PREFIX}/{device_id}")
}
