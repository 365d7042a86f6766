//! Wire types of the node protocol.

use serde::{Deserialize, Serialize};

/// Body of `POST /jobs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitRequest {
    pub job_kind: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Kiln's task id, so node logs can be correlated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitResponse {
    pub job_id: String,
}

/// Node-side state of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Body of `GET /jobs/{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusReport {
    pub state: JobState,
    /// Fraction complete in `0.0..=1.0`, when the engine reports one.
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobStatusReport {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            progress: None,
            result: None,
            error: None,
        }
    }
}

/// Self-reported condition in a health response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedHealth {
    Ok,
    /// Alive, but its engine will not take more work right now.
    Busy,
    /// Alive, but something is wrong (e.g. overloaded, engine crashed).
    Degraded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadInfo {
    pub running: u32,
    pub queued: u32,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthReport {
    pub status: ReportedHealth,
    #[serde(default)]
    pub load: Option<LoadInfo>,
}

impl HealthReport {
    pub fn ok() -> Self {
        Self {
            status: ReportedHealth::Ok,
            load: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_report_tolerates_missing_optionals() {
        let report: JobStatusReport = serde_json::from_str(r#"{"state":"running"}"#).unwrap();
        assert_eq!(report.state, JobState::Running);
        assert!(report.progress.is_none());
    }

    #[test]
    fn health_report_parses_load() {
        let report: HealthReport =
            serde_json::from_str(r#"{"status":"busy","load":{"running":2,"queued":5}}"#)
                .unwrap();
        assert_eq!(report.status, ReportedHealth::Busy);
        assert_eq!(report.load, Some(LoadInfo { running: 2, queued: 5 }));
    }

    #[test]
    fn submit_request_omits_missing_ref() {
        let body = serde_json::to_value(SubmitRequest {
            job_kind: "image".to_string(),
            parameters: serde_json::json!({"steps": 20}),
            client_ref: None,
        })
        .unwrap();
        assert!(body.get("client_ref").is_none());
    }

    #[test]
    fn terminal_job_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Queued.is_terminal());
    }
}
