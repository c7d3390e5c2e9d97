use serde::{Deserialize, Serialize};
use serde_json::Value;
use workpool::{CancelOutcome, TaskId, TaskReport};

use crate::server::ServerError;

#[derive(Debug, Deserialize, Clone)]
pub struct TaskRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmittedResponse {
    pub id: TaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: TaskId,
    pub outcome: CancelOutcome,
}

/// A finished task as returned over HTTP.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskReportBody {
    pub id: TaskId,
    pub result: Value,
    pub duration_ms: u64,
    pub queue_wait_ms: u64,
}

impl TryFrom<TaskReport> for TaskReportBody {
    type Error = ServerError;

    fn try_from(report: TaskReport) -> Result<Self, Self::Error> {
        let TaskReport {
            task_id,
            outcome,
            duration,
            queue_wait,
        } = report;

        Ok(Self {
            id: task_id,
            result: outcome?,
            duration_ms: duration.as_millis() as u64,
            queue_wait_ms: queue_wait.as_millis() as u64,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KindsResponse {
    pub status: String,
    pub kinds: Vec<String>,
}
