//! Messages exchanged between the runner and its workers.
//!
//! Each message is one JSON document carried in one channel frame.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Identifier of a task within one run.
pub type TaskId = u64;

/// Request from the runner to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkRequest {
    /// Run one command and report its outcome.
    #[serde(rename = "run")]
    Run {
        task_id: TaskId,
        argv: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },

    /// Graceful shutdown request.
    #[serde(rename = "exit")]
    Exit,
}

/// Response from a worker to the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkResponse {
    /// Worker is ready for work. Sent once at startup.
    #[serde(rename = "ready")]
    Ready,

    /// The command ran; `status` is its exit code.
    #[serde(rename = "completed")]
    Completed {
        task_id: TaskId,
        status: i32,
        stdout: String,
        stderr: String,
    },

    /// The command could not be started.
    #[serde(rename = "failed")]
    Failed { task_id: TaskId, message: String },
}

impl WorkRequest {
    pub fn run(task_id: TaskId, argv: Vec<String>) -> Self {
        Self::Run {
            task_id,
            argv,
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl WorkResponse {
    pub fn failed(task_id: TaskId, message: impl Into<String>) -> Self {
        Self::Failed {
            task_id,
            message: message.into(),
        }
    }

    /// The task this response reports on, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Ready => None,
            Self::Completed { task_id, .. } | Self::Failed { task_id, .. } => Some(*task_id),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_request_wire_shape() {
        let req = WorkRequest::run(4, vec!["cc".into(), "-c".into(), "a.c".into()]);
        let json: serde_json::Value = serde_json::from_slice(&req.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "run");
        assert_eq!(json["task_id"], 4);
        assert!(json.get("cwd").is_none());
        assert!(json.get("env").is_none());
    }

    #[test]
    fn test_run_request_with_cwd_and_env() {
        let parsed = WorkRequest::from_bytes(
            br#"{"type":"run","task_id":1,"argv":["make"],"cwd":"/tmp","env":{"A":"1"}}"#,
        )
        .unwrap();
        match parsed {
            WorkRequest::Run { cwd, env, .. } => {
                assert_eq!(cwd, Some(PathBuf::from("/tmp")));
                assert_eq!(env.get("A").map(String::as_str), Some("1"));
            }
            _ => panic!("Expected Run variant"),
        }
    }

    #[test]
    fn test_exit_and_ready() {
        assert_eq!(WorkRequest::Exit.to_bytes().unwrap(), br#"{"type":"exit"}"#);
        assert_eq!(
            WorkResponse::from_bytes(br#"{"type":"ready"}"#).unwrap(),
            WorkResponse::Ready
        );
    }

    #[test]
    fn test_response_task_id() {
        let done = WorkResponse::Completed {
            task_id: 9,
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(done.task_id(), Some(9));
        assert_eq!(WorkResponse::failed(3, "nope").task_id(), Some(3));
        assert_eq!(WorkResponse::Ready.task_id(), None);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(WorkResponse::from_bytes(b"not json").is_err());
        assert!(WorkResponse::from_bytes(br#"{"type":"bogus"}"#).is_err());
    }
}
