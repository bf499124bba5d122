use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HearthError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    /// A precondition the bootstrap cannot work around. Nothing further is attempted.
    #[error("fatal: {message}\nRemediation: {remediation}")]
    Fatal {
        message: String,
        remediation: String,
    },
}

impl HearthError {
    pub fn fatal(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        HearthError::Fatal {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    pub fn details(&self) -> Option<ProcessErrorDetails> {
        match self {
            HearthError::ProcessDetailed { details, .. } => Some(details.clone()),
            HearthError::Fatal { remediation, .. } => Some(ProcessErrorDetails {
                error_code: "fatal_precondition".to_string(),
                hint: Some(remediation.clone()),
                command: None,
                raw_stderr: None,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}
