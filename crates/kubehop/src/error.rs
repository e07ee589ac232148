//! Orchestrator error taxonomy and executor failure classification.

use serde::Serialize;
use thiserror::Error;

/// Errors returned by the orchestrator for a single action call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// No template is registered under the action name.
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    /// The template's validator rejected the parameters.
    #[error("validation failed for {action}: {message}")]
    ValidationFailed { action: String, message: String },

    /// The template's builder could not produce a command list.
    #[error("failed to build commands for {action}: {message}")]
    BuildFailed { action: String, message: String },

    /// The target has no hops.
    #[error("no target hops supplied for {0}")]
    NoTarget(String),

    /// A hop could not be reached.
    #[error("connection failed: {0}")]
    ConnectError(String),

    /// The per-call timeout elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A hop rejected the supplied credential.
    #[error("authentication failed: {0}")]
    AuthError(String),

    /// A remote command exited non-zero.
    #[error("command {index} exited with status {exit_status}: {stderr}")]
    RemoteExecError {
        index: usize,
        exit_status: i32,
        stderr: String,
    },
}

impl OrchestratorError {
    /// Stable snake-case name of the variant, used in CLI output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedAction(_) => "unsupported_action",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::BuildFailed { .. } => "build_failed",
            Self::NoTarget(_) => "no_target",
            Self::ConnectError(_) => "connect_error",
            Self::Timeout(_) => "timeout",
            Self::AuthError(_) => "auth_error",
            Self::RemoteExecError { .. } => "remote_exec_error",
        }
    }

    /// Build the error matching an executor failure message.
    #[must_use]
    pub fn from_executor_message(message: &str) -> Self {
        match classify_failure(message) {
            FailureKind::Timeout => Self::Timeout(message.to_string()),
            FailureKind::Auth => Self::AuthError(message.to_string()),
            FailureKind::Connect => Self::ConnectError(message.to_string()),
        }
    }
}

/// Category of a failed executor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Auth,
    Connect,
}

const TIMEOUT_KEYWORDS: &[&str] = &["timed out", "timeout", "deadline has elapsed"];

const AUTH_KEYWORDS: &[&str] = &[
    "authentication failed",
    "auth failed",
    "permission denied",
    "no authentication methods",
    "failed to decode private key",
    "failed to load private key",
];

const CONNECT_KEYWORDS: &[&str] = &[
    "connection refused",
    "connection reset",
    "no route to host",
    "network is unreachable",
    "failed to lookup address",
    "could not resolve",
    "broken pipe",
    "failed to connect",
    "disconnected",
];

/// Classify an executor error message.
///
/// Keywords are matched case-insensitively; timeout wins over auth, auth wins
/// over connect. Anything unrecognised is treated as a connection failure.
#[must_use]
pub fn classify_failure(message: &str) -> FailureKind {
    let lowered = message.to_lowercase();
    let matches = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

    if matches(TIMEOUT_KEYWORDS) {
        FailureKind::Timeout
    } else if matches(AUTH_KEYWORDS) {
        FailureKind::Auth
    } else {
        if !matches(CONNECT_KEYWORDS) {
            tracing::debug!("unrecognised executor failure, treating as connect error");
        }
        FailureKind::Connect
    }
}
