//! Command orchestration: validate, prepare and dispatch one action.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;
use crate::hop::{CommandResult, HopExecutor, Target};
use crate::params::Params;
use crate::registry::CommandRegistry;

/// Result of one [`Orchestrator::execute`] call.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Action name as requested.
    pub action: String,
    /// Results of the commands that ran, in submission order.
    pub results: Vec<CommandResult>,
    /// Failure, if any. Results may be non-empty even when set.
    pub error: Option<OrchestratorError>,
    /// Time spent in the executor.
    pub elapsed: Duration,
}

impl ExecutionOutcome {
    fn failed(action: &str, error: OrchestratorError) -> Self {
        Self {
            action: action.to_string(),
            results: Vec::new(),
            error: Some(error),
            elapsed: Duration::ZERO,
        }
    }

    /// Whether the call succeeded and every command exited 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.results.iter().all(CommandResult::success)
    }

    /// Stdout of the command at `index`.
    #[must_use]
    pub fn stdout(&self, index: usize) -> Option<&str> {
        self.results.get(index).map(|r| r.stdout.as_str())
    }

    /// The results, or the call error.
    ///
    /// # Errors
    ///
    /// Returns the recorded error if the call failed.
    pub fn into_result(self) -> Result<Vec<CommandResult>, OrchestratorError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.results),
        }
    }

    /// Like [`ExecutionOutcome::into_result`], also failing on the first
    /// non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns the call error, or [`OrchestratorError::RemoteExecError`].
    pub fn require_success(self) -> Result<Vec<CommandResult>, OrchestratorError> {
        let results = self.into_result()?;
        if let Some((index, failed)) = results.iter().enumerate().find(|(_, r)| !r.success()) {
            return Err(OrchestratorError::RemoteExecError {
                index,
                exit_status: failed.exit_status,
                stderr: failed
                    .error
                    .clone()
                    .unwrap_or_else(|| failed.stderr.trim().to_string()),
            });
        }
        Ok(results)
    }

    /// JSON rendering used by the CLI.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "action": self.action,
            "success": self.is_success(),
            "elapsed_ms": u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX),
            "error": self.error.as_ref().map(|e| json!({"kind": e.kind(), "message": e.to_string()})),
            "results": self.results,
        })
    }
}

/// Dispatches registered actions to a [`HopExecutor`].
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<CommandRegistry>,
    executor: Arc<dyn HopExecutor>,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(registry: Arc<CommandRegistry>, executor: Arc<dyn HopExecutor>, timeout: Duration) -> Self {
        Self {
            registry,
            executor,
            timeout,
        }
    }

    /// Copy of this orchestrator with a different per-call timeout.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registered action names, sorted.
    #[must_use]
    pub fn actions(&self) -> Vec<&str> {
        self.registry.actions()
    }

    /// Validate `params` and build the command list for `action`.
    ///
    /// No I/O happens here and the result only depends on the inputs.
    ///
    /// # Errors
    ///
    /// `UnsupportedAction`, `ValidationFailed` or `BuildFailed`.
    pub fn prepare(&self, action: &str, params: &Params) -> Result<Vec<String>, OrchestratorError> {
        let template = self
            .registry
            .lookup(action)
            .ok_or_else(|| OrchestratorError::UnsupportedAction(action.to_string()))?;

        if let Some(validate) = &template.validate {
            validate(params).map_err(|e| OrchestratorError::ValidationFailed {
                action: action.to_string(),
                message: format!("{e:#}"),
            })?;
        }

        match (&template.build, &template.commands) {
            (Some(build), _) => build(params).map_err(|e| OrchestratorError::BuildFailed {
                action: action.to_string(),
                message: format!("{e:#}"),
            }),
            (None, Some(commands)) => Ok(commands.clone()),
            (None, None) => Err(OrchestratorError::BuildFailed {
                action: action.to_string(),
                message: "template has neither commands nor a builder".to_string(),
            }),
        }
    }

    /// Prepare `action` and run it on the last hop of `target`.
    ///
    /// A missing target is treated as an empty one.
    pub async fn execute(&self, action: &str, params: &Params, target: Option<&Target>) -> ExecutionOutcome {
        let commands = match self.prepare(action, params) {
            Ok(commands) => commands,
            Err(e) => {
                warn!(action = %action, error = %e, "action rejected");
                return ExecutionOutcome::failed(action, e);
            }
        };

        let hops = target.map_or(&[][..], |t| t.hops.as_slice());
        if hops.is_empty() {
            warn!(action = %action, "no target hops supplied");
            return ExecutionOutcome::failed(action, OrchestratorError::NoTarget(action.to_string()));
        }

        info!(action = %action, hops = hops.len(), commands = commands.len(), "executing action");
        let started = Instant::now();
        let executed = self.executor.execute(hops, &commands, self.timeout).await;
        let elapsed = started.elapsed();

        match executed {
            Ok(results) => {
                debug!(action = %action, elapsed_ms = elapsed.as_millis(), "action finished");
                ExecutionOutcome {
                    action: action.to_string(),
                    results,
                    error: None,
                    elapsed,
                }
            }
            Err(e) => {
                let error = OrchestratorError::from_executor_message(e.message());
                warn!(action = %action, kind = error.kind(), error = %e, "action failed");
                ExecutionOutcome {
                    action: action.to_string(),
                    results: e.into_completed(),
                    error: Some(error),
                    elapsed,
                }
            }
        }
    }
}
