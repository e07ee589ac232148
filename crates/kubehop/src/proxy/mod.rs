//! Load balancer backend patching.
//!
//! [`ProxyPatcher::apply`] reads the `HAProxy` configuration through a
//! [`ProxyHost`], mutates the backend server list in memory and, only if the
//! document changed, backs the file up, writes it, runs the syntax check and
//! restarts the service. A failed check restores the backup.
//!
//! There is no lock around the read-modify-write cycle; two patchers working
//! on the same proxy at once can lose an update.

mod document;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use document::{DocumentError, ProxyConfigDocument, ServerChange, ServerEntry};

use crate::actions::proxy::{
    PROXY_BACKUP_CONFIG, PROXY_CHECK_CONFIG, PROXY_READ_CONFIG, PROXY_RESTART, PROXY_RESTORE_CONFIG,
    PROXY_WRITE_CONFIG,
};
use crate::hop::{CommandResult, Target};
use crate::orchestrator::Orchestrator;
use crate::params::Params;

/// Errors raised while patching a proxy configuration.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("{step} failed: {message}")]
    Host { step: &'static str, message: String },

    #[error("proxy configuration failed the syntax check and was restored from {backup}: {output}")]
    SyntaxCheckFailed { backup: String, output: String },

    #[error("proxy configuration failed the syntax check and restoring {backup} failed: {message}")]
    RestoreFailed { backup: String, output: String, message: String },

    #[error("proxy configuration written but the service did not restart: {0}")]
    RestartFailed(String),
}

impl PatchError {
    fn host(step: &'static str, error: &anyhow::Error) -> Self {
        Self::Host {
            step,
            message: format!("{error:#}"),
        }
    }
}

/// Result of the proxy's own syntax check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxCheck {
    pub valid: bool,
    pub output: String,
}

/// File and service operations on the proxy host.
#[async_trait]
pub trait ProxyHost: Send + Sync {
    async fn read_config(&self) -> Result<String>;

    /// Copy the configuration to a timestamped backup and return its path.
    async fn backup_config(&self) -> Result<String>;

    async fn write_config(&self, content: &str) -> Result<()>;

    async fn check_config(&self) -> Result<SyntaxCheck>;

    async fn restore_config(&self, backup: &str) -> Result<()>;

    async fn restart(&self) -> Result<()>;
}

/// A mutation of the backend server list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOp {
    Add(ServerEntry),
    Remove { name: String },
}

/// Outcome of a successful patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    pub change: ServerChange,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    pub restarted: bool,
}

/// Applies [`BackendOp`]s to one named backend.
#[derive(Debug, Clone)]
pub struct ProxyPatcher {
    backend: String,
}

impl ProxyPatcher {
    #[must_use]
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Apply `op` to the proxy behind `host`.
    ///
    /// # Errors
    ///
    /// Fails if the backend does not exist, a host operation fails, the
    /// patched file fails the syntax check (the backup is restored) or the
    /// service does not restart.
    pub async fn apply(&self, host: &dyn ProxyHost, op: &BackendOp) -> Result<PatchReport, PatchError> {
        let original = host
            .read_config()
            .await
            .map_err(|e| PatchError::host("reading proxy configuration", &e))?;

        let mut document = ProxyConfigDocument::parse(&original);
        let change = match op {
            BackendOp::Add(server) => document.add_server(&self.backend, server)?,
            BackendOp::Remove { name } => document.remove_server(&self.backend, name)?,
        };

        let patched = document.render();
        if change == ServerChange::Unchanged || patched == original {
            debug!(backend = %self.backend, "proxy backend already up to date");
            return Ok(PatchReport {
                change: ServerChange::Unchanged,
                backup: None,
                restarted: false,
            });
        }

        let backup = host
            .backup_config()
            .await
            .map_err(|e| PatchError::host("backing up proxy configuration", &e))?;
        debug!(backup = %backup, "proxy configuration backed up");

        if let Err(e) = host.write_config(&patched).await {
            warn!(error = %e, "writing proxy configuration failed, restoring backup");
            restore_quietly(host, &backup).await;
            return Err(PatchError::host("writing proxy configuration", &e));
        }

        let check = match host.check_config().await {
            Ok(check) => check,
            Err(e) => {
                warn!(error = %e, "checking proxy configuration failed, restoring backup");
                restore_quietly(host, &backup).await;
                return Err(PatchError::host("checking proxy configuration", &e));
            }
        };
        if !check.valid {
            warn!(backup = %backup, "patched proxy configuration rejected, restoring backup");
            return match host.restore_config(&backup).await {
                Ok(()) => Err(PatchError::SyntaxCheckFailed {
                    backup,
                    output: check.output,
                }),
                Err(e) => Err(PatchError::RestoreFailed {
                    backup,
                    output: check.output,
                    message: format!("{e:#}"),
                }),
            };
        }

        host.restart()
            .await
            .map_err(|e| PatchError::RestartFailed(format!("{e:#}")))?;

        info!(backend = %self.backend, change = ?change, "proxy backend patched");
        Ok(PatchReport {
            change,
            backup: Some(backup),
            restarted: true,
        })
    }
}

/// Put `backup` back after a failed step; the step's error is what gets reported.
async fn restore_quietly(host: &dyn ProxyHost, backup: &str) {
    if let Err(e) = host.restore_config(backup).await {
        warn!(error = %e, backup = %backup, "restoring proxy configuration failed");
    }
}

/// [`ProxyHost`] reached through the orchestrator's proxy actions.
pub struct RemoteProxyHost {
    orchestrator: Orchestrator,
    target: Target,
    params: Params,
}

impl RemoteProxyHost {
    /// `params` carries the shared `password` and `config_path`.
    #[must_use]
    pub fn new(orchestrator: Orchestrator, target: Target, params: Params) -> Self {
        Self {
            orchestrator,
            target,
            params,
        }
    }

    async fn run(&self, action: &str, params: &Params) -> Result<CommandResult> {
        let results = self
            .orchestrator
            .execute(action, params, Some(&self.target))
            .await
            .into_result()?;
        results
            .into_iter()
            .next()
            .with_context(|| format!("{action} produced no result"))
    }

    async fn run_ok(&self, action: &str, params: &Params) -> Result<CommandResult> {
        let result = self.run(action, params).await?;
        if !result.success() {
            anyhow::bail!(
                "{action} exited with status {}: {}",
                result.exit_status,
                result.stderr.trim()
            );
        }
        Ok(result)
    }
}

#[async_trait]
impl ProxyHost for RemoteProxyHost {
    async fn read_config(&self) -> Result<String> {
        Ok(self.run_ok(PROXY_READ_CONFIG, &self.params).await?.stdout)
    }

    async fn backup_config(&self) -> Result<String> {
        let result = self.run_ok(PROXY_BACKUP_CONFIG, &self.params).await?;
        result
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(str::to_string)
            .context("backup command did not print the backup path")
    }

    async fn write_config(&self, content: &str) -> Result<()> {
        let params = self.params.clone().with("content", STANDARD.encode(content));
        self.run_ok(PROXY_WRITE_CONFIG, &params).await.map(|_| ())
    }

    async fn check_config(&self) -> Result<SyntaxCheck> {
        let result = self.run(PROXY_CHECK_CONFIG, &self.params).await?;
        Ok(SyntaxCheck {
            valid: result.success(),
            output: format!("{}{}", result.stdout, result.stderr).trim().to_string(),
        })
    }

    async fn restore_config(&self, backup: &str) -> Result<()> {
        let params = self.params.clone().with("backup_path", backup);
        self.run_ok(PROXY_RESTORE_CONFIG, &params).await.map(|_| ())
    }

    async fn restart(&self) -> Result<()> {
        self.run_ok(PROXY_RESTART, &self.params).await.map(|_| ())
    }
}
