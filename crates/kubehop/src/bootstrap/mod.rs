//! Cluster bootstrap workflow.
//!
//! A node install runs detached on the remote host; nothing is kept in memory
//! between calls. Progress is read back from marker files under the remote
//! working directory and mapped to a [`BootstrapState`] by a pure function.
//!
//! The usual flow for the first control-plane node is:
//!
//! 1. [`BootstrapWorkflow::launch_first_master`] writes and starts the install
//!    script, then starts the watcher that extracts the join credential once
//!    the install prints its sentinel.
//! 2. [`BootstrapWorkflow::status`] (or [`BootstrapWorkflow::wait_for_install`])
//!    reports progress.
//! 3. [`BootstrapWorkflow::fetch_credentials`] reads the join markers, falling
//!    back to extracting from the install log locally.

mod extract;
mod layout;
mod script;
mod state;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use extract::{
    accept_join_command, extract, Attempt, Cascade, ExtractedCredential, ExtractionReport, Strategy,
    ANCHOR_CONTEXT_LINES, CERT_KEY_ANCHOR, INSTALL_SENTINEL, JOIN_ANCHOR,
};
pub use layout::RemoteLayout;
pub use script::{FirstMasterVars, JoinVars, ScriptRenderer, WatcherVars};
pub use state::{status_command, BootstrapState, MarkerSnapshot, LOG_TAIL_LINES};

use crate::actions::cluster;
use crate::config::Settings;
use crate::error::OrchestratorError;
use crate::hop::{CommandResult, Target};
use crate::inventory::{credentials_fresh, InventoryError, NodeStore};
use crate::orchestrator::Orchestrator;
use crate::params::Params;

/// Errors raised by the bootstrap workflow.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("install has not completed: {0}")]
    NotInstalled(BootstrapState),

    #[error("install still running after {0}s")]
    Timeout(u64),

    #[error("no join credential could be recovered after {} attempts", .report.attempts.len())]
    CredentialUnavailable { report: Box<ExtractionReport> },

    #[error("node {0} is not in the inventory")]
    UnknownNode(String),

    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// Where a join credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Marker files written by the remote watcher.
    Markers,
    /// Extracted locally from the install log.
    InstallLog,
    /// Reused from the node store.
    Store,
    /// Newly minted on the control-plane node.
    Refreshed,
}

/// A join credential with its provenance.
#[derive(Debug, Clone, Serialize)]
pub struct FetchedCredential {
    pub credential: ExtractedCredential,
    pub source: CredentialSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ExtractionReport>,
}

/// Drives detached installs through an [`Orchestrator`].
pub struct BootstrapWorkflow {
    orchestrator: Orchestrator,
    credential_validity: Duration,
}

impl BootstrapWorkflow {
    #[must_use]
    pub fn new(orchestrator: Orchestrator, settings: &Settings) -> Self {
        Self {
            orchestrator,
            credential_validity: settings.credential_validity(),
        }
    }

    async fn run(&self, action: &str, params: &Params, target: &Target) -> Result<Vec<CommandResult>, BootstrapError> {
        Ok(self
            .orchestrator
            .execute(action, params, Some(target))
            .await
            .require_success()?)
    }

    /// Start the first control-plane install and its watcher.
    ///
    /// # Errors
    ///
    /// Fails if either launch fails; the install keeps running if only the
    /// watcher launch failed.
    pub async fn launch_first_master(&self, target: &Target, params: &Params) -> Result<(), BootstrapError> {
        self.run(cluster::INSTALL_FIRST_MASTER, params, target).await?;
        info!(hops = target.hops.len(), "first control-plane install launched");

        self.run(cluster::START_JOIN_WATCHER, params, target).await?;
        info!("join watcher launched");
        Ok(())
    }

    /// Start a join install on a worker or additional control-plane node.
    ///
    /// # Errors
    ///
    /// Fails if the launch fails.
    pub async fn launch_join(&self, target: &Target, params: &Params, control_plane: bool) -> Result<(), BootstrapError> {
        let action = if control_plane {
            cluster::JOIN_MASTER
        } else {
            cluster::JOIN_WORKER
        };
        self.run(action, params, target).await?;
        info!(action, "join install launched");
        Ok(())
    }

    /// Read the markers and infer the install state.
    ///
    /// # Errors
    ///
    /// Fails if the status action fails.
    pub async fn status(&self, target: &Target) -> Result<(BootstrapState, MarkerSnapshot), BootstrapError> {
        let results = self.run(cluster::CHECK_INSTALL_STATUS, &Params::new(), target).await?;
        let stdout = results.first().map_or("", |r| r.stdout.as_str());
        let markers = MarkerSnapshot::parse(stdout);
        let state = BootstrapState::from_markers(&markers);
        debug!(state = %state, "install status");
        Ok((state, markers))
    }

    /// Poll [`BootstrapWorkflow::status`] until the install is terminal.
    ///
    /// # Errors
    ///
    /// Fails if a status call fails or `max_wait` elapses.
    pub async fn wait_for_install(
        &self,
        target: &Target,
        interval: Duration,
        max_wait: Duration,
    ) -> Result<BootstrapState, BootstrapError> {
        info!(max_wait_secs = max_wait.as_secs(), "waiting for install to finish");
        let start = Instant::now();

        loop {
            let (state, _) = self.status(target).await?;
            debug!(state = %state, elapsed_secs = start.elapsed().as_secs(), "checking install");

            if state.is_terminal() {
                info!(state = %state, "install finished");
                return Ok(state);
            }

            if start.elapsed() > max_wait {
                return Err(BootstrapError::Timeout(max_wait.as_secs()));
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Read the join credential, re-deriving it from the install log when the
    /// markers are empty or incomplete.
    ///
    /// # Errors
    ///
    /// Fails if the reads fail, the install has not completed while the
    /// markers are empty, or no strategy recovers a join command.
    pub async fn fetch_credentials(&self, target: &Target) -> Result<FetchedCredential, BootstrapError> {
        let results = self.run(cluster::FETCH_JOIN_CREDENTIALS, &Params::new(), target).await?;
        let join = results.first().map_or("", |r| r.stdout.trim());
        let cert = results.get(1).map_or("", |r| r.stdout.trim());

        if accept_join_command(join) {
            debug!("join credential read from markers");
            return Ok(FetchedCredential {
                credential: ExtractedCredential {
                    join_command: join.to_string(),
                    certificate_key: Some(cert.to_string()).filter(|c| !c.is_empty()),
                },
                source: CredentialSource::Markers,
                report: None,
            });
        }

        let (state, _) = self.status(target).await?;
        if !matches!(state, BootstrapState::Installed { .. }) {
            return Err(BootstrapError::NotInstalled(state));
        }

        warn!("join markers empty or incomplete, extracting from install log");
        let results = self.run(cluster::READ_INSTALL_LOG, &Params::new(), target).await?;
        let log = results.first().map_or("", |r| r.stdout.as_str());
        Self::from_report(extract(log), CredentialSource::InstallLog)
    }

    /// Mint a new join command and certificate key on a control-plane node.
    ///
    /// # Errors
    ///
    /// Fails if the commands fail or their output carries no join command.
    pub async fn refresh_credentials(&self, target: &Target, params: &Params) -> Result<FetchedCredential, BootstrapError> {
        let results = self.run(cluster::REFRESH_JOIN_CREDENTIALS, params, target).await?;
        let output: Vec<&str> = results.iter().map(|r| r.stdout.as_str()).collect();
        Self::from_report(extract(&output.join("\n")), CredentialSource::Refreshed)
    }

    fn from_report(report: ExtractionReport, source: CredentialSource) -> Result<FetchedCredential, BootstrapError> {
        match report.credential() {
            Some(credential) => Ok(FetchedCredential {
                credential,
                source,
                report: Some(report),
            }),
            None => {
                warn!(
                    attempts = report.attempts.len(),
                    candidates = report.candidate_lines.len(),
                    "join credential extraction failed"
                );
                Err(BootstrapError::CredentialUnavailable {
                    report: Box::new(report),
                })
            }
        }
    }

    /// Return the stored join credential of `master` if it is younger than
    /// the validity window, otherwise mint a new one on `target` and store it.
    ///
    /// # Errors
    ///
    /// Fails if the node is unknown, the store fails or no credential can be
    /// minted.
    pub async fn ensure_join_credential(
        &self,
        store: &dyn NodeStore,
        master: &str,
        target: &Target,
        params: &Params,
        now: DateTime<Utc>,
    ) -> Result<FetchedCredential, BootstrapError> {
        let mut record = store
            .get(master)
            .await?
            .ok_or_else(|| BootstrapError::UnknownNode(master.to_string()))?;

        if let Some(credential) = record.credential() {
            if credentials_fresh(record.updated_at, now, self.credential_validity) {
                debug!(node = %master, "reusing stored join credential");
                return Ok(FetchedCredential {
                    credential,
                    source: CredentialSource::Store,
                    report: None,
                });
            }
        }

        info!(node = %master, "stored join credential missing or stale, refreshing");
        let fetched = self.refresh_credentials(target, params).await?;
        record.set_credential(&fetched.credential, now);
        store.put(record).await?;
        Ok(fetched)
    }

    /// Kill the detached install and watcher.
    ///
    /// # Errors
    ///
    /// Fails if the cancel action fails.
    pub async fn cancel(&self, target: &Target, params: &Params) -> Result<(), BootstrapError> {
        self.run(cluster::CANCEL_INSTALL, params, target).await?;
        info!("install cancelled");
        Ok(())
    }
}
