//! Install state inferred from remote marker files.

use std::fmt;

use serde::Serialize;

use super::extract::INSTALL_SENTINEL;
use super::layout::RemoteLayout;
use crate::shell::quote;

const SECTION_PREFIX: &str = "==> ";

/// Lines of install log included in a status report.
pub const LOG_TAIL_LINES: usize = 20;

/// Shell command printing every marker as a `==> name` section.
///
/// The join credential itself is never printed, only whether it exists.
#[must_use]
pub fn status_command(layout: &RemoteLayout) -> String {
    let pid = quote(&layout.install_pid());
    let log = quote(&layout.install_log());
    let sections = [
        format!("echo '==> pid'; cat {pid} 2>/dev/null"),
        format!(
            "echo '==> running'; if [ -s {pid} ] && ps -p \"$(cat {pid})\" >/dev/null 2>&1; then echo yes; else echo no; fi"
        ),
        format!(
            "echo '==> sentinel'; if grep -qxF {} {log} 2>/dev/null; then echo yes; else echo no; fi",
            quote(INSTALL_SENTINEL)
        ),
        format!("echo '==> failed'; cat {} 2>/dev/null", quote(&layout.install_failed())),
        format!("echo '==> watcher'; cat {} 2>/dev/null", quote(&layout.watcher_status())),
        format!(
            "echo '==> join'; if [ -s {} ]; then echo present; else echo missing; fi",
            quote(&layout.join_command())
        ),
        format!("echo '==> log'; tail -n {LOG_TAIL_LINES} {log} 2>/dev/null"),
    ];
    format!("{}; true", sections.join("; "))
}

/// Parsed output of [`status_command`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MarkerSnapshot {
    pub pid: Option<u32>,
    pub running: bool,
    pub sentinel_seen: bool,
    pub failure: Option<String>,
    pub watcher_status: Option<String>,
    pub join_ready: bool,
    pub log_tail: String,
}

impl MarkerSnapshot {
    /// Parse sectioned status output. Unknown sections are ignored.
    #[must_use]
    pub fn parse(stdout: &str) -> Self {
        let mut snapshot = Self::default();
        let mut current: Option<&str> = None;
        let mut body: Vec<&str> = Vec::new();

        for line in stdout.lines().chain(std::iter::once("==> end")) {
            if let Some(name) = line.strip_prefix(SECTION_PREFIX) {
                if let Some(section) = current {
                    snapshot.apply(section, &body);
                }
                current = Some(name.trim());
                body.clear();
            } else if current.is_some() {
                body.push(line);
            }
        }

        snapshot
    }

    fn apply(&mut self, section: &str, body: &[&str]) {
        let text = body.join("\n");
        let text = text.trim();
        match section {
            "pid" => self.pid = text.parse().ok(),
            "running" => self.running = text == "yes",
            "sentinel" => self.sentinel_seen = text == "yes",
            "failed" => self.failure = Some(text.to_string()).filter(|s| !s.is_empty()),
            "watcher" => self.watcher_status = Some(text.to_string()).filter(|s| !s.is_empty()),
            "join" => self.join_ready = text == "present",
            "log" => self.log_tail = text.to_string(),
            _ => {}
        }
    }
}

/// Lifecycle of a detached install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BootstrapState {
    /// Nothing launched yet.
    Preparing,
    /// The install process is alive.
    Installing { pid: u32 },
    /// The install printed its completion sentinel.
    Installed { join_ready: bool },
    /// The install or its watcher gave up.
    Failed { reason: String },
}

impl BootstrapState {
    /// Infer the state from a marker snapshot.
    #[must_use]
    pub fn from_markers(markers: &MarkerSnapshot) -> Self {
        if markers.sentinel_seen {
            return Self::Installed {
                join_ready: markers.join_ready,
            };
        }
        if let Some(failure) = &markers.failure {
            return Self::Failed {
                reason: failure.clone(),
            };
        }
        match markers.watcher_status.as_deref() {
            Some("timeout") => {
                return Self::Failed {
                    reason: "watcher timed out waiting for the install to finish".to_string(),
                }
            }
            Some("failed") => {
                return Self::Failed {
                    reason: "watcher saw the install fail".to_string(),
                }
            }
            _ => {}
        }
        match markers.pid {
            None => Self::Preparing,
            Some(pid) if markers.running => Self::Installing { pid },
            Some(pid) => Self::Failed {
                reason: format!("install process {pid} exited without completing"),
            },
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Installed { .. } | Self::Failed { .. })
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing"),
            Self::Installing { pid } => write!(f, "installing (pid {pid})"),
            Self::Installed { join_ready: true } => write!(f, "installed"),
            Self::Installed { join_ready: false } => write!(f, "installed (join credential pending)"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}
