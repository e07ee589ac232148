//! Runtime settings.
//!
//! Defaults come from `KUBEHOP_*` environment variables; [`Settings::load`]
//! overlays an optional YAML file on top of them.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bootstrap::RemoteLayout;
use crate::params::validate_remote_path;

/// Settings shared by the executor, the registrars and the workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Per-call timeout for hop chain executions (seconds).
    pub exec_timeout_secs: u64,
    /// SSH keepalive interval (seconds).
    pub keepalive_secs: u64,
    /// SSH inactivity timeout (seconds).
    pub inactivity_secs: u64,
    /// Directory on the remote host holding scripts, logs and markers.
    pub remote_dir: String,
    /// Watcher poll interval (seconds).
    pub watch_interval_secs: u64,
    /// Maximum time the watcher waits for the install sentinel (seconds).
    pub watch_max_wait_secs: u64,
    /// Kubernetes minor version (`1.31`); empty to discover the stable one.
    pub k8s_version: String,
    /// Pod network CIDR passed to `kubeadm init`.
    pub pod_cidr: String,
    /// API server port behind the load balancer.
    pub lb_port: u16,
    /// Path of the `HAProxy` configuration on the proxy host.
    pub haproxy_config: String,
    /// Backend section holding the API server entries.
    pub haproxy_backend: String,
    /// How long a stored join credential is reused (seconds).
    pub credential_validity_secs: u64,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            exec_timeout_secs: env_or("KUBEHOP_EXEC_TIMEOUT_SECS", 120),
            keepalive_secs: env_or("KUBEHOP_KEEPALIVE_SECS", 15),
            inactivity_secs: env_or("KUBEHOP_INACTIVITY_SECS", 60),
            remote_dir: env::var("KUBEHOP_REMOTE_DIR")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "/tmp/kubehop".to_string()),
            watch_interval_secs: env_or("KUBEHOP_WATCH_INTERVAL_SECS", 10),
            watch_max_wait_secs: env_or("KUBEHOP_WATCH_MAX_WAIT_SECS", 1800),
            k8s_version: env::var("KUBEHOP_K8S_VERSION").unwrap_or_default(),
            pod_cidr: env::var("KUBEHOP_POD_CIDR").unwrap_or_else(|_| "10.244.0.0/16".to_string()),
            lb_port: env_or("KUBEHOP_LB_PORT", 6443),
            haproxy_config: env::var("KUBEHOP_HAPROXY_CONFIG")
                .unwrap_or_else(|_| "/etc/haproxy/haproxy.cfg".to_string()),
            haproxy_backend: env::var("KUBEHOP_HAPROXY_BACKEND")
                .unwrap_or_else(|_| "kube-apiserver".to_string()),
            credential_validity_secs: env_or("KUBEHOP_CREDENTIAL_VALIDITY_SECS", 7200),
        }
    }
}

impl Settings {
    /// Load settings, overlaying `path` (YAML) on the environment defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// result fails [`Settings::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            None => Self::default(),
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings file {}", path.display()))?;
                if content.trim().is_empty() {
                    Self::default()
                } else {
                    serde_yaml::from_str(&content)
                        .with_context(|| format!("failed to parse settings file {}", path.display()))?
                }
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check the values that end up inside remote scripts and commands.
    ///
    /// # Errors
    ///
    /// Fails if a remote path is not an absolute path of safe characters.
    pub fn validate(&self) -> Result<()> {
        validate_remote_path("remote_dir", self.remote_dir.trim_end_matches('/'))?;
        validate_remote_path("haproxy_config", &self.haproxy_config)?;
        Ok(())
    }

    #[must_use]
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    #[must_use]
    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs)
    }

    #[must_use]
    pub fn credential_validity(&self) -> Duration {
        Duration::from_secs(self.credential_validity_secs)
    }

    /// Remote file layout rooted at [`Settings::remote_dir`].
    #[must_use]
    pub fn layout(&self) -> RemoteLayout {
        RemoteLayout::new(&self.remote_dir)
    }
}
