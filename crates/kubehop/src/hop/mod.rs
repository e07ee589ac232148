//! Hop chain execution.
//!
//! A hop chain is an ordered list of SSH endpoints: the first is dialed
//! directly, every following one is reached through a tunnel opened on the
//! previous hop, and commands run on the last one.

mod chain;
mod ssh;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};

pub use chain::{ChainError, ChainExecutor, HopDialer, HopSession, RawOutput};
pub use ssh::RusshDialer;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Credential used to authenticate on one hop.
///
/// Credentials are supplied per call and never serialized.
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum Credential {
    /// Password authentication.
    Password {
        /// The password.
        password: String,
    },
    /// Inline OpenSSH/PEM private key.
    PrivateKey {
        /// Key material.
        private_key: String,
        /// Optional key passphrase.
        #[serde(default)]
        passphrase: Option<String>,
    },
    /// Private key read from a local file.
    KeyFile {
        /// Path to the key file.
        key_path: PathBuf,
        /// Optional key passphrase.
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl Credential {
    /// Short name of the authentication method, safe to log.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::PrivateKey { .. } => "private_key",
            Self::KeyFile { .. } => "key_file",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({}, <redacted>)", self.method())
    }
}

/// Address part of a hop, without the credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopEndpoint {
    /// Host name or IP address.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user.
    pub username: String,
}

impl HopEndpoint {
    /// Attach a credential to build a dialable hop.
    #[must_use]
    pub fn with_credential(&self, credential: Credential) -> HopDescriptor {
        HopDescriptor {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            credential,
        }
    }
}

impl FromStr for HopEndpoint {
    type Err = anyhow::Error;

    /// Parse `user@host`, `user@host:port` or `user@[v6addr]:port`.
    fn from_str(spec: &str) -> anyhow::Result<Self> {
        let (username, rest) = spec
            .split_once('@')
            .filter(|(user, host)| !user.is_empty() && !host.is_empty())
            .ok_or_else(|| anyhow!("hop '{spec}' must look like user@host[:port]"))?;

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| anyhow!("hop '{spec}' has an unterminated IPv6 address"))?;
            (host, tail.strip_prefix(':'))
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                _ => (rest, None),
            }
        };

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| anyhow!("hop '{spec}' has an invalid port"))?,
            None => DEFAULT_SSH_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
        })
    }
}

impl fmt::Display for HopEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// One SSH endpoint in a hop chain.
#[derive(Debug, Clone, Deserialize)]
pub struct HopDescriptor {
    /// Host name or IP address.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Authentication material.
    #[serde(flatten)]
    pub credential: Credential,
}

impl HopDescriptor {
    /// Create a password-authenticated hop on the default port.
    #[must_use]
    pub fn with_password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            credential: Credential::Password {
                password: password.into(),
            },
        }
    }

    /// Override the SSH port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The credential-free endpoint of this hop.
    #[must_use]
    pub fn endpoint(&self) -> HopEndpoint {
        HopEndpoint {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
        }
    }
}

impl fmt::Display for HopDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// The hop chain an action is executed against.
///
/// The first hop is the bastion, the last hop is the host commands run on.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Target {
    /// Ordered hops, bastion first.
    #[serde(default)]
    pub hops: Vec<HopDescriptor>,
}

impl Target {
    /// Create a target from an ordered hop list.
    #[must_use]
    pub fn new(hops: Vec<HopDescriptor>) -> Self {
        Self { hops }
    }

    /// Target with a single hop.
    #[must_use]
    pub fn direct(hop: HopDescriptor) -> Self {
        Self { hops: vec![hop] }
    }

    /// The hop commands are executed on.
    #[must_use]
    pub fn final_hop(&self) -> Option<&HopDescriptor> {
        self.hops.last()
    }

    /// Whether the chain has no hops.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

/// Result of one submitted command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    /// The command as submitted. Serialized with the sudo password redacted.
    #[serde(serialize_with = "serialize_redacted")]
    pub command: String,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Remote exit status (`-1` if none was reported).
    pub exit_status: i32,
    /// Wall-clock time spent on this command.
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    /// Transport error, if the command could not be run to completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    /// Whether the command ran and exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_status == 0
    }
}

fn serialize_redacted<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&crate::shell::redact(value))
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// Executes a command list on the last hop of a chain.
#[async_trait]
pub trait HopExecutor: Send + Sync {
    /// Open the chain, run `commands` in order on the final hop and return one
    /// result per command.
    ///
    /// `timeout` bounds the whole call, including chain setup.
    async fn execute(
        &self,
        hops: &[HopDescriptor],
        commands: &[String],
        timeout: Duration,
    ) -> Result<Vec<CommandResult>, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hop_endpoint() {
        let hop: HopEndpoint = "root@10.0.0.2".parse().unwrap();
        assert_eq!((hop.username.as_str(), hop.host.as_str(), hop.port), ("root", "10.0.0.2", 22));

        let hop: HopEndpoint = "ops@bastion.example.com:2222".parse().unwrap();
        assert_eq!((hop.host.as_str(), hop.port), ("bastion.example.com", 2222));

        let hop: HopEndpoint = "ops@[fd00::1]:2200".parse().unwrap();
        assert_eq!((hop.host.as_str(), hop.port), ("fd00::1", 2200));

        let hop: HopEndpoint = "ops@fd00::1".parse().unwrap();
        assert_eq!((hop.host.as_str(), hop.port), ("fd00::1", 22));

        for bad in ["10.0.0.2", "@host", "root@", "root@host:0", "root@host:ssh", "root@[fd00::1"] {
            assert!(bad.parse::<HopEndpoint>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_target_deserializes_all_credential_kinds() {
        let target: Target = serde_json::from_str(
            r#"{"hops":[
                {"host":"bastion","username":"jump","password":"pw"},
                {"host":"10.0.0.2","port":2222,"username":"root","private_key":"-----BEGIN"},
                {"host":"10.0.0.3","username":"ops","key_path":"/keys/id_ed25519","passphrase":"x"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(target.hops.len(), 3);
        assert_eq!(target.hops[0].port, DEFAULT_SSH_PORT);
        assert_eq!(target.hops[0].credential.method(), "password");
        assert_eq!(target.hops[1].port, 2222);
        assert_eq!(target.hops[1].credential.method(), "private_key");
        assert_eq!(target.hops[2].credential.method(), "key_file");
        assert_eq!(target.final_hop().unwrap().host, "10.0.0.3");
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let hop = HopDescriptor::with_password("h", "u", "hunter2");
        let rendered = format!("{hop:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_endpoint_round_trip_drops_credential() {
        let hop = HopDescriptor::with_password("10.1.1.1", "root", "pw").port(2200);
        let endpoint = hop.endpoint();
        assert_eq!(endpoint.to_string(), "root@10.1.1.1:2200");

        let yaml = serde_yaml::to_string(&endpoint).unwrap();
        assert!(!yaml.contains("pw"));
    }

    #[test]
    fn test_command_result_serializes_elapsed_millis() {
        let result = CommandResult {
            command: "true".into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_status: 0,
            elapsed: Duration::from_millis(1500),
            error: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["elapsed_ms"], 1500);
        assert!(json.get("error").is_none());
        assert!(result.success());
    }

    #[test]
    fn test_command_result_never_serializes_sudo_password() {
        let result = CommandResult {
            command: crate::shell::sudo(Some("hunter2"), "kubectl get nodes"),
            stdout: String::new(),
            stderr: String::new(),
            exit_status: 0,
            elapsed: Duration::ZERO,
            error: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("hunter2"), "{json}");
        assert!(json.contains("'***' | sudo -S"));
        assert!(result.command.contains("hunter2"));
    }
}
