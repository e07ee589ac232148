//! Action parameters and the validators shared by the registrars.

use std::net::IpAddr;
use std::sync::LazyLock;

use anyhow::{anyhow, bail, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static SERVER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9.-]{0,251}[a-z0-9])?$").expect("valid regex"));

static JOIN_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^kubeadm join [A-Za-z0-9.:\[\]\- ]+ --token [a-z0-9]{6}\.[a-z0-9]{16} --discovery-token-ca-cert-hash sha256:[a-f0-9]{64}$")
        .expect("valid regex")
});

static CERTIFICATE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{64}$").expect("valid regex"));

static CONTAINER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("valid regex"));

static K8S_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+\.[0-9]+$").expect("valid regex"));

static CIDR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{1,3}(\.[0-9]{1,3}){3}/[0-9]{1,2}$|^[0-9a-fA-F:]+/[0-9]{1,3}$").expect("valid regex")
});

static REMOTE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[A-Za-z0-9._/-]+$").expect("valid regex"));

static IMAGE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/:@-]{0,254}$").expect("valid regex")
});

/// Parameters of one action call: a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(Map<String, Value>);

impl Params {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// A non-empty string value.
    ///
    /// # Errors
    ///
    /// Fails if the key is missing, not a string or empty.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
            Some(Value::String(_)) => bail!("parameter '{key}' must not be empty"),
            Some(_) => bail!("parameter '{key}' must be a string"),
            None => bail!("missing required parameter '{key}'"),
        }
    }

    /// A string value, or `None` when missing, null or empty.
    #[must_use]
    pub fn optional_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// A port given as a number or numeric string, `default` when missing.
    ///
    /// # Errors
    ///
    /// Fails if the value is present but not a port in `1..=65535`.
    pub fn port(&self, key: &str, default: u16) -> Result<u16> {
        let parsed = match self.0.get(key) {
            None | Some(Value::Null) => return Ok(default),
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(default),
            Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
            Some(_) => None,
        };
        match parsed {
            Some(port) if port > 0 => Ok(port),
            _ => bail!("parameter '{key}' must be a port between 1 and 65535"),
        }
    }

    /// A boolean flag; accepts `true`/`false` and the strings `"true"`/`"1"`.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true" || s == "1",
            Some(Value::Number(n)) => n.as_u64() == Some(1),
            _ => false,
        }
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Params {
    type Error = anyhow::Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(anyhow!("parameters must be a JSON object, got {other}")),
        }
    }
}

/// # Errors
///
/// Fails unless `value` is an IPv4 or IPv6 address.
pub fn validate_ip(key: &str, value: &str) -> Result<()> {
    value
        .parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| anyhow!("parameter '{key}' must be an IP address, got '{value}'"))
}

/// # Errors
///
/// Fails unless `value` is a lowercase DNS-style node name.
pub fn validate_server_name(value: &str) -> Result<()> {
    if SERVER_NAME.is_match(value) {
        Ok(())
    } else {
        bail!("invalid server name '{value}'")
    }
}

/// # Errors
///
/// Fails unless `value` is a single-line `kubeadm join` command carrying a
/// token and a CA cert hash.
pub fn validate_join_command(value: &str) -> Result<()> {
    if JOIN_COMMAND.is_match(value.trim()) {
        Ok(())
    } else {
        bail!("join command is not a complete 'kubeadm join' command")
    }
}

/// # Errors
///
/// Fails unless `value` is 64 lowercase hex characters.
pub fn validate_certificate_key(value: &str) -> Result<()> {
    if CERTIFICATE_KEY.is_match(value.trim()) {
        Ok(())
    } else {
        bail!("certificate key must be 64 hex characters")
    }
}

/// # Errors
///
/// Fails unless `value` looks like a container id or name.
pub fn validate_container(value: &str) -> Result<()> {
    if CONTAINER_ID.is_match(value) {
        Ok(())
    } else {
        bail!("invalid container id or name '{value}'")
    }
}

/// # Errors
///
/// Fails unless `value` looks like an image reference.
pub fn validate_image(value: &str) -> Result<()> {
    if IMAGE_REF.is_match(value) {
        Ok(())
    } else {
        bail!("invalid image reference '{value}'")
    }
}

/// # Errors
///
/// Fails unless `value` is a Kubernetes minor version such as `1.31`.
pub fn validate_k8s_version(value: &str) -> Result<()> {
    if K8S_VERSION.is_match(value) {
        Ok(())
    } else {
        bail!("kubernetes version must look like '1.31', got '{value}'")
    }
}

/// # Errors
///
/// Fails unless `value` is an IPv4 or IPv6 CIDR.
pub fn validate_cidr(key: &str, value: &str) -> Result<()> {
    if CIDR.is_match(value) {
        Ok(())
    } else {
        bail!("parameter '{key}' must be a CIDR, got '{value}'")
    }
}

/// # Errors
///
/// Fails unless `value` is an absolute path made of safe characters.
pub fn validate_remote_path(key: &str, value: &str) -> Result<()> {
    if REMOTE_PATH.is_match(value) && !value.contains("..") {
        Ok(())
    } else {
        bail!("parameter '{key}' must be an absolute path, got '{value}'")
    }
}
