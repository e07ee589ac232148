//! Persisted node records.
//!
//! [`NodeStore`] is the boundary to whatever keeps node records; the
//! orchestration core only reads a node's hops and join credential and
//! writes back freshly extracted credentials. [`YamlNodeStore`] backs it
//! with a local YAML file for the CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::bootstrap::ExtractedCredential;
use crate::hop::HopEndpoint;

/// Default inventory file path.
const DEFAULT_INVENTORY_PATH: &str = "~/.kubehop/inventory.yaml";

/// Errors raised by node stores.
#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("failed to read inventory {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write inventory {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse inventory: {0}")]
    Parse(#[from] serde_yaml::Error),
}

// ============================================================================
// Records
// ============================================================================

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
    Proxy,
}

/// A stored node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node name, unique within the inventory.
    pub name: String,
    pub role: NodeRole,
    /// Hop chain to the node, bastion first. Credentials are not stored.
    #[serde(default)]
    pub hops: Vec<HopEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,
    /// When the join credential was last written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NodeRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, role: NodeRole, hops: Vec<HopEndpoint>) -> Self {
        Self {
            name: name.into(),
            role,
            hops,
            join_command: None,
            certificate_key: None,
            updated_at: None,
        }
    }

    /// Stored join credential, if any.
    #[must_use]
    pub fn credential(&self) -> Option<ExtractedCredential> {
        self.join_command.as_ref().map(|join| ExtractedCredential {
            join_command: join.clone(),
            certificate_key: self.certificate_key.clone(),
        })
    }

    /// Replace the stored credential and stamp it with `now`.
    pub fn set_credential(&mut self, credential: &ExtractedCredential, now: DateTime<Utc>) {
        self.join_command = Some(credential.join_command.clone());
        self.certificate_key.clone_from(&credential.certificate_key);
        self.updated_at = Some(now);
    }
}

/// Whether a credential written at `updated_at` is still usable at `now`.
#[must_use]
pub fn credentials_fresh(updated_at: Option<DateTime<Utc>>, now: DateTime<Utc>, validity: Duration) -> bool {
    let Some(updated_at) = updated_at else {
        return false;
    };
    let Ok(validity) = chrono::Duration::from_std(validity) else {
        return true;
    };
    updated_at <= now && now - updated_at < validity
}

/// Read/update access to node records.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<NodeRecord>, InventoryError>;

    /// Insert or replace the record with the same name.
    async fn put(&self, record: NodeRecord) -> Result<(), InventoryError>;
}

// ============================================================================
// YAML store
// ============================================================================

/// Inventory file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// [`NodeStore`] over a YAML file.
pub struct YamlNodeStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl YamlNodeStore {
    /// Open the store at `path`, or at `~/.kubehop/inventory.yaml`.
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        let path = path.unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
            PathBuf::from(DEFAULT_INVENTORY_PATH.replace('~', &home))
        });
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the inventory; a missing file is an empty inventory.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub async fn load(&self) -> Result<Inventory, InventoryError> {
        if !self.path.exists() {
            return Ok(Inventory::default());
        }

        let contents = fs::read_to_string(&self.path)
            .await
            .map_err(|source| InventoryError::Read {
                path: self.path.clone(),
                source,
            })?;
        if contents.trim().is_empty() {
            return Ok(Inventory::default());
        }
        Ok(serde_yaml::from_str(&contents)?)
    }

    async fn save(&self, inventory: &Inventory) -> Result<(), InventoryError> {
        let write_err = |source| InventoryError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let mut inventory = inventory.clone();
        inventory.updated_at = Some(Utc::now());
        let contents = serde_yaml::to_string(&inventory)?;
        fs::write(&self.path, contents).await.map_err(write_err)
    }
}

#[async_trait]
impl NodeStore for YamlNodeStore {
    async fn get(&self, name: &str) -> Result<Option<NodeRecord>, InventoryError> {
        let inventory = self.load().await?;
        Ok(inventory.nodes.into_iter().find(|n| n.name == name))
    }

    async fn put(&self, record: NodeRecord) -> Result<(), InventoryError> {
        let _guard = self.write_lock.lock().await;
        let mut inventory = self.load().await?;

        match inventory.nodes.iter_mut().find(|n| n.name == record.name) {
            Some(existing) => *existing = record,
            None => inventory.nodes.push(record),
        }

        self.save(&inventory).await?;
        debug!(path = %self.path.display(), nodes = inventory.nodes.len(), "inventory saved");
        Ok(())
    }
}
