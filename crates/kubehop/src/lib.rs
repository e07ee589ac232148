//! Multi-hop SSH orchestration for Kubernetes and Docker nodes.
//!
//! This crate pushes shell command lists to remote hosts through chains of
//! SSH jump hosts, and builds cluster lifecycle procedures on top of that:
//! detached `kubeadm` installs, join-credential recovery from installer logs,
//! `HAProxy` backend patching and node teardown.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kubehop::{actions, CommandRegistry, Orchestrator, Params, Settings, Target};
//! use kubehop::hop::{ChainExecutor, RusshDialer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::default();
//!     let mut registry = CommandRegistry::new();
//!     actions::register_all(&mut registry, &settings)?;
//!
//!     let executor = ChainExecutor::new(RusshDialer::new(&settings));
//!     let orchestrator = Orchestrator::new(Arc::new(registry), Arc::new(executor), settings.exec_timeout());
//!
//!     let target: Target = serde_json::from_str(r#"{"hops":[{"host":"10.0.0.2","username":"root","password":"secret"}]}"#)?;
//!     let outcome = orchestrator.execute("getNodes", &Params::new(), Some(&target)).await;
//!     for result in outcome.into_result()? {
//!         println!("{}", result.stdout);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actions;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod hop;
pub mod inventory;
pub mod lifecycle;
pub mod orchestrator;
pub mod params;
pub mod proxy;
pub mod registry;
pub mod shell;

pub use config::Settings;
pub use error::{classify_failure, FailureKind, OrchestratorError};
pub use hop::{CommandResult, Credential, HopDescriptor, HopExecutor, Target};
pub use orchestrator::{ExecutionOutcome, Orchestrator};
pub use params::Params;
pub use registry::{CommandRegistry, CommandTemplate};
