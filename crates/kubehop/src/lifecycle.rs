//! Node teardown sequences.
//!
//! Each sequence is a fixed list of orchestrator calls. Steps are
//! best-effort: a failed step is logged and recorded in the
//! [`TeardownReport`] and the next step still runs, so a half-broken node can
//! always be wiped.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::actions::cluster::{
    CLEANUP_ETCD_DATA, CORDON_NODE, DELETE_NODE, DRAIN_NODE, REMOVE_ETCD_MEMBER, RESET_NODE,
};
use crate::hop::Target;
use crate::orchestrator::Orchestrator;
use crate::params::Params;
use crate::proxy::{BackendOp, ProxyHost, ProxyPatcher};

/// Where to run a step and with which base parameters (usually `password`).
#[derive(Debug, Clone, Default)]
pub struct NodeAccess {
    pub target: Target,
    pub params: Params,
}

impl NodeAccess {
    #[must_use]
    pub fn new(target: Target, params: Params) -> Self {
        Self { target, params }
    }
}

/// Proxy whose backend entry for the node is removed first.
pub struct ProxyBackend<'a> {
    pub host: &'a dyn ProxyHost,
    pub patcher: &'a ProxyPatcher,
}

/// Outcome of one teardown step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u128(elapsed.as_millis())
}

/// Steps of one teardown in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub node: String,
    pub steps: Vec<StepOutcome>,
}

impl TeardownReport {
    fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.success)
    }

    #[must_use]
    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| !s.success)
            .map(|s| s.step.as_str())
            .collect()
    }

    fn record(&mut self, step: &str, started: Instant, result: Result<(), String>) {
        let elapsed = started.elapsed();
        match &result {
            Ok(()) => info!(node = %self.node, step, elapsed_ms = elapsed.as_millis(), "teardown step done"),
            Err(error) => warn!(node = %self.node, step, error = %error, "teardown step failed, continuing"),
        }
        self.steps.push(StepOutcome {
            step: step.to_string(),
            success: result.is_ok(),
            error: result.err(),
            elapsed,
        });
    }
}

/// Runs teardown sequences through an [`Orchestrator`].
pub struct LifecycleController {
    orchestrator: Orchestrator,
}

impl LifecycleController {
    #[must_use]
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    async fn step(&self, report: &mut TeardownReport, step: &str, action: &str, access: &NodeAccess) {
        let params = access.params.clone().with("node_name", report.node.as_str());
        let started = Instant::now();
        let result = self
            .orchestrator
            .execute(action, &params, Some(&access.target))
            .await
            .require_success()
            .map(|_| ())
            .map_err(|e| e.to_string());
        report.record(step, started, result);
    }

    async fn evict(&self, report: &mut TeardownReport, control: &NodeAccess) {
        self.step(report, "cordon", CORDON_NODE, control).await;
        self.step(report, "drain", DRAIN_NODE, control).await;
        self.step(report, "delete node", DELETE_NODE, control).await;
    }

    /// Evict `node_name` via `control`, then wipe Kubernetes from `node`.
    pub async fn remove_worker(&self, node_name: &str, control: &NodeAccess, node: &NodeAccess) -> TeardownReport {
        info!(node = %node_name, "removing worker");
        let mut report = TeardownReport::new(node_name);

        self.evict(&mut report, control).await;
        self.step(&mut report, "reset node", RESET_NODE, node).await;

        report
    }

    /// Remove a control-plane node.
    ///
    /// The proxy backend entry goes first so no API traffic reaches the node
    /// while it is drained. Without `main_master` the cluster side is skipped
    /// and only the node itself is wiped.
    pub async fn remove_master(
        &self,
        node_name: &str,
        node: &NodeAccess,
        main_master: Option<&NodeAccess>,
        proxy: Option<ProxyBackend<'_>>,
    ) -> TeardownReport {
        info!(node = %node_name, "removing control-plane node");
        let mut report = TeardownReport::new(node_name);

        if let Some(proxy) = proxy {
            let started = Instant::now();
            let op = BackendOp::Remove {
                name: node_name.to_string(),
            };
            let result = proxy
                .patcher
                .apply(proxy.host, &op)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string());
            report.record("remove proxy backend", started, result);
        }

        if let Some(main) = main_master {
            self.evict(&mut report, main).await;
            self.step(&mut report, "remove etcd member", REMOVE_ETCD_MEMBER, main).await;
        }

        self.step(&mut report, "reset node", RESET_NODE, node).await;
        self.step(&mut report, "clean etcd data", CLEANUP_ETCD_DATA, node).await;

        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::config::Settings;
    use crate::hop::{ChainError, CommandResult, HopDescriptor, HopExecutor};
    use crate::registry::CommandRegistry;

    /// Records the host of every call; commands containing `drain` exit 1.
    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HopExecutor for RecordingExecutor {
        async fn execute(
            &self,
            hops: &[HopDescriptor],
            commands: &[String],
            _timeout: Duration,
        ) -> Result<Vec<CommandResult>, ChainError> {
            let host = hops.last().map(|h| h.host.clone()).unwrap_or_default();
            self.calls.lock().unwrap().push(host);
            Ok(commands
                .iter()
                .map(|command| CommandResult {
                    command: command.clone(),
                    stdout: String::new(),
                    stderr: if command.contains(" drain ") { "error: cannot evict pod".into() } else { String::new() },
                    exit_status: i32::from(command.contains(" drain ")),
                    elapsed: Duration::ZERO,
                    error: None,
                })
                .collect())
        }
    }

    fn controller() -> (LifecycleController, Arc<RecordingExecutor>) {
        let mut registry = CommandRegistry::new();
        crate::actions::register_all(&mut registry, &Settings::default()).unwrap();
        let executor = Arc::new(RecordingExecutor::default());
        let orchestrator = Orchestrator::new(Arc::new(registry), executor.clone(), Duration::from_secs(5));
        (LifecycleController::new(orchestrator), executor)
    }

    fn access(host: &str) -> NodeAccess {
        NodeAccess::new(
            Target::direct(HopDescriptor::with_password(host, "root", "pw")),
            Params::new().with("password", "pw"),
        )
    }

    #[tokio::test]
    async fn test_remove_worker_continues_after_failed_drain() {
        let (controller, executor) = controller();
        let report = controller
            .remove_worker("w1", &access("10.0.0.2"), &access("10.0.0.7"))
            .await;

        let steps: Vec<&str> = report.steps.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(steps, ["cordon", "drain", "delete node", "reset node"]);
        assert_eq!(report.failed_steps(), ["drain"]);
        assert!(!report.all_succeeded());
        assert!(report.steps[1].error.as_deref().unwrap().contains("cannot evict"));

        let calls = executor.calls.lock().unwrap();
        assert_eq!(*calls, ["10.0.0.2", "10.0.0.2", "10.0.0.2", "10.0.0.7"]);
    }

    #[tokio::test]
    async fn test_remove_master_without_main_master_only_wipes_node() {
        let (controller, executor) = controller();
        let report = controller.remove_master("m2", &access("10.0.0.3"), None, None).await;

        let steps: Vec<&str> = report.steps.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(steps, ["reset node", "clean etcd data"]);
        assert!(report.all_succeeded());
        assert_eq!(executor.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_master_full_sequence() {
        let (controller, executor) = controller();
        let report = controller
            .remove_master("m2", &access("10.0.0.3"), Some(&access("10.0.0.2")), None)
            .await;

        let steps: Vec<&str> = report.steps.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(
            steps,
            ["cordon", "drain", "delete node", "remove etcd member", "reset node", "clean etcd data"]
        );
        assert_eq!(executor.calls.lock().unwrap().len(), 6);
    }

    #[test]
    fn test_report_serializes_elapsed_millis() {
        let mut report = TeardownReport::new("w1");
        report.record("reset node", Instant::now(), Err("boom".to_string()));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["steps"][0]["success"], false);
        assert!(json["steps"][0]["elapsed_ms"].is_number());
    }
}
