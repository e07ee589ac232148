//! End-to-end tests for backend patching over the proxy actions.
//!
//! `RemoteProxyHost` drives the real command builders; the executor below
//! interprets those commands against an in-memory file so the whole
//! read, backup, write, check and restart cycle is observable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kubehop::hop::ChainError;
use kubehop::proxy::{BackendOp, PatchError, ProxyPatcher, RemoteProxyHost, ServerChange, ServerEntry};
use kubehop::{actions, CommandRegistry, CommandResult, HopDescriptor, HopExecutor, Orchestrator, Params, Settings, Target};

const CONFIG_PATH: &str = "/opt/lb/haproxy.cfg";

const CONFIG: &str = "global\n\
    \tdaemon\n\
    \n\
    frontend api\n\
    \tbind *:6443\n\
    \tdefault_backend kube-apiserver\n\
    \n\
    backend kube-apiserver\n\
    \tbalance roundrobin\n\
    \tserver m1 10.0.0.2:6443 check\n";

// =============================================================================
// Simulated proxy host
// =============================================================================

#[derive(Default)]
struct ProxyState {
    file: String,
    backups: HashMap<String, String>,
    restarts: usize,
    kinds: Vec<&'static str>,
}

/// Interprets proxy action commands. Files containing `bogus` fail the
/// syntax check.
struct SimulatedProxy {
    state: Mutex<ProxyState>,
    restart_fails: bool,
}

impl SimulatedProxy {
    fn new(content: &str) -> Self {
        Self {
            state: Mutex::new(ProxyState {
                file: content.to_string(),
                ..ProxyState::default()
            }),
            restart_fails: false,
        }
    }

    fn file(&self) -> String {
        self.state.lock().unwrap().file.clone()
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().kinds.clone()
    }

    /// Text between the first `start` and the following `end`.
    fn between<'a>(command: &'a str, start: &str, end: &str) -> &'a str {
        let from = command.find(start).map(|i| i + start.len()).unwrap();
        let len = command[from..].find(end).unwrap();
        &command[from..from + len]
    }

    fn run(&self, command: &str) -> (String, String, i32) {
        let mut state = self.state.lock().unwrap();
        if !command.contains("systemctl") {
            assert!(command.contains(CONFIG_PATH), "command ignores config_path: {command}");
        }

        if command.contains("cp -p") {
            state.kinds.push("backup");
            let path = format!("{CONFIG_PATH}.bak.2024010100000{}", state.backups.len());
            let content = state.file.clone();
            state.backups.insert(path.clone(), content);
            (format!("{path}\n"), String::new(), 0)
        } else if command.contains("base64 -d") {
            state.kinds.push("write");
            let encoded = Self::between(command, "<<'KUBEHOP_EOF'\n", "\nKUBEHOP_EOF");
            let decoded = STANDARD.decode(encoded).unwrap();
            state.file = String::from_utf8(decoded).unwrap();
            (String::new(), String::new(), 0)
        } else if command.contains("haproxy -c -f") {
            state.kinds.push("check");
            if state.file.contains("bogus") {
                (String::new(), "[ALERT] parsing [haproxy.cfg:11] : unknown keyword 'bogus'".to_string(), 1)
            } else {
                ("Configuration file is valid\n".to_string(), String::new(), 0)
            }
        } else if command.contains("systemctl restart haproxy") {
            state.kinds.push("restart");
            if self.restart_fails {
                return (String::new(), "Job for haproxy.service failed".to_string(), 1);
            }
            state.restarts += 1;
            (String::new(), String::new(), 0)
        } else if command.contains(".bak.") {
            state.kinds.push("restore");
            let backup = Self::between(command, "cat '\\''", "'\\'' >");
            match state.backups.get(backup).cloned() {
                Some(content) => {
                    state.file = content;
                    (String::new(), String::new(), 0)
                }
                None => (String::new(), format!("cat: {backup}: No such file or directory"), 1),
            }
        } else {
            state.kinds.push("read");
            (state.file.clone(), String::new(), 0)
        }
    }
}

#[async_trait]
impl HopExecutor for SimulatedProxy {
    async fn execute(
        &self,
        _hops: &[HopDescriptor],
        commands: &[String],
        _timeout: Duration,
    ) -> Result<Vec<CommandResult>, ChainError> {
        Ok(commands
            .iter()
            .map(|command| {
                let (stdout, stderr, exit_status) = self.run(command);
                CommandResult {
                    command: command.clone(),
                    stdout,
                    stderr,
                    exit_status,
                    elapsed: Duration::ZERO,
                    error: None,
                }
            })
            .collect())
    }
}

fn remote_host(proxy: &Arc<SimulatedProxy>) -> RemoteProxyHost {
    let mut registry = CommandRegistry::new();
    actions::register_all(&mut registry, &Settings::default()).unwrap();
    let orchestrator = Orchestrator::new(Arc::new(registry), proxy.clone(), Duration::from_secs(30));
    RemoteProxyHost::new(
        orchestrator,
        Target::direct(HopDescriptor::with_password("10.0.0.10", "root", "pw")),
        Params::new().with("config_path", CONFIG_PATH),
    )
}

fn add(name: &str, host: &str) -> BackendOp {
    BackendOp::Add(ServerEntry::new(name, host, 6443))
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_add_server_full_cycle() {
    let proxy = Arc::new(SimulatedProxy::new(CONFIG));
    let host = remote_host(&proxy);
    let patcher = ProxyPatcher::new("kube-apiserver");

    let report = patcher.apply(&host, &add("m2", "10.0.0.3")).await.unwrap();
    assert_eq!(report.change, ServerChange::Added);
    assert!(report.restarted);

    let backup = report.backup.unwrap();
    assert!(backup.starts_with("/opt/lb/haproxy.cfg.bak."));
    assert_eq!(proxy.state.lock().unwrap().backups[&backup], CONFIG);

    assert_eq!(proxy.file(), format!("{CONFIG}\tserver m2 10.0.0.3:6443 check\n"));
    assert_eq!(proxy.kinds(), ["read", "backup", "write", "check", "restart"]);
}

#[tokio::test]
async fn test_repeated_add_only_reads() {
    let proxy = Arc::new(SimulatedProxy::new(CONFIG));
    let host = remote_host(&proxy);
    let patcher = ProxyPatcher::new("kube-apiserver");

    patcher.apply(&host, &add("m2", "10.0.0.3")).await.unwrap();
    let patched = proxy.file();

    let report = patcher.apply(&host, &add("m2", "10.0.0.3")).await.unwrap();
    assert_eq!(report.change, ServerChange::Unchanged);
    assert!(report.backup.is_none());
    assert_eq!(proxy.file(), patched);
    assert_eq!(proxy.kinds().last(), Some(&"read"));
    assert_eq!(proxy.state.lock().unwrap().restarts, 1);
}

#[tokio::test]
async fn test_remove_server_round_trips_other_bytes() {
    let proxy = Arc::new(SimulatedProxy::new(CONFIG));
    let host = remote_host(&proxy);
    let patcher = ProxyPatcher::new("kube-apiserver");

    let report = patcher
        .apply(&host, &BackendOp::Remove { name: "m1".to_string() })
        .await
        .unwrap();
    assert_eq!(report.change, ServerChange::Removed);
    assert_eq!(proxy.file(), CONFIG.replace("\tserver m1 10.0.0.2:6443 check\n", ""));
}

#[tokio::test]
async fn test_rejected_config_is_restored() {
    let original = format!("{CONFIG}\n# bogus\n");
    let proxy = Arc::new(SimulatedProxy::new(&original));
    let host = remote_host(&proxy);

    let err = ProxyPatcher::new("kube-apiserver")
        .apply(&host, &add("m2", "10.0.0.3"))
        .await
        .unwrap_err();

    match err {
        PatchError::SyntaxCheckFailed { backup, output } => {
            assert!(backup.starts_with(CONFIG_PATH));
            assert!(output.contains("unknown keyword"), "{output}");
        }
        other => panic!("expected SyntaxCheckFailed, got {other:?}"),
    }
    assert_eq!(proxy.file(), original);
    assert_eq!(proxy.kinds(), ["read", "backup", "write", "check", "restore"]);
}

#[tokio::test]
async fn test_restart_failure_keeps_patched_file() {
    let proxy = Arc::new(SimulatedProxy {
        restart_fails: true,
        ..SimulatedProxy::new(CONFIG)
    });
    let host = remote_host(&proxy);

    let err = ProxyPatcher::new("kube-apiserver")
        .apply(&host, &add("m2", "10.0.0.3"))
        .await
        .unwrap_err();

    assert!(matches!(err, PatchError::RestartFailed(ref message) if message.contains("haproxy.service")));
    assert!(proxy.file().contains("server m2"));
}

#[tokio::test]
async fn test_unknown_backend_touches_nothing() {
    let proxy = Arc::new(SimulatedProxy::new(CONFIG));
    let host = remote_host(&proxy);

    let err = ProxyPatcher::new("etcd")
        .apply(&host, &add("m2", "10.0.0.3"))
        .await
        .unwrap_err();

    assert!(matches!(err, PatchError::Document(_)));
    assert_eq!(proxy.kinds(), ["read"]);
    assert_eq!(proxy.file(), CONFIG);
}
