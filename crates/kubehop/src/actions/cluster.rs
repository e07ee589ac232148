//! Kubernetes node lifecycle actions.
//!
//! Install actions write a rendered script under the remote working
//! directory and start it detached; every other action is a short command
//! list that completes within one orchestrator call.

use std::sync::Arc;

use anyhow::Result;

use super::password;
use crate::bootstrap::{status_command, FirstMasterVars, JoinVars, RemoteLayout, ScriptRenderer, WatcherVars};
use crate::config::Settings;
use crate::params::{
    validate_certificate_key, validate_cidr, validate_ip, validate_join_command, validate_k8s_version,
    validate_server_name, Params,
};
use crate::registry::{CommandRegistry, CommandTemplate};
use crate::shell::{detach, quote, sudo, tolerant, write_file};

pub const INSTALL_FIRST_MASTER: &str = "installFirstMaster";
pub const START_JOIN_WATCHER: &str = "startJoinWatcher";
pub const JOIN_MASTER: &str = "joinMaster";
pub const JOIN_WORKER: &str = "joinWorker";
pub const CHECK_INSTALL_STATUS: &str = "checkInstallStatus";
pub const FETCH_JOIN_CREDENTIALS: &str = "fetchJoinCredentials";
pub const READ_INSTALL_LOG: &str = "readInstallLog";
pub const REFRESH_JOIN_CREDENTIALS: &str = "refreshJoinCredentials";
pub const CANCEL_INSTALL: &str = "cancelInstall";
pub const GET_NODES: &str = "getNodes";
pub const CORDON_NODE: &str = "cordonNode";
pub const DRAIN_NODE: &str = "drainNode";
pub const DELETE_NODE: &str = "deleteNode";
pub const REMOVE_NODE_FROM_CLUSTER: &str = "removeNodeFromCluster";
pub const RESET_NODE: &str = "resetNode";
pub const REMOVE_ETCD_MEMBER: &str = "removeEtcdMember";
pub const CLEANUP_ETCD_DATA: &str = "cleanupEtcdData";

const KUBECTL: &str = "kubectl --kubeconfig /etc/kubernetes/admin.conf";

const PACKAGES: &str = "kubelet kubeadm kubectl kubernetes-cni cri-tools";

/// Removes the named member through the etcd pod of another control-plane
/// node. `__NODE__` is replaced by the quoted node name.
const ETCD_REMOVE_SCRIPT: &str = r#"K="kubectl --kubeconfig /etc/kubernetes/admin.conf -n kube-system"
POD=$($K get pods -l component=etcd --field-selector spec.nodeName!=__NODE__ -o jsonpath='{.items[0].metadata.name}')
if [ -z "$POD" ]; then
  echo "no etcd pod found on another control-plane node" >&2
  exit 1
fi
ETCDCTL="$K exec $POD -- etcdctl --endpoints=https://127.0.0.1:2379 --cacert=/etc/kubernetes/pki/etcd/ca.crt --cert=/etc/kubernetes/pki/etcd/server.crt --key=/etc/kubernetes/pki/etcd/server.key"
ID=$($ETCDCTL member list | awk -F', ' -v n=__NODE__ '$3 == n {print $1}')
if [ -n "$ID" ]; then
  $ETCDCTL member remove "$ID"
else
  echo no etcd member named __NODE__
fi"#;

/// Settings the install builders fall back to.
#[derive(Debug, Clone)]
struct InstallDefaults {
    lb_port: u16,
    k8s_version: String,
    pod_cidr: String,
    watcher: WatcherVars,
}

impl From<&Settings> for InstallDefaults {
    fn from(settings: &Settings) -> Self {
        Self {
            lb_port: settings.lb_port,
            k8s_version: settings.k8s_version.clone(),
            pod_cidr: settings.pod_cidr.clone(),
            watcher: WatcherVars {
                interval_secs: settings.watch_interval_secs,
                max_wait_secs: settings.watch_max_wait_secs,
            },
        }
    }
}

/// Register the cluster actions.
pub fn register(registry: &mut CommandRegistry, settings: &Settings, renderer: &Arc<ScriptRenderer>) {
    let layout = settings.layout();
    let defaults = InstallDefaults::from(settings);

    register_installs(registry, &layout, &defaults, renderer);
    register_markers(registry, &layout);
    register_node_actions(registry);
}

fn register_installs(
    registry: &mut CommandRegistry,
    layout: &RemoteLayout,
    defaults: &InstallDefaults,
    renderer: &Arc<ScriptRenderer>,
) {
    {
        let (renderer, layout, defaults) = (Arc::clone(renderer), layout.clone(), defaults.clone());
        let check = defaults.clone();
        registry.register(
            INSTALL_FIRST_MASTER,
            CommandTemplate::built(move |p| {
                let vars = first_master_vars(p, &defaults)?;
                let script = renderer.first_master(&layout, &vars)?;
                Ok(launch_install(&layout, &script, password(p)))
            })
            .validated(move |p| first_master_vars(p, &check).map(|_| ())),
        );
    }

    for (action, control_plane) in [(JOIN_MASTER, true), (JOIN_WORKER, false)] {
        let (renderer, layout, defaults) = (Arc::clone(renderer), layout.clone(), defaults.clone());
        let check = defaults.clone();
        registry.register(
            action,
            CommandTemplate::built(move |p| {
                let vars = join_vars(p, &defaults, control_plane)?;
                let script = renderer.join_node(&layout, &vars)?;
                Ok(launch_install(&layout, &script, password(p)))
            })
            .validated(move |p| join_vars(p, &check, control_plane).map(|_| ())),
        );
    }

    {
        let (renderer, layout, vars) = (Arc::clone(renderer), layout.clone(), defaults.watcher.clone());
        registry.register(
            START_JOIN_WATCHER,
            CommandTemplate::built(move |_| {
                let script = renderer.watcher(&layout, &vars)?;
                Ok(launch_watcher(&layout, &script))
            }),
        );
    }
}

fn register_markers(registry: &mut CommandRegistry, layout: &RemoteLayout) {
    registry.register(CHECK_INSTALL_STATUS, CommandTemplate::fixed([status_command(layout)]));

    registry.register(
        FETCH_JOIN_CREDENTIALS,
        CommandTemplate::fixed([read_marker(&layout.join_command()), read_marker(&layout.certificate_key())]),
    );

    registry.register(READ_INSTALL_LOG, CommandTemplate::fixed([read_marker(&layout.install_log())]));

    registry.register(
        REFRESH_JOIN_CREDENTIALS,
        CommandTemplate::built(|p| {
            Ok(vec![
                sudo(password(p), "kubeadm token create --print-join-command"),
                sudo(
                    password(p),
                    "kubeadm init phase upload-certs --upload-certs 2>/dev/null | tail -n 1",
                ),
            ])
        }),
    );

    let layout = layout.clone();
    registry.register(
        CANCEL_INSTALL,
        CommandTemplate::built(move |p| Ok(vec![sudo(password(p), &cancel_script(&layout))])),
    );
}

fn register_node_actions(registry: &mut CommandRegistry) {
    registry.register(
        GET_NODES,
        CommandTemplate::built(|p| Ok(vec![sudo(password(p), &format!("{KUBECTL} get nodes -o wide"))])),
    );

    for (action, build) in [
        (CORDON_NODE, cordon as fn(&str) -> String),
        (DRAIN_NODE, drain),
        (DELETE_NODE, delete_node),
    ] {
        registry.register(
            action,
            CommandTemplate::built(move |p| Ok(vec![sudo(password(p), &build(&node_name(p)?))]))
                .validated(|p| node_name(p).map(|_| ())),
        );
    }

    registry.register(
        REMOVE_NODE_FROM_CLUSTER,
        CommandTemplate::built(|p| {
            let node = node_name(p)?;
            Ok([cordon(&node), drain(&node), delete_node(&node)]
                .iter()
                .map(|cmd| sudo(password(p), &tolerant(cmd)))
                .collect())
        })
        .validated(|p| node_name(p).map(|_| ())),
    );

    registry.register(
        RESET_NODE,
        CommandTemplate::built(|p| {
            Ok(reset_steps()
                .iter()
                .map(|cmd| sudo(password(p), &tolerant(cmd)))
                .collect())
        }),
    );

    registry.register(
        REMOVE_ETCD_MEMBER,
        CommandTemplate::built(|p| {
            let node = node_name(p)?;
            Ok(vec![sudo(password(p), &ETCD_REMOVE_SCRIPT.replace("__NODE__", &quote(&node)))])
        })
        .validated(|p| node_name(p).map(|_| ())),
    );

    registry.register(
        CLEANUP_ETCD_DATA,
        CommandTemplate::built(|p| Ok(vec![sudo(password(p), &tolerant("rm -rf /var/lib/etcd"))])),
    );
}

// ============================================================================
// Parameters
// ============================================================================

fn k8s_version(p: &Params, defaults: &InstallDefaults) -> Result<String> {
    let version = p.optional_str("k8s_version").unwrap_or(defaults.k8s_version.as_str());
    if !version.is_empty() {
        validate_k8s_version(version)?;
    }
    Ok(version.to_string())
}

fn server_name(p: &Params) -> Result<String> {
    let name = p.require_str("server_name")?;
    validate_server_name(name)?;
    Ok(name.to_string())
}

fn node_name(p: &Params) -> Result<String> {
    let name = p.require_str("node_name")?;
    validate_server_name(name)?;
    Ok(name.to_string())
}

fn first_master_vars(p: &Params, defaults: &InstallDefaults) -> Result<FirstMasterVars> {
    let lb_ip = p.optional_str("lb_ip").unwrap_or_default();
    if !lb_ip.is_empty() {
        validate_ip("lb_ip", lb_ip)?;
    }
    let pod_cidr = p.optional_str("pod_cidr").unwrap_or(defaults.pod_cidr.as_str());
    validate_cidr("pod_cidr", pod_cidr)?;

    Ok(FirstMasterVars {
        lb_ip: lb_ip.to_string(),
        lb_port: p.port("lb_port", defaults.lb_port)?,
        server_name: server_name(p)?,
        k8s_version: k8s_version(p, defaults)?,
        pod_cidr: pod_cidr.to_string(),
    })
}

fn join_vars(p: &Params, defaults: &InstallDefaults, control_plane: bool) -> Result<JoinVars> {
    let join_command = p.require_str("join_command")?.trim();
    validate_join_command(join_command)?;

    let certificate_key = if control_plane {
        let key = p.require_str("certificate_key")?.trim();
        validate_certificate_key(key)?;
        key.to_string()
    } else {
        String::new()
    };

    Ok(JoinVars {
        join_command: join_command.to_string(),
        certificate_key,
        control_plane,
        server_name: server_name(p)?,
        k8s_version: k8s_version(p, defaults)?,
    })
}

// ============================================================================
// Command builders
// ============================================================================

/// Write the install script, make it executable and start it detached as
/// root. Markers of a previous run are removed first.
fn launch_install(layout: &RemoteLayout, script: &str, password: Option<&str>) -> Vec<String> {
    let path = layout.install_script();
    let stale = [
        layout.install_pid(),
        layout.install_failed(),
        layout.watcher_status(),
        layout.join_command(),
        layout.certificate_key(),
        layout.extract_debug_log(),
    ];
    vec![
        format!(
            "mkdir -p {} && rm -f {} && {}",
            quote(layout.dir()),
            quote_all(&stale),
            write_file(&path, script)
        ),
        format!("chmod +x {}", quote(&path)),
        sudo(
            password,
            &detach(&format!("bash {}", quote(&path)), &layout.install_log(), &layout.install_pid()),
        ),
    ]
}

/// Same shape as [`launch_install`], but the watcher runs as the login user.
fn launch_watcher(layout: &RemoteLayout, script: &str) -> Vec<String> {
    let path = layout.watcher_script();
    vec![
        format!(
            "mkdir -p {} && rm -f {} && {}",
            quote(layout.dir()),
            quote_all(&[layout.watcher_status(), layout.watcher_pid()]),
            write_file(&path, script)
        ),
        format!("chmod +x {}", quote(&path)),
        detach(&format!("bash {}", quote(&path)), &layout.watcher_log(), &layout.watcher_pid()),
    ]
}

fn read_marker(path: &str) -> String {
    format!("cat {} 2>/dev/null || true", quote(path))
}

/// Kill the install's process group and the watcher, then mark the install
/// failed so status reports it as terminal.
fn cancel_script(layout: &RemoteLayout) -> String {
    let pid = quote(&layout.install_pid());
    let watcher_pid = quote(&layout.watcher_pid());
    format!(
        "if [ -s {pid} ]; then kill -TERM -- -\"$(cat {pid})\" 2>/dev/null || kill -TERM \"$(cat {pid})\" 2>/dev/null; fi; \
         if [ -s {watcher_pid} ]; then kill -TERM \"$(cat {watcher_pid})\" 2>/dev/null; fi; \
         echo 'cancelled by operator' > {}; true",
        quote(&layout.install_failed())
    )
}

fn cordon(node: &str) -> String {
    format!("{KUBECTL} cordon {}", quote(node))
}

fn drain(node: &str) -> String {
    format!(
        "{KUBECTL} drain {} --ignore-daemonsets --delete-emptydir-data --force --timeout=300s",
        quote(node)
    )
}

fn delete_node(node: &str) -> String {
    format!("{KUBECTL} delete node {} --ignore-not-found", quote(node))
}

fn reset_steps() -> Vec<String> {
    vec![
        "kubeadm reset -f".to_string(),
        "systemctl stop kubelet".to_string(),
        "iptables -F && iptables -t nat -F && iptables -t mangle -F && iptables -X".to_string(),
        "ipvsadm --clear".to_string(),
        "rm -rf /etc/kubernetes /etc/cni/net.d /var/lib/kubelet /var/lib/cni /root/.kube".to_string(),
        format!(
            "if command -v apt-get >/dev/null 2>&1; then apt-mark unhold {PACKAGES}; \
             DEBIAN_FRONTEND=noninteractive apt-get purge -y {PACKAGES}; \
             else yum remove -y {PACKAGES}; fi"
        ),
        "rm -f /usr/bin/kubeadm /usr/bin/kubelet /usr/bin/kubectl /usr/local/bin/kubeadm /usr/local/bin/kubelet /usr/local/bin/kubectl"
            .to_string(),
    ]
}

fn quote_all(paths: &[String]) -> String {
    paths.iter().map(|p| quote(p)).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::prepare;

    const JOIN: &str = "kubeadm join 10.0.0.5:6443 --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash sha256:2222222222222222222222222222222222222222222222222222222222222222";

    fn registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        let renderer = Arc::new(ScriptRenderer::new().unwrap());
        register(&mut registry, &Settings::default(), &renderer);
        registry
    }

    #[test]
    fn test_install_first_master_launch_sequence() {
        let registry = registry();
        let params = Params::new()
            .with("password", "p")
            .with("lb_ip", "10.0.0.5")
            .with("server_name", "m1");

        let commands = prepare(&registry, INSTALL_FIRST_MASTER, &params).unwrap();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].contains("LB_IP=\"10.0.0.5\""));
        assert!(commands[0].contains("SERVER_NAME=\"m1\""));
        assert!(commands[1].starts_with("chmod +x"));
        assert!(commands[2].contains("setsid nohup bash"));
        assert!(commands[2].contains("sudo -S"));
    }

    #[test]
    fn test_install_first_master_rejects_bad_params() {
        let registry = registry();
        let missing = Params::new().with("lb_ip", "10.0.0.5");
        assert!(prepare(&registry, INSTALL_FIRST_MASTER, &missing)
            .unwrap_err()
            .to_string()
            .contains("server_name"));

        let bad_ip = Params::new().with("server_name", "m1").with("lb_ip", "10.0.0.5;id");
        assert!(prepare(&registry, INSTALL_FIRST_MASTER, &bad_ip).is_err());

        let bad_version = Params::new().with("server_name", "m1").with("k8s_version", "latest");
        assert!(prepare(&registry, INSTALL_FIRST_MASTER, &bad_version).is_err());
    }

    #[test]
    fn test_empty_lb_ip_is_discovered() {
        let registry = registry();
        let commands = prepare(&registry, INSTALL_FIRST_MASTER, &Params::new().with("server_name", "m1")).unwrap();
        assert!(commands[0].contains("LB_IP=\"\""));
        assert!(commands[2].starts_with("sudo -n"));
    }

    #[test]
    fn test_join_master_requires_certificate_key() {
        let registry = registry();
        let params = Params::new().with("join_command", JOIN).with("server_name", "m2");

        assert!(prepare(&registry, JOIN_MASTER, &params)
            .unwrap_err()
            .to_string()
            .contains("certificate_key"));
        assert_eq!(prepare(&registry, JOIN_WORKER, &params).unwrap().len(), 3);

        let with_key = params.with("certificate_key", "c".repeat(64));
        let commands = prepare(&registry, JOIN_MASTER, &with_key).unwrap();
        assert!(commands[0].contains("CONTROL_PLANE=\"1\""));
    }

    #[test]
    fn test_join_rejects_injected_command() {
        let registry = registry();
        let params = Params::new()
            .with("join_command", format!("{JOIN} && reboot"))
            .with("server_name", "w1");
        assert!(prepare(&registry, JOIN_WORKER, &params).is_err());
    }

    #[test]
    fn test_watcher_runs_without_sudo() {
        let registry = registry();
        let commands = prepare(&registry, START_JOIN_WATCHER, &Params::new()).unwrap();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].contains("watcher.sh"));
        assert!(!commands[2].contains("sudo"));
        assert!(commands[2].contains("watcher.pid"));
    }

    #[test]
    fn test_fetch_reads_markers_only() {
        let registry = registry();
        let commands = prepare(&registry, FETCH_JOIN_CREDENTIALS, &Params::new()).unwrap();
        assert_eq!(
            commands,
            vec![
                "cat '/tmp/kubehop/join-command' 2>/dev/null || true".to_string(),
                "cat '/tmp/kubehop/certificate-key' 2>/dev/null || true".to_string(),
            ]
        );
    }

    #[test]
    fn test_cancel_kills_process_group_and_marks_failure() {
        let script = cancel_script(&RemoteLayout::new("/tmp/kubehop"));
        assert!(script.contains("kill -TERM -- -\"$(cat '/tmp/kubehop/install.pid')\""));
        assert!(script.contains("watcher.pid"));
        assert!(script.contains("'/tmp/kubehop/install.failed'"));
    }

    #[test]
    fn test_node_actions_quote_names() {
        let registry = registry();
        let params = Params::new().with("node_name", "w1");

        let drain = prepare(&registry, DRAIN_NODE, &params).unwrap();
        assert_eq!(drain.len(), 1);
        assert!(drain[0].contains("drain '\\''w1'\\''"));

        let removal = prepare(&registry, REMOVE_NODE_FROM_CLUSTER, &params).unwrap();
        assert_eq!(removal.len(), 3);
        assert!(removal.iter().all(|cmd| cmd.contains("|| true")));

        assert!(prepare(&registry, CORDON_NODE, &Params::new()).is_err());
        assert!(prepare(&registry, DELETE_NODE, &Params::new().with("node_name", "w1; id")).is_err());
    }

    #[test]
    fn test_reset_steps_are_tolerant() {
        let registry = registry();
        let commands = prepare(&registry, RESET_NODE, &Params::new()).unwrap();
        assert_eq!(commands.len(), reset_steps().len());
        assert!(commands.iter().all(|cmd| cmd.ends_with("|| true'")));
        assert!(commands[0].contains("kubeadm reset -f"));
    }

    #[test]
    fn test_etcd_member_removal_targets_named_member() {
        let registry = registry();
        let commands = prepare(&registry, REMOVE_ETCD_MEMBER, &Params::new().with("node_name", "m2")).unwrap();
        assert_eq!(commands.len(), 1);
        assert!(!commands[0].contains("__NODE__"));
        assert!(commands[0].contains("member remove"));
    }
}
