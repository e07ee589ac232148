//! Install and watcher scripts rendered with handlebars.

use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;
use serde_json::Value;

use super::extract::{ANCHOR_CONTEXT_LINES, CERT_KEY_ANCHOR, INSTALL_SENTINEL, JOIN_ANCHOR};
use super::layout::RemoteLayout;
use crate::params::validate_remote_path;

/// Variables of the first control-plane install.
#[derive(Debug, Clone, Serialize)]
pub struct FirstMasterVars {
    /// Load balancer address; empty to use the node's primary address.
    pub lb_ip: String,
    pub lb_port: u16,
    pub server_name: String,
    /// Minor version, empty to discover.
    pub k8s_version: String,
    pub pod_cidr: String,
}

/// Variables of a join install.
#[derive(Debug, Clone, Serialize)]
pub struct JoinVars {
    pub join_command: String,
    pub certificate_key: String,
    pub control_plane: bool,
    pub server_name: String,
    pub k8s_version: String,
}

/// Variables of the completion watcher.
#[derive(Debug, Clone, Serialize)]
pub struct WatcherVars {
    pub interval_secs: u64,
    pub max_wait_secs: u64,
}

/// Renders the bash scripts run on provisioned nodes.
pub struct ScriptRenderer {
    handlebars: Handlebars<'static>,
}

impl ScriptRenderer {
    /// Create a renderer with the embedded templates.
    ///
    /// # Errors
    ///
    /// Fails if an embedded template does not compile.
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.set_strict_mode(true);

        handlebars.register_partial("prelude", PRELUDE_TEMPLATE)?;
        handlebars.register_template_string("first_master", FIRST_MASTER_TEMPLATE)?;
        handlebars.register_template_string("join_node", JOIN_NODE_TEMPLATE)?;
        handlebars.register_template_string("watcher", WATCHER_TEMPLATE)?;

        Ok(Self { handlebars })
    }

    /// Script initialising the first control-plane node.
    ///
    /// # Errors
    ///
    /// Fails if rendering fails.
    pub fn first_master(&self, layout: &RemoteLayout, vars: &FirstMasterVars) -> Result<String> {
        self.render("first_master", layout, vars)
    }

    /// Script joining a worker or an additional control-plane node.
    ///
    /// # Errors
    ///
    /// Fails if rendering fails.
    pub fn join_node(&self, layout: &RemoteLayout, vars: &JoinVars) -> Result<String> {
        self.render("join_node", layout, vars)
    }

    /// Script waiting for the install sentinel and writing the join markers.
    ///
    /// # Errors
    ///
    /// Fails if rendering fails.
    pub fn watcher(&self, layout: &RemoteLayout, vars: &WatcherVars) -> Result<String> {
        self.render("watcher", layout, vars)
    }

    fn render<T: Serialize>(&self, template: &str, layout: &RemoteLayout, vars: &T) -> Result<String> {
        // Layout paths are interpolated inside double quotes.
        validate_remote_path("remote_dir", layout.dir())?;

        let mut data = serde_json::to_value(vars)?;
        if let Value::Object(map) = &mut data {
            let common = [
                ("sentinel", INSTALL_SENTINEL.to_string()),
                ("failed_marker", layout.install_failed()),
                ("install_log", layout.install_log()),
                ("join_file", layout.join_command()),
                ("cert_file", layout.certificate_key()),
                ("debug_file", layout.extract_debug_log()),
                ("status_file", layout.watcher_status()),
                ("join_anchor", JOIN_ANCHOR.to_string()),
                ("cert_anchor", CERT_KEY_ANCHOR.to_string()),
            ];
            for (key, value) in common {
                map.insert(key.to_string(), Value::String(value));
            }
            map.insert("anchor_lines".to_string(), Value::from(ANCHOR_CONTEXT_LINES));
        }

        self.handlebars
            .render(template, &data)
            .with_context(|| format!("failed to render {template} script"))
    }
}

/// Shared node preparation: package family, Kubernetes version, kernel
/// settings, containerd and the kubeadm toolchain.
const PRELUDE_TEMPLATE: &str = r#"FAILED_MARKER="{{failed_marker}}"
SENTINEL="{{sentinel}}"
rm -f "$FAILED_MARKER"
trap 'echo "failed at line $LINENO: $BASH_COMMAND" > "$FAILED_MARKER"' ERR

log() { echo "[$(date -u +%H:%M:%S)] $*"; }

export DEBIAN_FRONTEND=noninteractive

if command -v apt-get >/dev/null 2>&1; then
  PKG_FAMILY=apt
elif command -v dnf >/dev/null 2>&1 || command -v yum >/dev/null 2>&1; then
  PKG_FAMILY=yum
else
  echo "unsupported distribution: no apt-get, dnf or yum" >&2
  false
fi

if [ -z "$K8S_VERSION" ]; then
  K8S_VERSION="$(curl -fsSL https://dl.k8s.io/release/stable.txt | sed -E 's/^v([0-9]+\.[0-9]+).*/\1/')"
fi
log "preparing node for Kubernetes v$K8S_VERSION ($PKG_FAMILY)"

swapoff -a
sed -ri '/\sswap\s/s/^#?/#/' /etc/fstab

cat > /etc/modules-load.d/k8s.conf <<EOF
overlay
br_netfilter
EOF
modprobe overlay
modprobe br_netfilter

cat > /etc/sysctl.d/k8s.conf <<EOF
net.bridge.bridge-nf-call-iptables = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward = 1
EOF
sysctl --system >/dev/null

if [ "$PKG_FAMILY" = apt ]; then
  apt-get update -y
  apt-get install -y apt-transport-https ca-certificates curl gpg containerd
  mkdir -p /etc/apt/keyrings
  curl -fsSL "https://pkgs.k8s.io/core:/stable:/v$K8S_VERSION/deb/Release.key" \
    | gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg
  echo "deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/v$K8S_VERSION/deb/ /" \
    > /etc/apt/sources.list.d/kubernetes.list
  apt-get update -y
  apt-get install -y kubelet kubeadm kubectl
  apt-mark hold kubelet kubeadm kubectl
else
  setenforce 0 || true
  sed -i 's/^SELINUX=enforcing$/SELINUX=permissive/' /etc/selinux/config || true
  cat > /etc/yum.repos.d/kubernetes.repo <<EOF
[kubernetes]
name=Kubernetes
baseurl=https://pkgs.k8s.io/core:/stable:/v$K8S_VERSION/rpm/
enabled=1
gpgcheck=1
gpgkey=https://pkgs.k8s.io/core:/stable:/v$K8S_VERSION/rpm/repodata/repomd.xml.key
exclude=kubelet kubeadm kubectl cri-tools kubernetes-cni
EOF
  yum install -y yum-utils
  yum-config-manager --add-repo https://download.docker.com/linux/centos/docker-ce.repo
  yum install -y containerd.io
  yum install -y kubelet kubeadm kubectl --disableexcludes=kubernetes
fi

mkdir -p /etc/containerd
containerd config default > /etc/containerd/config.toml
sed -i 's/SystemdCgroup = false/SystemdCgroup = true/' /etc/containerd/config.toml
systemctl restart containerd
systemctl enable --now kubelet

install_kubeconfig() {
  mkdir -p /root/.kube
  cp -f /etc/kubernetes/admin.conf /root/.kube/config
  if [ -n "${SUDO_USER:-}" ] && [ "$SUDO_USER" != root ]; then
    user_home="$(getent passwd "$SUDO_USER" | cut -d: -f6)"
    mkdir -p "$user_home/.kube"
    cp -f /etc/kubernetes/admin.conf "$user_home/.kube/config"
    chown -R "$SUDO_USER": "$user_home/.kube"
  fi
}
"#;

const FIRST_MASTER_TEMPLATE: &str = r#"#!/usr/bin/env bash
set -Eeuo pipefail

LB_IP="{{lb_ip}}"
LB_PORT="{{lb_port}}"
SERVER_NAME="{{server_name}}"
K8S_VERSION="{{k8s_version}}"
POD_CIDR="{{pod_cidr}}"

{{> prelude}}
if [ -z "$LB_IP" ]; then
  LB_IP="$(hostname -I | awk '{print $1}')"
fi

log "initialising control plane $SERVER_NAME behind $LB_IP:$LB_PORT"
hostnamectl set-hostname "$SERVER_NAME" || true
kubeadm init \
  --control-plane-endpoint "$LB_IP:$LB_PORT" \
  --upload-certs \
  --pod-network-cidr "$POD_CIDR" \
  --node-name "$SERVER_NAME"

install_kubeconfig
log "installing pod network"
kubectl --kubeconfig /etc/kubernetes/admin.conf apply \
  -f https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml

echo "$SENTINEL"
"#;

const JOIN_NODE_TEMPLATE: &str = r#"#!/usr/bin/env bash
set -Eeuo pipefail

JOIN_COMMAND="{{join_command}}"
CERTIFICATE_KEY="{{certificate_key}}"
CONTROL_PLANE="{{#if control_plane}}1{{else}}0{{/if}}"
SERVER_NAME="{{server_name}}"
K8S_VERSION="{{k8s_version}}"

{{> prelude}}
hostnamectl set-hostname "$SERVER_NAME" || true
read -r -a JOIN_ARGS <<< "$JOIN_COMMAND"

if [ "$CONTROL_PLANE" = 1 ]; then
  log "joining $SERVER_NAME as control-plane node"
  "${JOIN_ARGS[@]}" --control-plane --certificate-key "$CERTIFICATE_KEY" --node-name "$SERVER_NAME"
  install_kubeconfig
else
  log "joining $SERVER_NAME as worker node"
  "${JOIN_ARGS[@]}" --node-name "$SERVER_NAME"
fi

echo "$SENTINEL"
"#;

/// Mirrors the cascade in `extract.rs`; keep both in step.
const WATCHER_TEMPLATE: &str = r#"#!/usr/bin/env bash
set -uo pipefail

LOG="{{install_log}}"
SENTINEL="{{sentinel}}"
FAILED_MARKER="{{failed_marker}}"
JOIN_FILE="{{join_file}}"
CERT_FILE="{{cert_file}}"
DEBUG_FILE="{{debug_file}}"
STATUS_FILE="{{status_file}}"
JOIN_ANCHOR="{{join_anchor}}"
CERT_ANCHOR="{{cert_anchor}}"
ANCHOR_LINES={{anchor_lines}}
INTERVAL={{interval_secs}}
MAX_WAIT={{max_wait_secs}}

umask 077
echo running > "$STATUS_FILE"
: > "$DEBUG_FILE"
debug() { echo "$*" >> "$DEBUG_FILE"; }

give_up() {
  : > "$JOIN_FILE"
  : > "$CERT_FILE"
  echo "$1" > "$STATUS_FILE"
  debug "$2"
  exit 1
}

waited=0
until grep -qxF "$SENTINEL" "$LOG" 2>/dev/null; do
  if [ -s "$FAILED_MARKER" ]; then
    give_up failed "install failed: $(cat "$FAILED_MARKER")"
  fi
  if [ "$waited" -ge "$MAX_WAIT" ]; then
    give_up timeout "sentinel not seen after ${MAX_WAIT}s"
  fi
  sleep "$INTERVAL"
  waited=$((waited + INTERVAL))
done
debug "sentinel seen after ${waited}s"

collapse() {
  awk '{ line = $0; sub(/\\[[:space:]]*$/, "", line); printf "%s ", line; if ($0 !~ /\\[[:space:]]*$/) exit }' \
    | tr -s ' \t' ' ' | sed 's/^ *//; s/ *$//'
}

valid_join() {
  case "$1" in "kubeadm join "*) ;; *) return 1 ;; esac
  echo "$1" | grep -Eq -- '--token [a-z0-9]{6}\.[a-z0-9]{16}' || return 1
  echo "$1" | grep -Eq -- '--discovery-token-ca-cert-hash sha256:[a-f0-9]{64}'
}

valid_cert() {
  echo "$1" | grep -Eqx '[a-f0-9]{64}'
}

join=""

cand="$(grep -F -A "$ANCHOR_LINES" "$JOIN_ANCHOR" "$LOG" | tail -n +2 | sed -n '/kubeadm join/,$p' | collapse)"
if [ -n "$cand" ] && valid_join "kubeadm join${cand#*kubeadm join}"; then
  join="kubeadm join${cand#*kubeadm join}"
  debug "join_anchor: accepted"
else
  debug "join_anchor: rejected"
fi

if [ -z "$join" ]; then
  cand=""
  for n in $(grep -n 'kubeadm join' "$LOG" | cut -d: -f1 | sort -rn); do
    block="$(tail -n +"$n" "$LOG" | collapse)"
    case "$block" in *--control-plane*) continue ;; esac
    cand="kubeadm join${block#*kubeadm join}"
    break
  done
  if valid_join "$cand"; then join="$cand"; debug "join_last_line: accepted"; else debug "join_last_line: rejected"; fi
fi

if [ -z "$join" ]; then
  endpoint="$(grep -oE 'kubeadm join [^ ]+' "$LOG" | tail -n 1 | awk '{print $3}')"
  token="$(grep -oE -- '--token [a-z0-9]{6}\.[a-z0-9]{16}' "$LOG" | tail -n 1 | awk '{print $2}')"
  hash="$(grep -oE 'sha256:[a-f0-9]{64}' "$LOG" | tail -n 1)"
  cand="kubeadm join $endpoint --token $token --discovery-token-ca-cert-hash $hash"
  if [ -n "$endpoint" ] && [ -n "$token" ] && [ -n "$hash" ] && valid_join "$cand"; then
    join="$cand"
    debug "join_fragments: accepted"
  else
    debug "join_fragments: rejected"
  fi
fi

cert="$(grep -oE -- '--certificate-key [a-f0-9]{64}' "$LOG" | tail -n 1 | awk '{print $2}')"
if ! valid_cert "$cert"; then
  cert="$(grep -A 1 -F "$CERT_ANCHOR" "$LOG" | tail -n 1 | sed "s/.*$CERT_ANCHOR//" | tr -d ' \t\r')"
fi
if ! valid_cert "$cert"; then
  cert="$(grep -xE '[[:space:]]*[a-f0-9]{64}[[:space:]]*' "$LOG" | tail -n 1 | tr -d ' \t\r')"
fi
valid_cert "$cert" || cert=""
debug "certificate key: $( [ -n "$cert" ] && echo found || echo none )"

printf '%s\n' "$join" > "$JOIN_FILE"
printf '%s\n' "$cert" > "$CERT_FILE"
{
  echo "candidate lines:"
  grep -nE 'kubeadm join|--token|--discovery-token-ca-cert-hash|certificate' "$LOG" | sed 's/--token [^ ]*/--token <redacted>/'
} >> "$DEBUG_FILE"
echo done > "$STATUS_FILE"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RemoteLayout {
        RemoteLayout::new("/tmp/kubehop")
    }

    #[test]
    fn test_first_master_embeds_variables_and_prelude() {
        let renderer = ScriptRenderer::new().unwrap();
        let script = renderer
            .first_master(
                &layout(),
                &FirstMasterVars {
                    lb_ip: "10.0.0.5".into(),
                    lb_port: 6443,
                    server_name: "master-1".into(),
                    k8s_version: "1.31".into(),
                    pod_cidr: "10.244.0.0/16".into(),
                },
            )
            .unwrap();

        assert!(script.starts_with("#!/usr/bin/env bash"));
        assert!(script.contains("LB_IP=\"10.0.0.5\""));
        assert!(script.contains("K8S_VERSION=\"1.31\""));
        assert!(script.contains("FAILED_MARKER=\"/tmp/kubehop/install.failed\""));
        assert!(script.contains("--upload-certs"));
        assert!(script.contains("dl.k8s.io/release/stable.txt"));
        assert!(script.contains("awk '{print $1}'"));
        assert!(script.trim_end().ends_with("echo \"$SENTINEL\""));
    }

    #[test]
    fn test_join_node_switches_on_control_plane() {
        let renderer = ScriptRenderer::new().unwrap();
        let mut vars = JoinVars {
            join_command: "kubeadm join 10.0.0.5:6443 --token a".into(),
            certificate_key: String::new(),
            control_plane: false,
            server_name: "worker-1".into(),
            k8s_version: String::new(),
        };

        let worker = renderer.join_node(&layout(), &vars).unwrap();
        assert!(worker.contains("CONTROL_PLANE=\"0\""));
        assert!(worker.contains("\"${JOIN_ARGS[@]}\" --node-name"));

        vars.control_plane = true;
        let master = renderer.join_node(&layout(), &vars).unwrap();
        assert!(master.contains("CONTROL_PLANE=\"1\""));
    }

    #[test]
    fn test_watcher_carries_cascade_constants() {
        let renderer = ScriptRenderer::new().unwrap();
        let script = renderer
            .watcher(
                &layout(),
                &WatcherVars {
                    interval_secs: 10,
                    max_wait_secs: 1800,
                },
            )
            .unwrap();

        assert!(script.contains(&format!("JOIN_ANCHOR=\"{JOIN_ANCHOR}\"")));
        assert!(script.contains("ANCHOR_LINES=4"));
        assert!(script.contains("MAX_WAIT=1800"));
        assert!(script.contains("JOIN_FILE=\"/tmp/kubehop/join-command\""));
        assert!(script.contains("echo done > \"$STATUS_FILE\""));
        assert!(script.contains("give_up timeout"));
    }

    #[test]
    fn test_unsafe_remote_dir_is_not_rendered() {
        let renderer = ScriptRenderer::new().unwrap();
        let vars = WatcherVars {
            interval_secs: 1,
            max_wait_secs: 1,
        };
        for dir in ["/tmp/kube hop", "/tmp/\"$(reboot)\"", "/tmp/kh`id`"] {
            assert!(renderer.watcher(&RemoteLayout::new(dir), &vars).is_err(), "{dir}");
        }
    }

    // =========================================================================
    // Watcher runs
    // =========================================================================

    #[cfg(unix)]
    mod watcher_runs {
        use std::fs;
        use std::process::Command;

        use super::*;

        const HASH: &str = "5e0c2a4f6b8d1e3f5a7c9b0d2e4f6a8c1b3d5f7e9a0c2e4b6d8f1a3c5e7b9d0f";
        const CERT: &str = "c0ffee00c0ffee11c0ffee22c0ffee33c0ffee44c0ffee55c0ffee66c0ffee77";

        struct Run {
            status: String,
            join: String,
            cert: String,
            debug: String,
        }

        /// Render the watcher into a scratch layout, seed the install log
        /// and run the script to completion.
        fn run_watcher(log: Option<&str>) -> Run {
            let dir = tempfile::tempdir().unwrap();
            let layout = RemoteLayout::new(dir.path().to_str().unwrap());
            let script = ScriptRenderer::new()
                .unwrap()
                .watcher(
                    &layout,
                    &WatcherVars {
                        interval_secs: 1,
                        max_wait_secs: 0,
                    },
                )
                .unwrap();
            fs::write(layout.watcher_script(), script).unwrap();
            if let Some(log) = log {
                fs::write(layout.install_log(), log).unwrap();
            }

            Command::new("bash")
                .arg(layout.watcher_script())
                .status()
                .expect("bash is available");

            let read = |path: String| fs::read_to_string(path).unwrap_or_default();
            Run {
                status: read(layout.watcher_status()).trim().to_string(),
                join: read(layout.join_command()),
                cert: read(layout.certificate_key()),
                debug: read(layout.extract_debug_log()),
            }
        }

        fn worker_join() -> String {
            format!("kubeadm join 10.0.0.5:6443 --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash sha256:{HASH}")
        }

        #[test]
        fn test_anchored_init_output() {
            let log = format!(
                "[upload-certs] Using certificate key:\n\
                 {CERT}\n\
                 \n\
                 You can now join any number of the control-plane node running the following command on each as root:\n\
                 \n\
                 \x20 kubeadm join 10.0.0.5:6443 --token abcdef.0123456789abcdef \\\n\
                 \t--discovery-token-ca-cert-hash sha256:{HASH} \\\n\
                 \t--control-plane --certificate-key {CERT}\n\
                 \n\
                 Then you can {JOIN_ANCHOR} on each as root:\n\
                 \n\
                 kubeadm join 10.0.0.5:6443 --token abcdef.0123456789abcdef \\\n\
                 \t--discovery-token-ca-cert-hash sha256:{HASH}\n\
                 namespace/kube-flannel created\n\
                 {INSTALL_SENTINEL}\n"
            );
            let run = run_watcher(Some(&log));

            assert_eq!(run.status, "done");
            assert_eq!(run.join, format!("{}\n", worker_join()));
            assert_eq!(run.cert, format!("{CERT}\n"));
            assert!(run.debug.contains("join_anchor: accepted"), "{}", run.debug);
        }

        #[test]
        fn test_last_join_line_without_anchor() {
            let log = format!(
                "[init] Using Kubernetes version: v1.31.0\n\
                 kubeadm join 10.0.0.5:6443 --token abcdef.0123456789abcdef \\\n\
                 \t--discovery-token-ca-cert-hash sha256:{HASH}\n\
                 {INSTALL_SENTINEL}\n"
            );
            let run = run_watcher(Some(&log));

            assert_eq!(run.status, "done");
            assert_eq!(run.join, format!("{}\n", worker_join()));
            assert_eq!(run.cert, "\n");
            assert!(run.debug.contains("join_anchor: rejected"), "{}", run.debug);
            assert!(run.debug.contains("join_last_line: accepted"), "{}", run.debug);
        }

        #[test]
        fn test_log_without_join_line() {
            let log = format!("[preflight] Running pre-flight checks\n{INSTALL_SENTINEL}\n");
            let run = run_watcher(Some(&log));

            assert_eq!(run.status, "done");
            assert_eq!(run.join, "\n");
            assert_eq!(run.cert, "\n");
            assert!(run.debug.contains("join_fragments: rejected"), "{}", run.debug);
        }

        #[test]
        fn test_missing_sentinel_times_out() {
            let run = run_watcher(Some("[init] still pulling images\n"));

            assert_eq!(run.status, "timeout");
            assert!(run.join.is_empty());
            assert!(run.cert.is_empty());
            assert!(run.debug.contains("sentinel not seen"), "{}", run.debug);
        }
    }
}
