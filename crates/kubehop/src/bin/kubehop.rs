//! kubehop CLI - run cluster lifecycle actions on hosts behind SSH jump hosts.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kubehop::actions;
use kubehop::bootstrap::{BootstrapState, BootstrapWorkflow, FetchedCredential};
use kubehop::hop::{ChainExecutor, Credential, HopEndpoint, RusshDialer, Target};
use kubehop::inventory::{NodeRecord, NodeRole, NodeStore, YamlNodeStore};
use kubehop::lifecycle::{LifecycleController, NodeAccess, ProxyBackend, TeardownReport};
use kubehop::proxy::{BackendOp, PatchReport, ProxyPatcher, RemoteProxyHost, ServerEntry};
use kubehop::shell::redact;
use kubehop::{CommandRegistry, ExecutionOutcome, Orchestrator, Params, Settings};

/// kubehop - multi-hop SSH orchestration for Kubernetes and Docker nodes.
#[derive(Parser)]
#[command(name = "kubehop")]
#[command(about = "Run cluster lifecycle actions on hosts behind SSH jump hosts")]
struct Cli {
    /// Settings file (YAML) overlaid on the `KUBEHOP_*` environment.
    #[arg(long, env = "KUBEHOP_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Inventory file (default `~/.kubehop/inventory.yaml`).
    #[arg(long, env = "KUBEHOP_INVENTORY", global = true)]
    inventory: Option<PathBuf>,

    /// Environment variable holding the SSH and sudo password.
    #[arg(long, default_value = "KUBEHOP_PASSWORD", global = true)]
    password_env: String,

    /// Private key file used for SSH instead of the password.
    #[arg(long, global = true)]
    identity: Option<PathBuf>,

    /// Environment variable holding the identity's passphrase.
    #[arg(long, global = true)]
    passphrase_env: Option<String>,

    /// Print JSON instead of a summary.
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where to run: explicit hops or an inventory node.
#[derive(Args, Clone, Default)]
struct TargetArgs {
    /// Hop as user@host[:port]; repeat per hop, bastion first.
    #[arg(long = "hop")]
    hops: Vec<String>,

    /// Inventory node whose stored hops are used.
    #[arg(long, conflicts_with = "hops")]
    node: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered actions.
    Actions,

    /// Print the commands an action would run, without connecting.
    Prepare {
        action: String,

        /// Action parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// Run an action.
    Run {
        action: String,

        /// Action parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Install the first control-plane node and start the join watcher.
    Install {
        #[arg(long)]
        server_name: String,

        /// Load balancer address; the node's own address when omitted.
        #[arg(long)]
        lb_ip: Option<String>,

        #[arg(long)]
        lb_port: Option<u16>,

        /// Kubernetes minor version (e.g. 1.31).
        #[arg(long)]
        k8s_version: Option<String>,

        /// Wait for the install and fetch the join credential.
        #[arg(long)]
        wait: bool,

        /// Store the node and its join credential in the inventory under this name.
        #[arg(long)]
        save_as: Option<String>,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Show the install state of a node.
    Status {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Read the join credential from a control-plane node.
    FetchJoin {
        /// Store the credential in the inventory under this name.
        #[arg(long)]
        save_as: Option<String>,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Join a node using the credential of an inventory control-plane node.
    Join {
        #[arg(long)]
        server_name: String,

        /// Inventory control-plane node providing the credential.
        #[arg(long)]
        master: String,

        /// Join as an additional control-plane node.
        #[arg(long)]
        control_plane: bool,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Evict a worker from the cluster and wipe it.
    RemoveWorker {
        /// Kubernetes node name.
        #[arg(long)]
        node_name: String,

        /// Inventory control-plane node running kubectl.
        #[arg(long)]
        control: String,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Remove a control-plane node and wipe it.
    RemoveMaster {
        /// Kubernetes node name.
        #[arg(long)]
        node_name: String,

        /// Inventory control-plane node that stays in the cluster.
        #[arg(long)]
        main_master: Option<String>,

        /// Inventory proxy node whose backend entry is removed.
        #[arg(long)]
        proxy: Option<String>,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Patch the load balancer backend.
    Proxy {
        #[command(subcommand)]
        op: ProxyCommand,
    },

    /// Kill a running install.
    Cancel {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Subcommand)]
enum ProxyCommand {
    /// Add an API server to the backend.
    Add {
        /// Server name in the backend.
        #[arg(long)]
        name: String,

        #[arg(long)]
        address: String,

        #[arg(long, default_value = "6443")]
        port: u16,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Remove a server from the backend.
    Remove {
        #[arg(long)]
        name: String,

        #[command(flatten)]
        target: TargetArgs,
    },
}

struct App {
    settings: Settings,
    orchestrator: Orchestrator,
    store: YamlNodeStore,
    password: Option<String>,
    identity: Option<PathBuf>,
    passphrase: Option<String>,
    json: bool,
}

impl App {
    fn credential(&self) -> Result<Credential> {
        if let Some(key_path) = &self.identity {
            return Ok(Credential::KeyFile {
                key_path: key_path.clone(),
                passphrase: self.passphrase.clone(),
            });
        }
        match &self.password {
            Some(password) => Ok(Credential::Password {
                password: password.clone(),
            }),
            None => bail!("no SSH credential: set the password variable or pass --identity"),
        }
    }

    /// Parameters shared by every action: the sudo password.
    fn base_params(&self) -> Params {
        let mut params = Params::new();
        if let Some(password) = &self.password {
            params.insert("password", password.as_str());
        }
        params
    }

    fn hops_target(&self, endpoints: &[HopEndpoint]) -> Result<Target> {
        let credential = self.credential()?;
        Ok(Target::new(
            endpoints
                .iter()
                .map(|endpoint| endpoint.with_credential(credential.clone()))
                .collect(),
        ))
    }

    async fn node_endpoints(&self, name: &str) -> Result<Vec<HopEndpoint>> {
        let record = self
            .store
            .get(name)
            .await?
            .with_context(|| format!("node {name} is not in {}", self.store.path().display()))?;
        if record.hops.is_empty() {
            bail!("inventory node {name} has no hops");
        }
        Ok(record.hops)
    }

    async fn node_target(&self, name: &str) -> Result<Target> {
        let endpoints = self.node_endpoints(name).await?;
        self.hops_target(&endpoints)
    }

    async fn endpoints(&self, args: &TargetArgs) -> Result<Vec<HopEndpoint>> {
        if let Some(node) = &args.node {
            return self.node_endpoints(node).await;
        }
        if args.hops.is_empty() {
            bail!("no target: pass --hop user@host[:port] or --node <name>");
        }
        args.hops.iter().map(|spec| spec.parse::<HopEndpoint>()).collect()
    }

    async fn target(&self, args: &TargetArgs) -> Result<Target> {
        let endpoints = self.endpoints(args).await?;
        self.hops_target(&endpoints)
    }

    fn params(&self, raw: &str) -> Result<Params> {
        let value: Value = serde_json::from_str(raw).context("--params must be JSON")?;
        let mut params = Params::try_from(value)?;
        if params.get("password").is_none() {
            if let Some(password) = &self.password {
                params.insert("password", password.as_str());
            }
        }
        Ok(params)
    }

    fn workflow(&self) -> BootstrapWorkflow {
        BootstrapWorkflow::new(self.orchestrator.clone(), &self.settings)
    }

    async fn save_credential(
        &self,
        name: &str,
        args: &TargetArgs,
        fetched: &FetchedCredential,
    ) -> Result<()> {
        let mut record = match self.store.get(name).await? {
            Some(record) => record,
            None => NodeRecord::new(name, NodeRole::Master, self.endpoints(args).await?),
        };
        record.set_credential(&fetched.credential, Utc::now());
        self.store.put(record).await?;
        info!(node = %name, "join credential stored");
        Ok(())
    }

    fn print<T: Serialize>(&self, value: &T, summary: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            summary();
        }
        Ok(())
    }
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info,kubehop=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::load(cli.config.as_deref())?;
    let mut registry = CommandRegistry::new();
    actions::register_all(&mut registry, &settings)?;

    let executor = ChainExecutor::new(RusshDialer::new(&settings));
    let orchestrator = Orchestrator::new(Arc::new(registry), Arc::new(executor), settings.exec_timeout());

    let app = App {
        store: YamlNodeStore::new(cli.inventory.clone()),
        password: env::var(&cli.password_env).ok().filter(|p| !p.is_empty()),
        identity: cli.identity.clone(),
        passphrase: cli.passphrase_env.as_deref().and_then(|name| env::var(name).ok()),
        json: cli.json,
        orchestrator,
        settings,
    };

    match cli.command {
        Commands::Actions => {
            for action in app.orchestrator.actions() {
                println!("{action}");
            }
        }

        Commands::Prepare { action, params } => {
            let params = app.params(&params)?;
            let commands: Vec<String> = app
                .orchestrator
                .prepare(&action, &params)?
                .iter()
                .map(|command| redact(command).into_owned())
                .collect();
            app.print(&commands, || {
                for (i, command) in commands.iter().enumerate() {
                    println!("{} {command}", format!("[{i}]").bright_black());
                }
            })?;
        }

        Commands::Run {
            action,
            params,
            target,
        } => {
            let params = app.params(&params)?;
            let target = app.target(&target).await?;
            let outcome = app.orchestrator.execute(&action, &params, Some(&target)).await;
            app.print(&outcome.to_json(), || print_outcome(&outcome))?;
            if !outcome.is_success() {
                bail!("{action} failed");
            }
        }

        Commands::Install {
            server_name,
            lb_ip,
            lb_port,
            k8s_version,
            wait,
            save_as,
            target: target_args,
        } => {
            let target = app.target(&target_args).await?;
            let mut params = app.base_params().with("server_name", server_name.as_str());
            if let Some(lb_ip) = lb_ip {
                params.insert("lb_ip", lb_ip);
            }
            if let Some(lb_port) = lb_port {
                params.insert("lb_port", lb_port);
            }
            if let Some(version) = k8s_version {
                params.insert("k8s_version", version);
            }

            let workflow = app.workflow();
            workflow.launch_first_master(&target, &params).await?;
            print_success(&format!("install of {server_name} launched"));

            if wait {
                let state = workflow
                    .wait_for_install(
                        &target,
                        Duration::from_secs(app.settings.watch_interval_secs),
                        Duration::from_secs(app.settings.watch_max_wait_secs),
                    )
                    .await?;
                print_state(&state);
                if let BootstrapState::Failed { reason } = state {
                    bail!("install failed: {reason}");
                }

                let fetched = workflow.fetch_credentials(&target).await?;
                if let Some(name) = save_as.as_deref().or(target_args.node.as_deref()) {
                    app.save_credential(name, &target_args, &fetched).await?;
                }
                app.print(&fetched, || print_credential(&fetched))?;
            }
        }

        Commands::Status { target } => {
            let target = app.target(&target).await?;
            let (state, markers) = app.workflow().status(&target).await?;
            app.print(&json!({"state": state, "markers": markers}), || {
                print_state(&state);
                if !markers.log_tail.is_empty() {
                    println!("{}", "install log:".bright_black());
                    for line in markers.log_tail.lines() {
                        println!("  {line}");
                    }
                }
            })?;
        }

        Commands::FetchJoin {
            save_as,
            target: target_args,
        } => {
            let target = app.target(&target_args).await?;
            let fetched = app.workflow().fetch_credentials(&target).await?;
            if let Some(name) = save_as.as_deref().or(target_args.node.as_deref()) {
                app.save_credential(name, &target_args, &fetched).await?;
            }
            app.print(&fetched, || print_credential(&fetched))?;
        }

        Commands::Join {
            server_name,
            master,
            control_plane,
            target,
        } => {
            let target = app.target(&target).await?;
            let master_target = app.node_target(&master).await?;
            let workflow = app.workflow();

            let fetched = workflow
                .ensure_join_credential(&app.store, &master, &master_target, &app.base_params(), Utc::now())
                .await?;

            let mut params = app
                .base_params()
                .with("server_name", server_name.as_str())
                .with("join_command", fetched.credential.join_command.as_str());
            if let Some(key) = &fetched.credential.certificate_key {
                params.insert("certificate_key", key.as_str());
            }

            workflow.launch_join(&target, &params, control_plane).await?;
            let role = if control_plane { "control-plane node" } else { "worker" };
            print_success(&format!("join of {server_name} as {role} launched"));
        }

        Commands::RemoveWorker {
            node_name,
            control,
            target,
        } => {
            let node = NodeAccess::new(app.target(&target).await?, app.base_params());
            let control = NodeAccess::new(app.node_target(&control).await?, app.base_params());

            let report = LifecycleController::new(app.orchestrator.clone())
                .remove_worker(&node_name, &control, &node)
                .await;
            app.print(&report, || print_report(&report))?;
        }

        Commands::RemoveMaster {
            node_name,
            main_master,
            proxy,
            target,
        } => {
            let node = NodeAccess::new(app.target(&target).await?, app.base_params());
            let main = match main_master {
                Some(name) => Some(NodeAccess::new(app.node_target(&name).await?, app.base_params())),
                None => None,
            };
            let proxy_host = match proxy {
                Some(name) => Some(RemoteProxyHost::new(
                    app.orchestrator.clone(),
                    app.node_target(&name).await?,
                    app.base_params(),
                )),
                None => None,
            };
            let patcher = ProxyPatcher::new(app.settings.haproxy_backend.as_str());

            let report = LifecycleController::new(app.orchestrator.clone())
                .remove_master(
                    &node_name,
                    &node,
                    main.as_ref(),
                    proxy_host.as_ref().map(|host| ProxyBackend {
                        host,
                        patcher: &patcher,
                    }),
                )
                .await;
            app.print(&report, || print_report(&report))?;
        }

        Commands::Proxy { op } => {
            let (op, target) = match op {
                ProxyCommand::Add {
                    name,
                    address,
                    port,
                    target,
                } => (BackendOp::Add(ServerEntry::new(name, address, port)), target),
                ProxyCommand::Remove { name, target } => (BackendOp::Remove { name }, target),
            };
            let host = RemoteProxyHost::new(app.orchestrator.clone(), app.target(&target).await?, app.base_params());
            let report = ProxyPatcher::new(app.settings.haproxy_backend.as_str())
                .apply(&host, &op)
                .await?;
            app.print(&report, || print_patch(&report))?;
        }

        Commands::Cancel { target } => {
            let target = app.target(&target).await?;
            app.workflow().cancel(&target, &app.base_params()).await?;
            print_success("install cancelled");
        }
    }

    Ok(())
}

fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

fn print_outcome(outcome: &ExecutionOutcome) {
    let elapsed = format!("({} ms)", outcome.elapsed.as_millis()).bright_black();
    if outcome.is_success() {
        println!("{} {} {elapsed}", "✓".green().bold(), outcome.action.bold());
    } else {
        println!("{} {} {elapsed}", "✗".red().bold(), outcome.action.bold());
    }

    for (i, result) in outcome.results.iter().enumerate() {
        let status = if result.success() {
            format!("exit {}", result.exit_status).green()
        } else {
            format!("exit {}", result.exit_status).red()
        };
        println!("{} {status}", format!("[{i}]").bright_black());
        for line in result.stdout.lines() {
            println!("    {line}");
        }
        for line in result.stderr.lines() {
            println!("    {}", line.yellow());
        }
    }

    if let Some(error) = &outcome.error {
        println!("{} {}: {error}", "✗".red().bold(), error.kind().red());
    }
}

fn print_state(state: &BootstrapState) {
    let label = match state {
        BootstrapState::Installed { .. } => state.to_string().green(),
        BootstrapState::Failed { .. } => state.to_string().red(),
        BootstrapState::Preparing | BootstrapState::Installing { .. } => state.to_string().yellow(),
    };
    println!("{} {label}", "state:".bold());
}

fn print_credential(fetched: &FetchedCredential) {
    println!("{} {:?}", "source:".bold(), fetched.source);
    println!("{}", fetched.credential.join_command);
    if let Some(key) = &fetched.credential.certificate_key {
        println!("{} {key}", "certificate key:".bold());
    }
}

fn print_report(report: &TeardownReport) {
    println!("{} {}", "teardown of".bold(), report.node.cyan().bold());
    for step in &report.steps {
        if step.success {
            println!("  {} {}", "✓".green(), step.step);
        } else {
            println!(
                "  {} {}: {}",
                "✗".red(),
                step.step,
                step.error.as_deref().unwrap_or_default().red()
            );
        }
    }
    if !report.all_succeeded() {
        println!(
            "{} {} step(s) failed; the node may need manual cleanup",
            "⚠".yellow().bold(),
            report.failed_steps().len()
        );
    }
}

fn print_patch(report: &PatchReport) {
    println!("{} {:?}", "backend:".bold(), report.change);
    if let Some(backup) = &report.backup {
        println!("{} {backup}", "backup:".bold());
    }
    if report.restarted {
        print_success("haproxy restarted");
    }
}
