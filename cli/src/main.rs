//! The control-plane CLI (§6 "CLI surface"): one subcommand per capability,
//! all of them thin wrappers around [`netsat_compiler::Compiler`] and
//! [`netsat_orchestrator::WorkerOrchestrator`]. Exit codes are contractual:
//! 0 success, 1 store/runtime error, 2 user/usage error.

mod topology;

use anyhow::{Context as _, Result};
use clap::{CommandFactory, Parser, Subcommand};
use netsat_compiler::Compiler;
use netsat_model::{Epoch, Keys, LinkRef, Node, NodeName, Worker};
use netsat_orchestrator::{SshRunner, WorkerOrchestrator};
use netsat_store::{EtcdStore, Store, StoreAuth};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use topology::TopologyFile;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
}

#[derive(Debug, Parser)]
#[command(name = "netsat", about = "NetSatBench control-plane CLI")]
struct Cli {
    #[arg(long, env = "ETCD_ENDPOINT", value_delimiter = ',', global = true)]
    etcd_endpoint: Vec<String>,

    #[arg(long, env = "ETCD_USER", global = true)]
    etcd_user: Option<String>,

    #[arg(long, env = "ETCD_PASSWORD", global = true)]
    etcd_password: Option<String>,

    #[arg(long, env = "ETCD_CA_CERT", global = true)]
    etcd_ca_cert: Option<String>,

    #[arg(long, env = "LOG_JSON", default_value_t = false, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Writes node/worker/L3 descriptors from a topology file.
    Init {
        topology: PathBuf,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Brings up overlay networks and containers for every known node.
    Deploy {
        #[arg(long)]
        image: String,
        #[arg(long, default_value = "eth0")]
        egress_interface: String,
    },
    /// Tears down containers, worker-side rules, and (optionally) node records.
    Rm {
        #[arg(long, default_value_t = false)]
        remove_nodes: bool,
    },
    /// Applies an epoch file (links-add/links-del/links-update/run).
    Run { epoch: PathBuf },
    /// Removes a single live link.
    Unlink {
        endpoint1: String,
        endpoint2: String,
        #[arg(long, default_value_t = 1)]
        antenna1: u32,
        #[arg(long, default_value_t = 1)]
        antenna2: u32,
    },
    /// Copies a local file into one node's container.
    Cp {
        node: String,
        local_path: PathBuf,
        remote_path: String,
    },
    /// Copies a local file into every node of a given `kind`.
    Cptype {
        kind: String,
        local_path: PathBuf,
        remote_path: String,
    },
    /// Runs a command inside one node's container.
    Exec {
        node: String,
        #[arg(long, default_value_t = false)]
        tty: bool,
        command: Vec<String>,
    },
    /// Fans a command out to every node of a given `kind`. `--tty` is
    /// refused here: an interactive TTY makes no sense against more than
    /// one container at once.
    Exectype {
        kind: String,
        #[arg(long, default_value_t = false)]
        tty: bool,
        command: Vec<String>,
    },
    /// Prints store-wide counts (nodes, workers, links, pending run batches).
    Stats,
    /// Prints one line per node: name, kind, worker, `eth0_ip`.
    Status,
}

#[tokio::main]
async fn main() {
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(e) if e.kind() == clap::error::ErrorKind::InvalidSubcommand => {
            eprintln!("{e}");
            eprintln!("available subcommands:");
            for sub in Cli::command().get_subcommands() {
                eprintln!("  {}", sub.get_name());
            }
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };

    let log_json = args.log_json;
    if let Err(e) = netsat_logging::setup_global_subscriber("netsat_cli=info", log_json) {
        eprintln!("failed to set up logging: {e}");
    }

    match run(args).await {
        Ok(()) => std::process::exit(0),
        Err(e) if e.downcast_ref::<CliError>().is_some() => {
            eprintln!("{e}");
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("{}", netsat_logging::err_with_src(&e));
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    // §4.9's "local policy violation ... before contacting the store":
    // validated ahead of any store connection even though it is cheap here.
    if let Command::Exectype { tty: true, .. } = &args.command {
        return Err(CliError::Usage(
            "exectype does not support --tty (refusing to fan an interactive session out to multiple containers)".to_owned(),
        )
        .into());
    }

    let ca_cert_pem = match &args.etcd_ca_cert {
        Some(path) => Some(tokio::fs::read(path).await.context("reading ETCD_CA_CERT")?),
        None => None,
    };
    let auth = StoreAuth {
        user: args.etcd_user.clone(),
        password: args.etcd_password.clone(),
        ca_cert_pem,
    };
    let store = Arc::new(EtcdStore::connect(args.etcd_endpoint.clone(), auth).await?);

    match args.command {
        Command::Init { topology, force } => cmd_init(&store, &topology, force).await,
        Command::Deploy { image, egress_interface } => cmd_deploy(&store, &image, &egress_interface).await,
        Command::Rm { remove_nodes } => cmd_rm(&store, remove_nodes).await,
        Command::Run { epoch } => cmd_run(&store, &epoch).await,
        Command::Unlink { endpoint1, endpoint2, antenna1, antenna2 } => {
            cmd_unlink(&store, &endpoint1, &endpoint2, antenna1, antenna2).await
        }
        Command::Cp { node, local_path, remote_path } => cmd_cp(&store, &node, &local_path, &remote_path).await,
        Command::Cptype { kind, local_path, remote_path } => cmd_cptype(&store, &kind, &local_path, &remote_path).await,
        Command::Exec { node, tty, command } => cmd_exec(&store, &node, tty, &command).await,
        Command::Exectype { kind, tty, command } => cmd_exectype(&store, &kind, tty, &command).await,
        Command::Stats => cmd_stats(&store).await,
        Command::Status => cmd_status(&store).await,
    }
}

async fn cmd_init(store: &Arc<EtcdStore>, topology: &PathBuf, force: bool) -> Result<()> {
    let raw = tokio::fs::read(topology).await.with_context(|| format!("reading {}", topology.display()))?;
    let topology: TopologyFile = serde_json::from_slice(&raw).context("parsing topology file")?;

    let compiler = Compiler::new(store.clone()).await?;
    compiler.init(&topology.nodes, &topology.workers, &topology.l3_config, force).await?;

    tracing::info!(nodes = topology.nodes.len(), workers = topology.workers.len(), "topology initialized");
    Ok(())
}

async fn cmd_run(store: &Arc<EtcdStore>, epoch_path: &PathBuf) -> Result<()> {
    let raw = tokio::fs::read(epoch_path).await.with_context(|| format!("reading {}", epoch_path.display()))?;
    let epoch: Epoch = serde_json::from_slice(&raw).context("parsing epoch file")?;

    let compiler = Compiler::new(store.clone()).await?;
    let report = compiler.apply_epoch(&epoch).await?;

    tracing::info!(added = report.added.len(), deleted = report.deleted.len(), updated = report.updated.len(), "epoch applied");
    for err in &report.errors {
        tracing::warn!(error = %err, "epoch element rejected");
    }

    Ok(())
}

async fn cmd_unlink(store: &Arc<EtcdStore>, a: &str, b: &str, ant_a: u32, ant_b: u32) -> Result<()> {
    let endpoint1: NodeName = a.parse().map_err(|_| CliError::Usage(format!("invalid node name {a}")))?;
    let endpoint2: NodeName = b.parse().map_err(|_| CliError::Usage(format!("invalid node name {b}")))?;

    let epoch = Epoch {
        time: chrono::Utc::now(),
        links_add: Vec::new(),
        links_del: vec![LinkRef { endpoint1, endpoint2, endpoint1_antenna: ant_a, endpoint2_antenna: ant_b }],
        links_update: Vec::new(),
        run: BTreeMap::new(),
    };

    let compiler = Compiler::new(store.clone()).await?;
    let report = compiler.apply_epoch(&epoch).await?;

    if report.deleted.is_empty() {
        tracing::warn!(%a, %b, "no matching link record to remove");
    }

    Ok(())
}

async fn cmd_deploy(store: &Arc<EtcdStore>, image: &str, egress_interface: &str) -> Result<()> {
    let nodes = fetch_nodes(store).await?;
    let workers = fetch_workers(store).await?;

    let runner = SshRunner::new();
    let orchestrator = WorkerOrchestrator::new(runner, image.to_owned(), etcd_endpoint_csv(store))
        .with_egress_interface(egress_interface.to_owned());

    for worker in &workers {
        orchestrator.prepare_worker(worker, &workers).await?;
    }

    for node in &nodes {
        let worker = workers
            .iter()
            .find(|w| w.name == node.worker)
            .with_context(|| format!("node {} assigned to unknown worker {}", node.name, node.worker))?;
        orchestrator.deploy_node(worker, node).await?;
    }

    tracing::info!(nodes = nodes.len(), workers = workers.len(), "deploy complete");
    Ok(())
}

async fn cmd_rm(store: &Arc<EtcdStore>, remove_nodes: bool) -> Result<()> {
    let nodes = fetch_nodes(store).await?;
    let workers = fetch_workers(store).await?;

    let runner = SshRunner::new();
    let orchestrator = WorkerOrchestrator::new(runner, "unused", etcd_endpoint_csv(store));

    for worker in &workers {
        let on_worker: Vec<Node> = nodes.iter().filter(|n| n.worker == worker.name).cloned().collect();
        let summary = orchestrator.teardown_worker(worker, &on_worker).await;
        for (step, error) in &summary.failures {
            tracing::warn!(worker = %worker.name, %step, %error, "teardown step failed, continuing");
        }
    }

    let compiler = Compiler::new(store.clone()).await?;
    compiler.teardown(remove_nodes).await?;

    tracing::info!("rm complete");
    Ok(())
}

async fn cmd_cp(store: &Arc<EtcdStore>, node_name: &str, local_path: &PathBuf, remote_path: &str) -> Result<()> {
    let (node, worker) = find_node_and_worker(store, node_name).await?;
    let runner = SshRunner::new();
    docker_cp(&*runner, &worker, &node, local_path, remote_path).await
}

async fn cmd_cptype(store: &Arc<EtcdStore>, kind: &str, local_path: &PathBuf, remote_path: &str) -> Result<()> {
    let nodes = fetch_nodes(store).await?;
    let workers = fetch_workers(store).await?;
    let runner = SshRunner::new();

    for node in nodes.iter().filter(|n| n.kind == kind) {
        let worker = workers
            .iter()
            .find(|w| w.name == node.worker)
            .with_context(|| format!("node {} assigned to unknown worker {}", node.name, node.worker))?;
        docker_cp(&*runner, worker, node, local_path, remote_path).await?;
    }

    Ok(())
}

async fn cmd_exec(store: &Arc<EtcdStore>, node_name: &str, tty: bool, command: &[String]) -> Result<()> {
    let (node, worker) = find_node_and_worker(store, node_name).await?;
    let runner = SshRunner::new();
    let out = docker_exec(&*runner, &worker, &node, tty, command).await?;
    print!("{}", out.stdout);
    eprint!("{}", out.stderr);
    Ok(())
}

async fn cmd_exectype(store: &Arc<EtcdStore>, kind: &str, tty: bool, command: &[String]) -> Result<()> {
    let nodes = fetch_nodes(store).await?;
    let workers = fetch_workers(store).await?;
    let runner = SshRunner::new();

    for node in nodes.iter().filter(|n| n.kind == kind) {
        let worker = workers
            .iter()
            .find(|w| w.name == node.worker)
            .with_context(|| format!("node {} assigned to unknown worker {}", node.name, node.worker))?;
        let out = docker_exec(&*runner, worker, node, tty, command).await?;
        println!("== {} ==\n{}", node.name, out.stdout);
    }

    Ok(())
}

async fn cmd_stats(store: &Arc<EtcdStore>) -> Result<()> {
    let nodes = store.get_prefix(Keys::nodes_prefix()).await?.len();
    let workers = store.get_prefix(Keys::workers_prefix()).await?.len();
    let links = store.get_prefix(Keys::links_prefix()).await?.len();
    let run_batches = store.get_prefix(Keys::run_prefix()).await?.len();

    println!("nodes: {nodes}");
    println!("workers: {workers}");
    println!("links: {links}");
    println!("pending run batches: {run_batches}");
    Ok(())
}

async fn cmd_status(store: &Arc<EtcdStore>) -> Result<()> {
    for node in fetch_nodes(store).await? {
        let ip = node.eth0_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_owned());
        println!("{:<16} {:<12} {:<12} {}", node.name.to_string(), node.kind, node.worker, ip);
    }
    Ok(())
}

async fn docker_cp(
    runner: &SshRunner,
    worker: &Worker,
    node: &Node,
    local_path: &PathBuf,
    remote_path: &str,
) -> Result<()> {
    use netsat_orchestrator::RemoteRunner;

    let local = local_path.to_string_lossy().into_owned();
    let dest = format!("{}:{}", node.name, remote_path);
    runner.run(worker, "docker", &["cp", &local, &dest]).await?;
    Ok(())
}

async fn docker_exec(
    runner: &SshRunner,
    worker: &Worker,
    node: &Node,
    tty: bool,
    command: &[String],
) -> Result<netsat_command::CommandOutput> {
    use netsat_orchestrator::RemoteRunner;

    let mut args: Vec<&str> = vec!["exec"];
    if tty {
        args.push("-t");
    }
    let node_name = node.name.to_string();
    args.push(&node_name);
    for part in command {
        args.push(part);
    }

    runner.run(worker, "docker", &args).await
}

async fn find_node_and_worker(store: &Arc<EtcdStore>, node_name: &str) -> Result<(Node, Worker)> {
    let name: NodeName = node_name.parse().map_err(|_| CliError::Usage(format!("invalid node name {node_name}")))?;

    let value = store
        .get(&Keys::node(&name))
        .await?
        .ok_or_else(|| CliError::Usage(format!("no such node {node_name}")))?;
    let node: Node = serde_json::from_slice(&value).context("corrupt node record")?;

    let workers = fetch_workers(store).await?;
    let worker = workers
        .into_iter()
        .find(|w| w.name == node.worker)
        .with_context(|| format!("node {node_name} assigned to unknown worker {}", node.worker))?;

    Ok((node, worker))
}

async fn fetch_nodes(store: &Arc<EtcdStore>) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();
    for (_key, value) in store.get_prefix(Keys::nodes_prefix()).await? {
        nodes.push(serde_json::from_slice(&value).context("corrupt node record")?);
    }
    Ok(nodes)
}

async fn fetch_workers(store: &Arc<EtcdStore>) -> Result<Vec<Worker>> {
    let mut workers = Vec::new();
    for (_key, value) in store.get_prefix(Keys::workers_prefix()).await? {
        workers.push(serde_json::from_slice(&value).context("corrupt worker record")?);
    }
    Ok(workers)
}

fn etcd_endpoint_csv(_store: &Arc<EtcdStore>) -> String {
    // Containers connect to the store independently (`ETCD_ENDPOINT` env);
    // this is only a hint baked into `docker run`, not read back from here.
    std::env::var("ETCD_ENDPOINT").unwrap_or_default()
}
