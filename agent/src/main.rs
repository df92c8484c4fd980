//! The per-node agent binary: bootstraps the node (C4), then runs the link
//! reconciler (C5), runtime executor (C7) and `/etc/hosts` reconciler (C8)
//! concurrently against the store until the process is killed.

mod bootstrap;
mod context;
mod etchosts;
mod link_reconciler;
mod routing;
mod runtime_exec;

use anyhow::{Context as _, Result};
use clap::Parser;
use context::AgentContext;
use link_reconciler::LinkReconciler;
use netsat_command::SystemCommandRunner;
use netsat_model::{Keys, L3Config, Node, NodeName};
use netsat_store::{EtcdStore, StoreAuth};
use routing::RoutingAdapter;
use runtime_exec::RuntimeExecutor;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "netsat-agent", about = "NetSatBench per-node agent")]
struct Args {
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    #[arg(long, env = "ETCD_ENDPOINT", value_delimiter = ',')]
    etcd_endpoint: Vec<String>,

    #[arg(long, env = "ETCD_USER")]
    etcd_user: Option<String>,

    #[arg(long, env = "ETCD_PASSWORD")]
    etcd_password: Option<String>,

    #[arg(long, env = "ETCD_CA_CERT")]
    etcd_ca_cert: Option<String>,

    #[arg(long, env = "UPLINK_INTERFACE", default_value = "eth0")]
    uplink: String,

    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    netsat_logging::setup_global_subscriber("netsat_agent=info", args.log_json)?;

    if let Err(e) = run(args).await {
        tracing::error!(error = %netsat_logging::err_with_src(&e), "agent exited with error");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let self_name: NodeName = args.node_name.parse().context("invalid NODE_NAME")?;

    let ca_cert_pem = match &args.etcd_ca_cert {
        Some(path) => Some(tokio::fs::read(path).await.context("reading ETCD_CA_CERT")?),
        None => None,
    };

    let auth = StoreAuth {
        user: args.etcd_user,
        password: args.etcd_password,
        ca_cert_pem,
    };

    let store = Arc::new(EtcdStore::connect(args.etcd_endpoint.clone(), auth).await?);

    let node = fetch_self(&store, &self_name).await?;
    let l3_config = fetch_l3_config(&store).await?;

    let command = Arc::new(SystemCommandRunner);
    let ctx = Arc::new(AgentContext::new(store, command, self_name.clone(), node, l3_config));

    tracing::info!(node = %self_name, "starting bootstrap");

    let eth0_ip = bootstrap::discover_eth0_ip(&*ctx.command, &args.uplink).await;
    bootstrap::publish_eth0_ip(&ctx, eth0_ip).await?;

    let common_bridge_address = ctx.l3_config.read().common_bridge_address;
    bootstrap::create_bridges(&ctx, common_bridge_address).await?;

    let routing = Arc::new(RoutingAdapter::new(ctx.clone(), args.uplink.clone()));
    routing.configure().await?;

    let link_reconciler = Arc::new(LinkReconciler::new(ctx.clone(), args.uplink.clone(), routing));
    let runtime_executor = RuntimeExecutor::new(ctx.clone());
    let etchosts_reconciler = etchosts::EtcHostsReconciler::new(ctx.store.clone(), "/etc/hosts");

    tracing::info!(node = %self_name, "bootstrap complete, starting watchers");

    tokio::try_join!(
        link_reconciler.run(),
        runtime_executor.run(),
        etchosts_reconciler.run(),
    )?;

    Ok(())
}

async fn fetch_self(store: &EtcdStore, name: &NodeName) -> Result<Node> {
    use netsat_store::Store;

    let value = store
        .get(&Keys::node(name))
        .await?
        .with_context(|| format!("node record for {name} not found in store"))?;

    serde_json::from_slice(&value).context("corrupt node record")
}

async fn fetch_l3_config(store: &EtcdStore) -> Result<L3Config> {
    use netsat_store::Store;

    match store.get(Keys::l3_config()).await? {
        Some(value) => serde_json::from_slice(&value).context("corrupt L3 config"),
        None => Ok(L3Config::default()),
    }
}
