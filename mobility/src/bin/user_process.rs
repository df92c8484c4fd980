//! The user-side mobility client binary (§4.9): registers with a ground
//! station via the lowest-delay satellite link, then hands over as better
//! links appear.

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use netsat_command::SystemCommandRunner;
use netsat_mobility::user::UserProcess;
use netsat_model::NodeName;
use netsat_store::{EtcdStore, StoreAuth};
use std::net::Ipv6Addr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EligibilityMode {
    Default,
    Always,
}

#[derive(Debug, Parser)]
#[command(name = "netsat-user", about = "NetSatBench mobility user process")]
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

    #[arg(long, env = "USER_ID")]
    user_id: String,

    #[arg(long, env = "USER_IPV6")]
    user_ipv6: Ipv6Addr,

    #[arg(long, env = "GROUND_STATION_IPV6")]
    ground_station_ipv6: Ipv6Addr,

    #[arg(long, env = "CALLBACK_PORT", default_value_t = 6000)]
    callback_port: u16,

    #[arg(long, env = "EGRESS_INTERFACE", default_value = "eth0")]
    egress_interface: String,

    #[arg(long, env = "HANDOVER_DELAY_MS")]
    handover_delay_ms: Option<f64>,

    #[arg(long, env = "ELIGIBILITY_MODE", value_enum, default_value = "default")]
    eligibility_mode: EligibilityMode,

    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    netsat_logging::setup_global_subscriber("netsat_user=info", args.log_json)?;

    if let Err(e) = run(args).await {
        tracing::error!(error = %netsat_logging::err_with_src(&e), "user process exited with error");
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
    let command = Arc::new(SystemCommandRunner);

    let eligible = match args.eligibility_mode {
        EligibilityMode::Default => netsat_mobility::default_eligible,
        EligibilityMode::Always => netsat_mobility::always_eligible,
    };

    let process = UserProcess::new(
        store,
        command,
        self_name,
        args.user_id,
        args.user_ipv6,
        args.ground_station_ipv6,
        args.callback_port,
        args.egress_interface,
        args.handover_delay_ms,
        eligible,
    );

    process.run().await
}
