//! The ground-station mobility server binary (§4.9): answers
//! registration/handover requests on UDP/IPv6 port 5005.

use anyhow::Result;
use clap::Parser;
use netsat_command::SystemCommandRunner;
use netsat_mobility::groundstation::GroundStation;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "netsat-ground-station", about = "NetSatBench mobility ground station")]
struct Args {
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Interface the per-user HTB classes are installed on; this is the
    /// node's overlay-facing egress, not the uplink.
    #[arg(long, env = "HTB_INTERFACE", default_value = "eth0")]
    htb_interface: String,

    #[arg(long, env = "HANDOVER_DELAY_MS")]
    handover_delay_ms: Option<f64>,

    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    netsat_logging::setup_global_subscriber("netsat_ground_station=info", args.log_json)?;

    tracing::info!(node = %args.node_name, port = netsat_mobility::MOBILITY_PORT, "starting ground station");

    let command = Arc::new(SystemCommandRunner);
    let station = GroundStation::new(command, args.htb_interface, args.handover_delay_ms);

    if let Err(e) = station.run().await {
        tracing::error!(error = %netsat_logging::err_with_src(&e), "ground station exited with error");
        std::process::exit(1);
    }

    Ok(())
}
