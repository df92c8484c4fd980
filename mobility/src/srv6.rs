//! §4.9: SRv6 route programming for the mobility data plane. Ground
//! stations and users both install `encap`/`inline` segment-routing routes
//! toward each other over the egress discovered from the kernel's own
//! routing table, rather than needing antenna/link-layer knowledge.

use anyhow::{Context as _, Result};
use netsat_command::CommandRunner;
use std::net::Ipv6Addr;

/// The IPv6 default route, as accepted by [`install_route`]'s `dst`.
pub const DEFAULT_ROUTE: &str = "::/0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seg6Mode {
    Encap,
    Inline,
}

impl Seg6Mode {
    fn as_str(self) -> &'static str {
        match self {
            Seg6Mode::Encap => "encap",
            Seg6Mode::Inline => "inline",
        }
    }
}

/// Installs `ip -6 route replace <dst> encap seg6 mode <mode> segs <sids>
/// dev <egress>`, discovering `egress` from `ip -6 route get <first-sid>`
/// rather than requiring the caller to know the outbound interface. `dst`
/// accepts either a bare host address or a CIDR such as `"::/0"`, so the
/// same helper installs both per-user host routes and default routes.
pub async fn install_route(
    command: &dyn CommandRunner,
    dst: impl std::fmt::Display,
    mode: Seg6Mode,
    sid_list: &[Ipv6Addr],
) -> Result<()> {
    let first_sid = sid_list.first().context("sid_list must not be empty")?;
    let egress = discover_egress(command, *first_sid)
        .await
        .with_context(|| format!("discovering egress device toward {first_sid}"))?;

    let dst = dst.to_string();
    let segs = sid_list.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(",");

    command
        .run_checked(
            "ip",
            &[
                "-6", "route", "replace", &dst, "encap", "seg6", "mode", mode.as_str(), "segs", &segs, "dev", &egress,
            ],
        )
        .await
        .with_context(|| format!("installing seg6 route to {dst} via {segs}"))?;

    Ok(())
}

/// Parses the `dev <name>` field out of `ip -6 route get <addr>`.
async fn discover_egress(command: &dyn CommandRunner, addr: Ipv6Addr) -> Result<String> {
    let out = command
        .run_checked("ip", &["-6", "route", "get", &addr.to_string()])
        .await?;

    out.stdout
        .split_whitespace()
        .collect::<Vec<_>>()
        .windows(2)
        .find(|w| w[0] == "dev")
        .map(|w| w[1].to_owned())
        .with_context(|| format!("no `dev` field in `ip -6 route get {addr}` output: {}", out.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsat_command::{CommandOutput, RecordingCommandRunner};

    #[tokio::test]
    async fn installs_an_encap_route_using_the_discovered_egress() {
        let command = RecordingCommandRunner::new();
        command.push_response(CommandOutput::ok(
            "fd00:2::1 dev vl_sat2_1 src fd00:1::1 metric 1024",
        ));

        let sids = vec!["fd00:2::1".parse().unwrap(), "fd00:3::1".parse().unwrap()];
        install_route(command.as_ref(), "2001:db8::user".parse().unwrap(), Seg6Mode::Encap, &sids)
            .await
            .unwrap();

        assert!(command.was_run(
            "ip",
            &[
                "-6", "route", "replace", "2001:db8::user", "encap", "seg6", "mode", "encap", "segs",
                "fd00:2::1,fd00:3::1", "dev", "vl_sat2_1",
            ],
        ));
    }

    #[tokio::test]
    async fn empty_sid_list_is_rejected() {
        let command = RecordingCommandRunner::new();
        let err = install_route(command.as_ref(), "2001:db8::user".parse().unwrap(), Seg6Mode::Inline, &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sid_list"));
    }
}
