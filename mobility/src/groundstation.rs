//! §4.9: the ground-station side of the mobility protocol -- a UDP/IPv6
//! server that answers registration and handover requests with an SRv6 SID
//! list and, if configured, holds an HTB class throttled for the handover
//! delay before replying.

use crate::htb;
use crate::messages::{HandoverCommand, HandoverRequest, Message, RegistrationAccept, RegistrationRequest};
use crate::srv6::{self, Seg6Mode};
use crate::MAX_DATAGRAM_BYTES;
use anyhow::{Context as _, Result};
use netsat_command::CommandRunner;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Overlay MTU matches the VXLAN interfaces the link reconciler creates
/// (§4.5): this is the same dataplane, so the same bound applies.
const OVERLAY_MTU_BYTES: u32 = 1350;

pub struct GroundStation<C: CommandRunner> {
    command: Arc<C>,
    htb_ifname: String,
    handover_delay_ms: Option<f64>,
    /// Per-user-id htb class index, assigned on first sight and never
    /// reused, so flower filters accumulate rather than churn classids.
    peer_index: Mutex<HashMap<String, u32>>,
}

impl<C: CommandRunner> GroundStation<C> {
    pub fn new(command: Arc<C>, htb_ifname: impl Into<String>, handover_delay_ms: Option<f64>) -> Arc<Self> {
        Arc::new(Self {
            command,
            htb_ifname: htb_ifname.into(),
            handover_delay_ms,
            peer_index: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        htb::ensure_root_qdisc(self.command.as_ref(), &self.htb_ifname).await?;

        let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, crate::MOBILITY_PORT))
            .await
            .context("binding mobility UDP socket")?;

        let mut buf = [0u8; MAX_DATAGRAM_BYTES];

        loop {
            let (len, _from) = socket.recv_from(&mut buf).await.context("receiving mobility datagram")?;

            let message: Message = match serde_json::from_slice(&buf[..len]) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "discarding malformed mobility datagram");
                    continue;
                }
            };

            if let Err(e) = self.handle(&socket, message).await {
                tracing::warn!(error = %e, "failed to handle mobility request");
            }
        }
    }

    async fn handle(&self, socket: &UdpSocket, message: Message) -> Result<()> {
        match message {
            Message::RegistrationRequest(req) => self.handle_registration(socket, req).await,
            Message::HandoverRequest(req) => self.handle_handover(socket, req).await,
            other => {
                tracing::warn!(?other, "ground station received a non-request message, ignoring");
                Ok(())
            }
        }
    }

    async fn handle_registration(&self, socket: &UdpSocket, req: RegistrationRequest) -> Result<()> {
        let sid_list = vec![req.init_sat_ipv6];
        srv6::install_route(self.command.as_ref(), req.user_ipv6, Seg6Mode::Encap, &sid_list).await?;

        self.maybe_throttle(&req.user_id, req.user_ipv6).await?;

        let reply = Message::RegistrationAccept(RegistrationAccept { sid_list, txid: req.txid });
        self.reply(socket, req.user_ipv6, req.callback_port, &reply).await
    }

    async fn handle_handover(&self, socket: &UdpSocket, req: HandoverRequest) -> Result<()> {
        let sid_list = vec![req.new_sat_ipv6];
        srv6::install_route(self.command.as_ref(), req.user_ipv6, Seg6Mode::Encap, &sid_list).await?;

        self.maybe_throttle(&req.user_id, req.user_ipv6).await?;

        let reply = Message::HandoverCommand(HandoverCommand { sid_list, txid: req.txid });
        self.reply(socket, req.user_ipv6, req.callback_port, &reply).await
    }

    async fn maybe_throttle(&self, user_id: &str, user_ipv6: Ipv6Addr) -> Result<()> {
        let Some(delay_ms) = self.handover_delay_ms else {
            return Ok(());
        };

        let index = {
            let mut map = self.peer_index.lock();
            let next = map.len() as u32;
            *map.entry(user_id.to_owned()).or_insert(next)
        };

        let classid = htb::ensure_peer_class(self.command.as_ref(), &self.htb_ifname, index, user_ipv6).await?;
        htb::throttle_for_delay(self.command.as_ref(), &self.htb_ifname, &classid, OVERLAY_MTU_BYTES, delay_ms).await
    }

    async fn reply(&self, socket: &UdpSocket, user_ipv6: Ipv6Addr, callback_port: u16, message: &Message) -> Result<()> {
        let bytes = serde_json::to_vec(message).context("serializing mobility reply")?;
        anyhow::ensure!(bytes.len() <= MAX_DATAGRAM_BYTES, "mobility reply exceeds {MAX_DATAGRAM_BYTES} bytes");

        let dest: SocketAddr = SocketAddrV6::new(user_ipv6, callback_port, 0, 0).into();
        socket.send_to(&bytes, dest).await.context("sending mobility reply")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsat_command::{CommandOutput, RecordingCommandRunner};

    fn station(delay: Option<f64>) -> (Arc<GroundStation<RecordingCommandRunner>>, Arc<RecordingCommandRunner>) {
        let command = RecordingCommandRunner::new();
        let gs = GroundStation::new(command.clone(), "br1", delay);
        (gs, command)
    }

    #[tokio::test]
    async fn registration_installs_an_srv6_route_via_the_initial_satellite() {
        let (gs, command) = station(None);
        command.push_response(CommandOutput::ok("fd00:1::1 dev br1 src fd00:1::2"));

        let socket = UdpSocket::bind((Ipv6Addr::LOCALHOST, 0)).await.unwrap();
        let req = RegistrationRequest {
            user_id: "usr1".into(),
            user_ipv6: "fd00:9::1".parse().unwrap(),
            init_sat_ipv6: "fd00:1::1".parse().unwrap(),
            callback_port: socket.local_addr().unwrap().port(),
            txid: Some(1),
        };

        gs.handle_registration(&socket, req).await.unwrap();

        assert!(command.was_run(
            "ip",
            &["-6", "route", "replace", "fd00:9::1", "encap", "seg6", "mode", "encap", "segs", "fd00:1::1", "dev", "br1"],
        ));
    }

    #[tokio::test]
    async fn throttle_is_skipped_when_no_handover_delay_is_configured() {
        let (gs, command) = station(None);
        gs.maybe_throttle("usr1", "fd00:9::1".parse().unwrap()).await.unwrap();
        assert!(command.invocations().is_empty());
    }

    #[tokio::test]
    async fn throttle_assigns_a_stable_peer_class_index() {
        let (gs, command) = station(Some(1.0));
        command.push_response(CommandOutput::default());
        command.push_response(CommandOutput::default());
        command.push_response(CommandOutput::default());
        command.push_response(CommandOutput::default());
        gs.maybe_throttle("usr1", "fd00:9::1".parse().unwrap()).await.unwrap();
        assert!(command.was_run(
            "tc",
            &["filter", "replace", "dev", "br1", "parent", "1:", "protocol", "ipv6", "flower", "dst_ip", "fd00:9::1/128", "classid", "1:10"],
        ));
    }
}
