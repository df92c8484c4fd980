//! §4.9: the user-side mobility client. Picks the lowest-delay link at
//! startup, registers with the ground station, then watches the links
//! prefix for a cheaper satellite and hands over to it.

use crate::fsm::{UserEvent, UserState};
use crate::htb;
use crate::messages::{HandoverRequest, Message, RegistrationRequest};
use crate::srv6::{self, Seg6Mode, DEFAULT_ROUTE};
use crate::MAX_DATAGRAM_BYTES;
use anyhow::{Context as _, Result};
use chrono::Utc;
use futures::StreamExt;
use netsat_command::CommandRunner;
use netsat_model::{Keys, Link, Node, NodeName};
use netsat_store::{EventKind, Store, WatchItem};
use parking_lot::Mutex;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(1);
const HANDOVER_TIMEOUT: Duration = Duration::from_secs(1);

/// Matches the VXLAN MTU used elsewhere (§4.5): the handover HTB throttle
/// shapes the same dataplane.
const OVERLAY_MTU_BYTES: u32 = 1350;

#[derive(Debug, Clone)]
struct CurrentLink {
    link_key: String,
    peer: NodeName,
    peer_antenna: u32,
    delay_ms: f64,
}

pub struct UserProcess<S: Store, C: CommandRunner> {
    store: Arc<S>,
    command: Arc<C>,
    self_name: NodeName,
    user_id: String,
    user_ipv6: Ipv6Addr,
    ground_station_ipv6: Ipv6Addr,
    callback_port: u16,
    egress_ifname: String,
    handover_delay_ms: Option<f64>,
    eligible: fn(f64, f64) -> bool,
    state: Mutex<UserState>,
    current: Mutex<Option<CurrentLink>>,
    pending_txid: Mutex<Option<i64>>,
    timeout_deadline: Mutex<Option<Instant>>,
}

impl<S: Store, C: CommandRunner> UserProcess<S, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        command: Arc<C>,
        self_name: NodeName,
        user_id: impl Into<String>,
        user_ipv6: Ipv6Addr,
        ground_station_ipv6: Ipv6Addr,
        callback_port: u16,
        egress_ifname: impl Into<String>,
        handover_delay_ms: Option<f64>,
        eligible: fn(f64, f64) -> bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            command,
            self_name,
            user_id: user_id.into(),
            user_ipv6,
            ground_station_ipv6,
            callback_port,
            egress_ifname: egress_ifname.into(),
            handover_delay_ms,
            eligible,
            state: Mutex::new(UserState::NotRegistered),
            current: Mutex::new(None),
            pending_txid: Mutex::new(None),
            timeout_deadline: Mutex::new(None),
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, self.callback_port))
            .await
            .context("binding mobility callback socket")?;

        if let Some(candidate) = self.scan_for_best_link().await {
            self.begin_registration(&socket, candidate).await;
        }

        // Full prefix, not a self-scoped one: `Keys::link` sorts endpoints
        // lexicographically, so a node that never sorts first (e.g. any
        // `usr*` node against a `sat*`/`grd*` peer) would never see its own
        // links PUT/DELETE. `on_link_put`/`on_link_delete` filter locally.
        let prefix = Keys::links_prefix();
        let mut stream = self.store.watch_prefix(prefix);
        let mut buf = [0u8; MAX_DATAGRAM_BYTES];

        loop {
            let deadline = *self.timeout_deadline.lock();

            tokio::select! {
                recv = socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, _from)) => self.handle_datagram(&socket, &buf[..len]).await,
                        Err(e) => tracing::warn!(error = %e, "mobility recv failed"),
                    }
                }
                item = stream.next() => {
                    match item {
                        Some(WatchItem::Event(ev)) => self.handle_link_event(&socket, ev.kind, &ev.key, ev.value).await,
                        Some(WatchItem::Resync) => self.handle_resync(&socket).await,
                        None => return Ok(()),
                    }
                }
                _ = wait_for(deadline) => self.handle_timeout(&socket).await,
            }
        }
    }

    async fn handle_datagram(&self, socket: &UdpSocket, bytes: &[u8]) {
        let message: Message = match serde_json::from_slice(bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed mobility datagram");
                return;
            }
        };

        let result = match message {
            Message::RegistrationAccept(accept) => self.on_registration_accept(accept.txid, accept.sid_list).await,
            Message::HandoverCommand(cmd) => self.on_handover_command(socket, cmd.txid, cmd.sid_list).await,
            other => {
                tracing::warn!(?other, "user received an unexpected mobility message, ignoring");
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to apply mobility reply");
        }
    }

    async fn on_registration_accept(&self, txid: Option<i64>, sid_list: Vec<Ipv6Addr>) -> Result<()> {
        if *self.state.lock() != UserState::RegistrationInProgress || !self.txid_matches(txid) {
            return Ok(());
        }

        self.apply_default_route(&sid_list).await?;
        self.clear_timer();
        self.transition(UserEvent::RegistrationAccepted);
        Ok(())
    }

    async fn on_handover_command(&self, _socket: &UdpSocket, txid: i64, sid_list: Vec<Ipv6Addr>) -> Result<()> {
        if *self.state.lock() != UserState::HandoverInProgress || !self.txid_matches(Some(txid)) {
            return Ok(());
        }

        if let Some(delay_ms) = self.handover_delay_ms {
            let classid = htb::ensure_peer_class(self.command.as_ref(), &self.egress_ifname, 0, self.ground_station_ipv6).await?;
            htb::throttle_for_delay(self.command.as_ref(), &self.egress_ifname, &classid, OVERLAY_MTU_BYTES, delay_ms).await?;
        }

        self.apply_default_route(&sid_list).await?;
        self.clear_timer();
        self.transition(UserEvent::HandoverCommandReceived);
        Ok(())
    }

    async fn apply_default_route(&self, sid_list: &[Ipv6Addr]) -> Result<()> {
        srv6::install_route(self.command.as_ref(), DEFAULT_ROUTE, Seg6Mode::Encap, sid_list).await
    }

    async fn handle_link_event(&self, socket: &UdpSocket, kind: EventKind, key: &str, value: Option<Vec<u8>>) {
        match kind {
            EventKind::Put => {
                let Some(value) = value else { return };
                let Ok(link) = serde_json::from_slice::<Link>(&value) else {
                    tracing::warn!(key, "corrupt link record, skipping");
                    return;
                };
                self.on_link_put(socket, key, &link).await;
            }
            EventKind::Delete => self.on_link_delete(socket, key).await,
        }
    }

    async fn on_link_put(&self, socket: &UdpSocket, key: &str, link: &Link) {
        let Some((_self_antenna, peer, peer_antenna)) = link.peer_of(&self.self_name) else {
            return;
        };

        let delay_ms = link.shaping.delay_ms().unwrap_or(f64::INFINITY);
        let candidate = CurrentLink {
            link_key: key.to_owned(),
            peer: peer.clone(),
            peer_antenna,
            delay_ms,
        };

        let state = *self.state.lock();
        match state {
            UserState::NotRegistered => {
                self.begin_registration(socket, candidate).await;
            }
            UserState::Registered => {
                let current_delay = self.current.lock().as_ref().map(|c| c.delay_ms).unwrap_or(f64::INFINITY);
                if (self.eligible)(current_delay, delay_ms) {
                    self.begin_handover(socket, candidate).await;
                }
            }
            _ => {}
        }
    }

    async fn on_link_delete(&self, socket: &UdpSocket, key: &str) {
        let is_current = self.current.lock().as_ref().map(|c| c.link_key == key).unwrap_or(false);
        if !is_current {
            return;
        }

        *self.current.lock() = None;
        self.clear_timer();
        self.set_state(UserState::NotRegistered);

        if let Some(candidate) = self.scan_for_best_link().await {
            self.begin_registration(socket, candidate).await;
        }
    }

    async fn handle_resync(&self, socket: &UdpSocket) {
        if *self.state.lock() != UserState::NotRegistered {
            return;
        }

        if let Some(candidate) = self.scan_for_best_link().await {
            self.begin_registration(socket, candidate).await;
        }
    }

    async fn handle_timeout(&self, socket: &UdpSocket) {
        self.clear_timer();

        let state = *self.state.lock();
        match state {
            UserState::RegistrationInProgress => {
                self.transition(UserEvent::RegistrationTimedOut);
                if let Some(candidate) = self.scan_for_best_link().await {
                    self.begin_registration(socket, candidate).await;
                }
            }
            UserState::HandoverInProgress => {
                self.transition(UserEvent::HandoverTimedOut);
            }
            _ => {}
        }
    }

    /// §4.9 "on startup, scans the links prefix for candidates touching
    /// self": a full scan of `Keys::links_prefix()`, since `Keys::link`
    /// canonicalizes on the lexicographically smaller endpoint and a
    /// self-scoped prefix would miss links where this node sorts second.
    async fn scan_for_best_link(&self) -> Option<CurrentLink> {
        let all = self.store.get_prefix(Keys::links_prefix()).await.ok()?;

        all.into_iter()
            .filter_map(|(key, value)| {
                let link: Link = serde_json::from_slice(&value).ok()?;
                let (_self_antenna, peer, peer_antenna) = link.peer_of(&self.self_name)?;
                let delay_ms = link.shaping.delay_ms().unwrap_or(f64::INFINITY);
                Some(CurrentLink { link_key: key, peer: peer.clone(), peer_antenna, delay_ms })
            })
            .min_by(|a, b| a.delay_ms.total_cmp(&b.delay_ms))
    }

    async fn begin_registration(&self, socket: &UdpSocket, candidate: CurrentLink) {
        let Some(peer_addr) = self.resolve_peer_overlay_addr(&candidate.peer, candidate.peer_antenna).await else {
            tracing::warn!(peer = %candidate.peer, "could not resolve peer overlay address, registration deferred");
            return;
        };

        if let Err(e) = srv6::install_route(
            self.command.as_ref(),
            self.ground_station_ipv6,
            Seg6Mode::Encap,
            &[peer_addr],
        )
        .await
        {
            tracing::warn!(error = %e, "failed to install temporary route to ground station");
            return;
        }

        let txid = Utc::now().timestamp_millis();
        let request = Message::RegistrationRequest(RegistrationRequest {
            user_id: self.user_id.clone(),
            user_ipv6: self.user_ipv6,
            init_sat_ipv6: peer_addr,
            callback_port: self.callback_port,
            txid: Some(txid),
        });

        if let Err(e) = self.send(socket, &request).await {
            tracing::warn!(error = %e, "failed to send registration_request");
            return;
        }

        *self.pending_txid.lock() = Some(txid);
        *self.current.lock() = Some(candidate);
        self.set_state(UserState::RegistrationInProgress);
        self.start_timer(REGISTRATION_TIMEOUT);
    }

    async fn begin_handover(&self, socket: &UdpSocket, candidate: CurrentLink) {
        let Some(peer_addr) = self.resolve_peer_overlay_addr(&candidate.peer, candidate.peer_antenna).await else {
            tracing::warn!(peer = %candidate.peer, "could not resolve handover target overlay address");
            return;
        };

        let txid = Utc::now().timestamp_millis();
        let request = Message::HandoverRequest(HandoverRequest {
            user_id: self.user_id.clone(),
            user_ipv6: self.user_ipv6,
            new_sat_ipv6: peer_addr,
            callback_port: self.callback_port,
            txid,
        });

        if let Err(e) = self.send(socket, &request).await {
            tracing::warn!(error = %e, "failed to send handover_request");
            return;
        }

        *self.pending_txid.lock() = Some(txid);
        *self.current.lock() = Some(candidate);
        self.set_state(UserState::HandoverInProgress);
        self.start_timer(HANDOVER_TIMEOUT);
    }

    async fn send(&self, socket: &UdpSocket, message: &Message) -> Result<()> {
        let bytes = serde_json::to_vec(message).context("serializing mobility message")?;
        anyhow::ensure!(bytes.len() <= MAX_DATAGRAM_BYTES, "mobility message exceeds {MAX_DATAGRAM_BYTES} bytes");
        socket
            .send_to(&bytes, (self.ground_station_ipv6, crate::MOBILITY_PORT))
            .await
            .context("sending mobility message")?;
        Ok(())
    }

    async fn resolve_peer_overlay_addr(&self, peer: &NodeName, peer_antenna: u32) -> Option<Ipv6Addr> {
        let value = self.store.get(&Keys::node(peer)).await.ok()??;
        let node: Node = serde_json::from_slice(&value).ok()?;
        let subnet = node.subnet_v6?;
        let (bridges, _loopback) = netsat_net::bridge_and_loopback_v6(subnet, node.antennas)?;
        bridges.get((peer_antenna - 1) as usize).copied()
    }

    fn txid_matches(&self, txid: Option<i64>) -> bool {
        *self.pending_txid.lock() == txid
    }

    fn set_state(&self, state: UserState) {
        *self.state.lock() = state;
    }

    fn transition(&self, event: UserEvent) {
        let mut state = self.state.lock();
        if let Some(next) = state.on_event(event) {
            *state = next;
        }
    }

    fn start_timer(&self, duration: Duration) {
        *self.timeout_deadline.lock() = Some(Instant::now() + duration);
    }

    fn clear_timer(&self) {
        *self.timeout_deadline.lock() = None;
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsat_command::RecordingCommandRunner;
    use netsat_store::MemoryStore;

    fn process() -> Arc<UserProcess<MemoryStore, RecordingCommandRunner>> {
        let store = MemoryStore::new();
        let command = RecordingCommandRunner::new();
        UserProcess::new(
            store,
            command,
            NodeName::from("usr1"),
            "usr1",
            "fd00:9::1".parse().unwrap(),
            "fd00:5::1".parse().unwrap(),
            6000,
            "eth0",
            None,
            crate::default_eligible,
        )
    }

    #[test]
    fn starts_not_registered() {
        let p = process();
        assert_eq!(*p.state.lock(), UserState::NotRegistered);
    }

    #[test]
    fn registration_accept_is_ignored_without_a_matching_txid() {
        let p = process();
        p.set_state(UserState::RegistrationInProgress);
        *p.pending_txid.lock() = Some(1);
        assert!(!p.txid_matches(Some(2)));
    }

    #[test]
    fn eligibility_predicate_defaults_to_five_ms_margin() {
        assert!(crate::default_eligible(30.0, 10.0));
        assert!(!crate::default_eligible(30.0, 28.0));
    }
}
