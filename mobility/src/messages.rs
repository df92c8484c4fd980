//! The UDP/IPv6 JSON wire format (§4.9, §6): single-datagram, ≤4096 bytes,
//! tagged by message kind so a socket reader can `serde_json::from_slice`
//! straight into [`Message`].

use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "registration_request")]
    RegistrationRequest(RegistrationRequest),
    #[serde(rename = "registration_accept")]
    RegistrationAccept(RegistrationAccept),
    #[serde(rename = "handover_request")]
    HandoverRequest(HandoverRequest),
    #[serde(rename = "handover_command")]
    HandoverCommand(HandoverCommand),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub user_id: String,
    pub user_ipv6: Ipv6Addr,
    pub init_sat_ipv6: Ipv6Addr,
    pub callback_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationAccept {
    pub sid_list: Vec<Ipv6Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoverRequest {
    pub user_id: String,
    pub user_ipv6: Ipv6Addr,
    pub new_sat_ipv6: Ipv6Addr,
    pub callback_port: u16,
    pub txid: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoverCommand {
    pub sid_list: Vec<Ipv6Addr>,
    pub txid: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_request_round_trips_through_json() {
        let req = Message::RegistrationRequest(RegistrationRequest {
            user_id: "usr1".into(),
            user_ipv6: "fd00::1".parse().unwrap(),
            init_sat_ipv6: "fd00::2".parse().unwrap(),
            callback_port: 6000,
            txid: Some(42),
        });

        let bytes = serde_json::to_vec(&req).unwrap();
        assert!(bytes.len() <= super::super::MAX_DATAGRAM_BYTES);

        let back: Message = serde_json::from_slice(&bytes).unwrap();
        match back {
            Message::RegistrationRequest(r) => assert_eq!(r.user_id, "usr1"),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
