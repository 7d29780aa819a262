use std::fmt;
use std::net::SocketAddr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Bytes;

/// Signaling errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("hub for room {0} is closed")]
    HubClosed(RoomId),

    #[error("client {client} already belongs to room {room}")]
    AlreadyJoined { client: ClientId, room: RoomId },

    #[error("internal error: {0}")]
    Internal(String),
}

const CLIENT_ID_PREFIX: &str = "client_";
const CLIENT_ID_HEX_LEN: usize = 16;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Room id: opaque key into the hub registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Client id: unique within a hub ("client_" + 16 hex when generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let value: u64 = rng.random();

        let mut id = String::with_capacity(CLIENT_ID_PREFIX.len() + CLIENT_ID_HEX_LEN);
        id.push_str(CLIENT_ID_PREFIX);
        for i in 0..CLIENT_ID_HEX_LEN {
            let nibble = ((value >> (60 - i * 4)) & 0xF) as usize;
            id.push(HEX_CHARS[nibble] as char);
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Network kind and address of a client's transport, used for introspection only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportAddr {
    pub network: String,
    pub address: String,
}

impl TransportAddr {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new("tcp", addr.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: ClientId,
    pub addr: TransportAddr,
}

/// Point-in-time copy of a hub's membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubInfo {
    pub id: RoomId,
    pub members: Vec<Member>,
}

impl HubInfo {
    pub fn member_ids(&self) -> Vec<&ClientId> {
        self.members.iter().map(|m| &m.id).collect()
    }
}

/// Opaque payload queued for delivery to one client.
/// Cloning shares the underlying buffer, so broadcasts are O(1) per member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage(Bytes);

impl OutboundMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self(payload.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<Vec<u8>> for OutboundMessage {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<Bytes> for OutboundMessage {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_generate_has_correct_format() {
        let id = ClientId::generate();
        assert!(id.as_str().starts_with("client_"));
        assert_eq!(id.as_str().len(), 7 + 16);
        assert!(id.as_str()[7..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn client_ids_are_distinct() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn room_id_display() {
        let room = RoomId::from("r1");
        assert_eq!(format!("{}", room), "r1");
    }

    #[test]
    fn client_id_serializes_as_plain_string() {
        let id = ClientId::from("c1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"c1\"");
        let back: ClientId = serde_json::from_str("\"c1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn transport_addr_from_socket_addr() {
        let addr = TransportAddr::tcp("10.0.0.1:4000".parse().unwrap());
        assert_eq!(addr.network, "tcp");
        assert_eq!(addr.address, "10.0.0.1:4000");
    }

    #[test]
    fn hub_info_serialization() {
        let info = HubInfo {
            id: RoomId::from("r1"),
            members: vec![Member {
                id: ClientId::from("c1"),
                addr: TransportAddr::new("tcp", "127.0.0.1:5000"),
            }],
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "r1",
                "members": [
                    { "id": "c1", "addr": { "network": "tcp", "address": "127.0.0.1:5000" } }
                ]
            })
        );
    }

    #[test]
    fn outbound_message_keeps_bytes_verbatim() {
        let msg = OutboundMessage::from(vec![0u8, 159, 146, 150]);
        assert_eq!(msg.as_bytes(), &[0u8, 159, 146, 150]);
    }
}
