use serde::{Deserialize, Serialize};

use super::types::{ClientId, HubInfo, OutboundMessage};

/// Messages sent from client to server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Forward `payload` to another member of the room
    Relay {
        remote_id: ClientId,
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// Ask for a snapshot of the room's members
    RoomInfo,
}

/// Messages sent from server to client
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once to a client right after it joins: everyone already in the room plus its own id
    ListClient {
        clients: Vec<ClientId>,
        self_client_id: ClientId,
    },

    /// Membership change of another client
    ClientEvent {
        remote_id: ClientId,
        event: ClientEvent,
    },

    /// Payload relayed from `remote_id`
    Relay {
        remote_id: ClientId,
        payload: serde_json::Value,
    },

    RoomInfo(HubInfo),

    /// Error response
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEvent {
    Leave,
}

impl ServerMessage {
    pub fn encode(&self) -> Result<OutboundMessage, serde_json::Error> {
        serde_json::to_string(self).map(OutboundMessage::from)
    }
}
