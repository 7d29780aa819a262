use super::types::RoomId;

/// Yes/no gate consulted during the WebSocket handshake, before a client may join a room.
pub trait Admission: Send + Sync + 'static {
    fn admit(&self, room_id: &RoomId, token: Option<&str>) -> bool;
}

/// Admits every client
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAdmission;

impl Admission for OpenAdmission {
    fn admit(&self, _room_id: &RoomId, _token: Option<&str>) -> bool {
        true
    }
}

/// Admits clients presenting one shared token
#[derive(Debug, Clone)]
pub struct TokenAdmission {
    token: String,
}

impl TokenAdmission {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Admission for TokenAdmission {
    fn admit(&self, _room_id: &RoomId, token: Option<&str>) -> bool {
        token.is_some_and(|t| t == self.token)
    }
}
