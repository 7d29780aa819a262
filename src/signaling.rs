//! WebSocket signaling hubs for P2P coordination

mod admission;
mod client;
mod hub;
mod messages;
mod registry;
mod server;
mod types;

pub use admission::{Admission, OpenAdmission, TokenAdmission};
pub use client::{ClientHandle, Delivery, OverflowPolicy};
pub use hub::HubHandle;
pub use messages::{ClientEvent, ClientMessage, ServerMessage};
pub use registry::HubRegistry;
pub use server::{DEFAULT_SIGNALING_PORT, SignalingServer};
pub use types::{ClientId, HubInfo, Member, OutboundMessage, RoomId, SignalingError, TransportAddr};
