use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::client::{ClientHandle, Delivery};
use super::messages::{ClientEvent, ServerMessage};
use super::registry::RegistryInner;
use super::types::{ClientId, HubInfo, Member, OutboundMessage, RoomId, SignalingError};
use crate::config::HubConfig;

/// Lifecycle submission, acknowledged once the hub has applied it
pub(crate) struct Rendezvous<T> {
    client: Arc<ClientHandle>,
    done: oneshot::Sender<T>,
}

/// Payload addressed to one member
pub(crate) struct Relay {
    to: ClientId,
    payload: OutboundMessage,
}

type Joined = Result<Vec<ClientId>, SignalingError>;
type InfoReply = oneshot::Sender<Option<HubInfo>>;

struct Inbox {
    register: mpsc::Receiver<Rendezvous<Joined>>,
    unregister: mpsc::Receiver<Rendezvous<()>>,
    relay: mpsc::Receiver<Relay>,
    info: mpsc::Receiver<InfoReply>,
}

struct Hub {
    id: RoomId,
    instance: u64,
    members: HashMap<ClientId, Arc<ClientHandle>>,
    config: HubConfig,
    registry: Weak<RegistryInner>,
}

/// Start the event loop for `room_id` and return a handle to it.
pub(crate) fn spawn(
    room_id: RoomId,
    instance: u64,
    config: &HubConfig,
    registry: Weak<RegistryInner>,
) -> HubHandle {
    let (handle, inbox) = channels(room_id.clone(), instance, config);
    let hub = Hub {
        id: room_id,
        instance,
        members: HashMap::new(),
        config: config.clone(),
        registry,
    };
    tokio::spawn(hub.run(inbox));
    handle
}

fn channels(room_id: RoomId, instance: u64, config: &HubConfig) -> (HubHandle, Inbox) {
    // capacity 1 + ack: submitters resume only after the hub applied the event
    let (register_tx, register) = mpsc::channel(1);
    let (unregister_tx, unregister) = mpsc::channel(1);
    let (relay_tx, relay) = mpsc::channel(config.relay_capacity.max(1));
    let (info_tx, info) = mpsc::channel(config.info_capacity.max(1));

    let handle = HubHandle {
        room_id,
        instance,
        register_tx,
        unregister_tx,
        relay_tx,
        info_tx,
    };
    let inbox = Inbox {
        register,
        unregister,
        relay,
        info,
    };
    (handle, inbox)
}

/// Hub whose loop is stepped by hand, so tests can stage submissions
/// before a teardown.
#[cfg(test)]
pub(crate) struct SteppedHub {
    hub: Hub,
    inbox: Inbox,
}

#[cfg(test)]
impl SteppedHub {
    pub(crate) fn new(room_id: RoomId, instance: u64) -> (Self, HubHandle) {
        let config = HubConfig::default();
        let (handle, inbox) = channels(room_id.clone(), instance, &config);
        let hub = Hub {
            id: room_id,
            instance,
            members: HashMap::new(),
            config,
            registry: Weak::new(),
        };
        (Self { hub, inbox }, handle)
    }

    /// Run the idle-teardown path as if the window had just elapsed.
    pub(crate) fn shutdown(&mut self) {
        self.hub.shutdown(&mut self.inbox);
    }
}

impl Hub {
    async fn run(mut self, mut inbox: Inbox) {
        let idle = tokio::time::sleep(self.config.register_idle);
        tokio::pin!(idle);

        info!(room = %self.id, "Hub started");

        loop {
            tokio::select! {
                Some(req) = inbox.register.recv() => {
                    idle.as_mut().reset(Instant::now() + self.config.register_idle);
                    let clients = self.register(req.client);
                    let _ = req.done.send(clients);
                }

                Some(req) = inbox.unregister.recv() => {
                    self.unregister(&req.client);
                    idle.as_mut().reset(Instant::now() + self.config.unregister_idle);
                    let _ = req.done.send(());
                }

                Some(relay) = inbox.relay.recv() => self.relay(relay),

                Some(reply) = inbox.info.recv() => {
                    let _ = reply.send(Some(self.snapshot()));
                }

                () = &mut idle => {
                    if !self.members.is_empty() {
                        idle.as_mut().reset(Instant::now() + self.config.register_idle);
                        continue;
                    }
                    self.shutdown(&mut inbox);
                    break;
                }
            }
        }

        info!(room = %self.id, "Hub closed");
    }

    fn register(&mut self, client: Arc<ClientHandle>) -> Joined {
        if let Err(room) = client.bind(&self.id, self.instance) {
            warn!(room = %self.id, client = %client.id(), current = %room, "Client already in another room, rejected");
            return Err(SignalingError::AlreadyJoined {
                client: client.id().clone(),
                room,
            });
        }

        let mut clients: Vec<ClientId> = self
            .members
            .keys()
            .filter(|id| *id != client.id())
            .cloned()
            .collect();
        clients.sort();

        let list = ServerMessage::ListClient {
            clients: clients.clone(),
            self_client_id: client.id().clone(),
        };
        match list.encode() {
            Ok(msg) => deliver(&self.id, &client, msg),
            Err(e) => warn!(room = %self.id, client = %client.id(), "Failed to encode client list: {}", e),
        }

        if let Some(previous) = self.members.insert(client.id().clone(), client.clone()) {
            if !Arc::ptr_eq(&previous, &client) {
                warn!(room = %self.id, client = %client.id(), "Duplicate client id, closing previous connection");
                previous.close();
                previous.unbind(&self.id, self.instance);
            }
        }

        info!(
            room = %self.id,
            client = %client.id(),
            members = self.members.len(),
            "Client registered"
        );
        Ok(clients)
    }

    fn unregister(&mut self, client: &Arc<ClientHandle>) {
        client.close();

        let is_member = self
            .members
            .get(client.id())
            .is_some_and(|member| Arc::ptr_eq(member, client));
        if !is_member {
            debug!(room = %self.id, client = %client.id(), "Unregister for non-member ignored");
            return;
        }
        self.members.remove(client.id());
        client.unbind(&self.id, self.instance);

        info!(
            room = %self.id,
            client = %client.id(),
            members = self.members.len(),
            "Client unregistered"
        );

        let leave = ServerMessage::ClientEvent {
            remote_id: client.id().clone(),
            event: ClientEvent::Leave,
        };
        match leave.encode() {
            Ok(msg) => {
                for member in self.members.values() {
                    deliver(&self.id, member, msg.clone());
                }
            }
            Err(e) => warn!(room = %self.id, client = %client.id(), "Failed to encode leave event: {}", e),
        }
    }

    fn relay(&self, relay: Relay) {
        match self.members.get(&relay.to) {
            Some(member) => deliver(&self.id, member, relay.payload),
            None => debug!(room = %self.id, to = %relay.to, "Relay target not in room, dropped"),
        }
    }

    fn snapshot(&self) -> HubInfo {
        let mut members: Vec<Member> = self
            .members
            .values()
            .map(|c| Member {
                id: c.id().clone(),
                addr: c.addr().clone(),
            })
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));

        HubInfo {
            id: self.id.clone(),
            members,
        }
    }

    fn shutdown(&mut self, inbox: &mut Inbox) {
        info!(room = %self.id, "Closing hub: no clients in room");

        for member in self.members.values() {
            member.notify_hub_closed();
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id, self.instance);
        }

        inbox.register.close();
        inbox.unregister.close();
        inbox.relay.close();
        inbox.info.close();

        // dropping a buffered rendezvous fails its submitter with HubClosed
        while inbox.register.try_recv().is_ok() {}
        while inbox.unregister.try_recv().is_ok() {}
        while let Ok(reply) = inbox.info.try_recv() {
            let _ = reply.send(None);
        }
    }
}

fn deliver(room: &RoomId, member: &ClientHandle, msg: OutboundMessage) {
    match member.deliver(msg) {
        Delivery::Queued => {}
        Delivery::DroppedNewest | Delivery::DroppedOldest => {
            debug!(room = %room, client = %member.id(), "Outbound queue full, message dropped")
        }
        Delivery::Disconnected => {
            warn!(room = %room, client = %member.id(), "Outbound queue full, disconnecting slow client")
        }
        Delivery::Closed => debug!(room = %room, client = %member.id(), "Client already closed"),
    }
}

/// Handle to communicate with a hub actor
#[derive(Clone)]
pub struct HubHandle {
    room_id: RoomId,
    instance: u64,
    register_tx: mpsc::Sender<Rendezvous<Joined>>,
    unregister_tx: mpsc::Sender<Rendezvous<()>>,
    relay_tx: mpsc::Sender<Relay>,
    info_tx: mpsc::Sender<InfoReply>,
}

impl HubHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    /// True once the hub's event loop has stopped
    pub fn is_closed(&self) -> bool {
        self.register_tx.is_closed()
    }

    /// Whether both handles point at the same hub instance
    pub fn same_hub(&self, other: &HubHandle) -> bool {
        self.register_tx.same_channel(&other.register_tx)
    }

    /// Join the room. Resolves after the hub has queued the client's
    /// `list_client` notification, with the ids of the members already present.
    /// A client that is a member of another hub is refused with `AlreadyJoined`.
    pub async fn register(&self, client: Arc<ClientHandle>) -> Result<Vec<ClientId>, SignalingError> {
        let (done, wait) = oneshot::channel();
        self.register_tx
            .send(Rendezvous { client, done })
            .await
            .map_err(|_| self.closed())?;
        wait.await.map_err(|_| self.closed())?
    }

    /// Leave the room. The client is closed and remaining members are told.
    pub async fn unregister(&self, client: Arc<ClientHandle>) -> Result<(), SignalingError> {
        let (done, wait) = oneshot::channel();
        self.unregister_tx
            .send(Rendezvous { client, done })
            .await
            .map_err(|_| self.closed())?;
        wait.await.map_err(|_| self.closed())
    }

    /// Forward `payload` verbatim to member `to`. Best effort: dropped when
    /// `to` is not in the room or the hub is gone.
    pub async fn relay(&self, to: ClientId, payload: impl Into<OutboundMessage>) {
        let relay = Relay {
            to,
            payload: payload.into(),
        };
        if self.relay_tx.send(relay).await.is_err() {
            debug!(room = %self.room_id, "Relay to closed hub dropped");
        }
    }

    /// Snapshot of the current members, `None` if the hub is shutting down.
    pub async fn info(&self) -> Option<HubInfo> {
        let (reply, wait) = oneshot::channel();
        self.info_tx.send(reply).await.ok()?;
        wait.await.ok().flatten()
    }

    fn closed(&self) -> SignalingError {
        SignalingError::HubClosed(self.room_id.clone())
    }
}

impl fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubHandle")
            .field("room_id", &self.room_id)
            .field("instance", &self.instance)
            .field("closed", &self.is_closed())
            .finish()
    }
}
