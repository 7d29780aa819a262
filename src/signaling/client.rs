use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_channel::TrySendError;
use tokio::sync::Notify;

use super::types::{ClientId, OutboundMessage, RoomId, TransportAddr};

/// What to do when a client's outbound queue is full.
///
/// The hub delivers through [`ClientHandle::deliver`], which never waits, so a
/// slow consumer can only ever lose its own messages or its own connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the message being delivered
    DropNewest,
    /// Discard the oldest queued message to make room
    DropOldest,
    /// Close the client; the transport drops the connection
    #[default]
    Disconnect,
}

/// Result of a single delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    DroppedNewest,
    DroppedOldest,
    Disconnected,
    /// The client was already closed
    Closed,
}

/// One connected peer, shared between its transport task and the hub.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    addr: TransportAddr,
    tx: async_channel::Sender<OutboundMessage>,
    // kept so DropOldest can evict from the sending side
    rx: async_channel::Receiver<OutboundMessage>,
    overflow: OverflowPolicy,
    terminate: Notify,
    hub_closed: AtomicBool,
    // hub (room, instance) this client is currently a member of
    joined: Mutex<Option<(RoomId, u64)>>,
}

impl ClientHandle {
    pub fn new(
        id: ClientId,
        addr: TransportAddr,
        capacity: usize,
        overflow: OverflowPolicy,
    ) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self {
            id,
            addr,
            tx,
            rx,
            overflow,
            terminate: Notify::new(),
            hub_closed: AtomicBool::new(false),
            joined: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn addr(&self) -> &TransportAddr {
        &self.addr
    }

    /// Receiving end of the outbound queue, drained by the transport.
    pub fn outbound(&self) -> async_channel::Receiver<OutboundMessage> {
        self.rx.clone()
    }

    /// Queue `msg` without waiting, applying the overflow policy when full.
    pub fn deliver(&self, msg: OutboundMessage) -> Delivery {
        let msg = match self.tx.try_send(msg) {
            Ok(()) => return Delivery::Queued,
            Err(TrySendError::Closed(_)) => return Delivery::Closed,
            Err(TrySendError::Full(msg)) => msg,
        };

        match self.overflow {
            OverflowPolicy::DropNewest => Delivery::DroppedNewest,
            OverflowPolicy::DropOldest => {
                let _ = self.rx.try_recv();
                match self.tx.try_send(msg) {
                    Ok(()) => Delivery::DroppedOldest,
                    Err(TrySendError::Closed(_)) => Delivery::Closed,
                    Err(TrySendError::Full(_)) => Delivery::DroppedNewest,
                }
            }
            OverflowPolicy::Disconnect => {
                self.close();
                Delivery::Disconnected
            }
        }
    }

    /// Close the outbound queue and wake the transport. Idempotent.
    pub fn close(&self) {
        if self.tx.close() {
            self.terminate.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Tell the transport that the room this client belongs to is gone.
    pub fn notify_hub_closed(&self) {
        self.hub_closed.store(true, Ordering::Release);
        self.terminate.notify_one();
    }

    pub fn hub_closed(&self) -> bool {
        self.hub_closed.load(Ordering::Acquire)
    }

    /// Room this client currently belongs to, if any.
    pub fn room(&self) -> Option<RoomId> {
        self.lock_joined().as_ref().map(|(room, _)| room.clone())
    }

    /// Claim membership in one hub instance. Re-joining the same hub is
    /// allowed; joining any other fails with the room already held.
    pub(crate) fn bind(&self, room_id: &RoomId, instance: u64) -> Result<(), RoomId> {
        let mut joined = self.lock_joined();
        match &*joined {
            Some((room, held)) if room != room_id || *held != instance => Err(room.clone()),
            _ => {
                *joined = Some((room_id.clone(), instance));
                Ok(())
            }
        }
    }

    /// Release membership, if still held by that hub instance.
    pub(crate) fn unbind(&self, room_id: &RoomId, instance: u64) {
        let mut joined = self.lock_joined();
        if joined
            .as_ref()
            .is_some_and(|(room, held)| room == room_id && *held == instance)
        {
            *joined = None;
        }
    }

    fn lock_joined(&self) -> MutexGuard<'_, Option<(RoomId, u64)>> {
        self.joined.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves once the client was closed or its hub shut down.
    pub async fn terminated(&self) {
        self.terminate.notified().await
    }
}
