use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use super::hub::{self, HubHandle};
use super::types::RoomId;
use crate::config::HubConfig;

pub(crate) struct RegistryInner {
    hubs: Mutex<HashMap<RoomId, HubHandle>>,
    next_instance: AtomicU64,
    config: HubConfig,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<RoomId, HubHandle>> {
        self.hubs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by a hub tearing itself down. A newer hub for the same room is left alone.
    pub(crate) fn remove(&self, room_id: &RoomId, instance: u64) {
        let mut hubs = self.lock();
        if hubs.get(room_id).is_some_and(|hub| hub.instance() == instance) {
            hubs.remove(room_id);
            info!(room = %room_id, remaining = hubs.len(), "Hub removed from registry");
        }
    }
}

/// Room id to hub map. At most one live hub exists per room id.
///
/// Cloning is cheap and every clone sees the same hubs. Hubs hold only a weak
/// reference back, so dropping every clone stops new lookups but lets running
/// hubs finish on their own idle timers.
#[derive(Clone)]
pub struct HubRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for HubRegistry {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl HubRegistry {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                hubs: Mutex::new(HashMap::new()),
                next_instance: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Return the live hub for `room_id`, starting one if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn get_or_create(&self, room_id: &RoomId) -> HubHandle {
        let mut hubs = self.inner.lock();

        if let Some(hub) = hubs.get(room_id) {
            if !hub.is_closed() {
                return hub.clone();
            }
        }

        let instance = self.inner.next_instance.fetch_add(1, Ordering::Relaxed);
        let hub = hub::spawn(
            room_id.clone(),
            instance,
            &self.inner.config,
            Arc::downgrade(&self.inner),
        );
        hubs.insert(room_id.clone(), hub.clone());

        info!(room = %room_id, hubs = hubs.len(), "Hub created");
        hub
    }

    /// Whether a live hub currently exists for `room_id`
    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.inner
            .lock()
            .get(room_id)
            .is_some_and(|hub| !hub.is_closed())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Install `hub` as the entry for its room, replacing any other.
    #[cfg(test)]
    pub(crate) fn insert(&self, hub: HubHandle) {
        self.inner.lock().insert(hub.room_id().clone(), hub);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::signaling::client::{ClientHandle, OverflowPolicy};
    use crate::signaling::types::{ClientId, SignalingError, TransportAddr};

    fn client(id: &str) -> Arc<ClientHandle> {
        Arc::new(ClientHandle::new(
            ClientId::from(id),
            TransportAddr::new("tcp", "127.0.0.1:7000"),
            16,
            OverflowPolicy::Disconnect,
        ))
    }

    fn try_next(c: &ClientHandle) -> Option<Value> {
        c.outbound()
            .try_recv()
            .ok()
            .map(|m| serde_json::from_slice(m.as_bytes()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_create_returns_same_hub() {
        let registry = HubRegistry::default();
        let room = RoomId::from("r1");

        let a = registry.get_or_create(&room);
        let b = registry.get_or_create(&room);
        assert!(a.same_hub(&b));
        assert_eq!(registry.len(), 1);

        let other = registry.get_or_create(&RoomId::from("r2"));
        assert!(!a.same_hub(&other));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_creates_one_hub() {
        let registry = HubRegistry::default();
        let room = RoomId::from("contended");

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                let room = room.clone();
                tokio::spawn(async move { registry.get_or_create(&room) })
            })
            .collect();

        let mut hubs = Vec::new();
        for task in tasks {
            hubs.push(task.await.unwrap());
        }

        assert!(hubs.iter().all(|h| h.same_hub(&hubs[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn room_lifecycle_scenario() {
        let registry = HubRegistry::default();
        let room = RoomId::from("r1");
        let hub = registry.get_or_create(&room);

        let c1 = client("c1");
        hub.register(c1.clone()).await.unwrap();
        assert_eq!(
            try_next(&c1),
            Some(json!({"action": "list_client", "data": {"clients": [], "self_client_id": "c1"}}))
        );

        let c2 = client("c2");
        hub.register(c2.clone()).await.unwrap();
        assert_eq!(
            try_next(&c2),
            Some(json!({"action": "list_client", "data": {"clients": ["c1"], "self_client_id": "c2"}}))
        );
        assert_eq!(try_next(&c1), None);

        hub.unregister(c1.clone()).await.unwrap();
        assert_eq!(
            try_next(&c2),
            Some(json!({"action": "client_event", "data": {"remote_id": "c1", "event": "leave"}}))
        );

        hub.unregister(c2.clone()).await.unwrap();
        assert!(registry.contains(&room));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!registry.contains(&room));
        assert!(registry.is_empty());
        assert!(hub.is_closed());

        let fresh = registry.get_or_create(&room);
        assert!(!fresh.same_hub(&hub));
        assert!(fresh.info().await.unwrap().members.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_removal_keeps_newer_hub() {
        let registry = HubRegistry::default();
        let room = RoomId::from("r1");
        let hub = registry.get_or_create(&room);

        registry.inner.remove(&room, hub.instance() + 1);
        assert!(registry.contains(&room));

        registry.inner.remove(&room, hub.instance());
        assert!(!registry.contains(&room));
    }

    #[tokio::test(start_paused = true)]
    async fn client_cannot_join_two_rooms() {
        let registry = HubRegistry::default();
        let r1 = registry.get_or_create(&RoomId::from("r1"));
        let r2 = registry.get_or_create(&RoomId::from("r2"));

        let c1 = client("c1");
        r1.register(c1.clone()).await.unwrap();
        try_next(&c1);

        let refused = r2.register(c1.clone()).await;
        assert!(matches!(
            refused,
            Err(SignalingError::AlreadyJoined { ref client, ref room })
                if *client == ClientId::from("c1") && *room == RoomId::from("r1")
        ));
        assert!(r2.info().await.unwrap().members.is_empty());
        assert_eq!(r1.info().await.unwrap().member_ids(), vec![&ClientId::from("c1")]);
        // refused join sends nothing and leaves the client open
        assert_eq!(try_next(&c1), None);
        assert!(!c1.is_closed());
        assert_eq!(c1.room(), Some(RoomId::from("r1")));
    }

    #[tokio::test(start_paused = true)]
    async fn client_can_rejoin_its_own_room() {
        let registry = HubRegistry::default();
        let r1 = registry.get_or_create(&RoomId::from("r1"));

        let c1 = client("c1");
        r1.register(c1.clone()).await.unwrap();
        r1.register(c1.clone()).await.unwrap();

        assert!(!c1.is_closed());
        assert_eq!(r1.info().await.unwrap().members.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_windows_are_configurable() {
        let registry = HubRegistry::new(HubConfig {
            register_idle: Duration::from_secs(2),
            unregister_idle: Duration::from_millis(500),
            ..HubConfig::default()
        });
        let room = RoomId::from("quick");
        let hub = registry.get_or_create(&room);

        let c1 = client("c1");
        hub.register(c1.clone()).await.unwrap();
        hub.unregister(c1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!registry.contains(&room));
    }
}
