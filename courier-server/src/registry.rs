//! Client Session Registry
//!
//! Maps user ids to the devices they are connected from. Temporary
//! (unauthenticated) ids and account ids share the same two-level structure;
//! a temporary id always has exactly one device slot, keyed `0`.
//!
//! The outer map is a `DashMap`, so structural changes are serialized per
//! shard rather than behind one global lock. Every mutation of a single
//! user's device set happens while holding that user's entry.

use std::collections::HashMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::client::{same_client, Client, ClientInfo, ClientRef};

/// Snapshot of one user's registered devices
///
/// Taken under the user's entry lock and released before it is returned;
/// later registry changes are not reflected.
#[derive(Clone, Default)]
pub struct DeviceSet {
    devices: HashMap<i64, ClientRef>,
}

impl DeviceSet {
    pub fn get(&self, device_id: i64) -> Option<&ClientRef> {
        self.devices.get(&device_id)
    }

    pub fn contains(&self, device_id: i64) -> bool {
        self.devices.contains_key(&device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &ClientRef)> {
        self.devices.iter().map(|(device, client)| (*device, client))
    }

    /// Registered device ids in ascending order
    pub fn device_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.devices.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSet")
            .field("devices", &self.device_ids())
            .finish()
    }
}

/// Result of binding a client into a slot
pub enum Claim {
    /// The client now occupies the slot
    Bound {
        /// Previous occupant, already handed to the eviction callback
        evicted: Option<ClientRef>,
        /// The user's other devices at bind time
        others: Vec<ClientRef>,
    },
    /// The slot already held this very client; nothing changed
    AlreadyBound,
}

/// Registry of live clients keyed by `(user_id, device_id)`
///
/// Thread-safe for concurrent access from every session task.
pub struct Registry {
    /// User id -> device id -> client
    users: DashMap<i64, HashMap<i64, ClientRef>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
        }
    }

    // ==================== Lookup ====================

    /// Devices registered for `user_id`, or `None` when there are none
    pub fn get(&self, user_id: i64) -> Option<DeviceSet> {
        let devices = self.users.get(&user_id)?;
        if devices.is_empty() {
            return None;
        }
        Some(DeviceSet {
            devices: devices.value().clone(),
        })
    }

    /// The client in slot `(user_id, device_id)`
    pub fn get_device(&self, user_id: i64, device_id: i64) -> Option<ClientRef> {
        self.users.get(&user_id)?.get(&device_id).cloned()
    }

    /// Number of user entries (temporary and permanent)
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Number of occupied slots across all users
    pub fn client_count(&self) -> usize {
        self.users.iter().map(|entry| entry.value().len()).sum()
    }

    /// Info for up to `count` users, one device each, skipping user ids
    /// for which `skip` returns true
    pub fn sample(&self, count: usize, skip: impl Fn(i64) -> bool) -> Vec<ClientInfo> {
        self.users
            .iter()
            .filter(|entry| !skip(*entry.key()))
            .filter_map(|entry| entry.value().values().next().map(|client| client.info()))
            .take(count)
            .collect()
    }

    // ==================== Mutation ====================

    /// Put `client` in slot `(user_id, device_id)`, creating the user entry
    /// if needed. Returns the previous occupant.
    pub fn add(&self, user_id: i64, device_id: i64, client: ClientRef) -> Option<ClientRef> {
        let replaced = self
            .users
            .entry(user_id)
            .or_default()
            .insert(device_id, client);
        debug!("Registered {}/{}", user_id, device_id);
        replaced
    }

    /// Remove slot `(user_id, device_id)`; the user entry goes with its
    /// last device
    pub fn delete(&self, user_id: i64, device_id: i64) -> Option<ClientRef> {
        self.delete_if(user_id, device_id, |_| true)
    }

    /// Remove slot `(user_id, device_id)` only if `pred` accepts its occupant
    pub fn delete_if(
        &self,
        user_id: i64,
        device_id: i64,
        pred: impl FnOnce(&ClientRef) -> bool,
    ) -> Option<ClientRef> {
        let Entry::Occupied(mut entry) = self.users.entry(user_id) else {
            return None;
        };

        if !entry.get().get(&device_id).is_some_and(pred) {
            return None;
        }

        let removed = entry.get_mut().remove(&device_id);
        if entry.get().is_empty() {
            entry.remove();
        }
        debug!("Unregistered {}/{}", user_id, device_id);
        removed
    }

    /// Bind `client` into `(user_id, device_id)` atomically with respect to
    /// every other mutation of `user_id`.
    ///
    /// A different client already in the slot is removed and passed to
    /// `evict` before `client` is inserted, so the slot never resolves to
    /// two clients. `evict` runs under the user's entry lock and must not
    /// call back into the registry.
    pub fn claim(
        &self,
        user_id: i64,
        device_id: i64,
        client: ClientRef,
        evict: impl FnOnce(&ClientRef),
    ) -> Claim {
        let mut devices = self.users.entry(user_id).or_default();

        if devices
            .get(&device_id)
            .is_some_and(|existing| same_client(existing, &client))
        {
            return Claim::AlreadyBound;
        }

        let evicted = devices.remove(&device_id);
        if let Some(existing) = &evicted {
            evict(existing);
        }

        let others = devices.values().cloned().collect();
        devices.insert(device_id, client);

        Claim::Bound { evicted, others }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("user_count", &self.users.len())
            .field("client_count", &self.client_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockClient;
    use std::sync::Arc;

    fn client() -> ClientRef {
        MockClient::new()
    }

    // ==================== Core Structure Tests ====================

    #[test]
    fn test_registry_new() {
        let registry = Registry::new();
        assert_eq!(registry.len(), 0);
        assert!(registry.is_empty());
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn test_registry_debug() {
        let registry = Registry::new();
        registry.add(1, 1, client());
        let debug = format!("{:?}", registry);
        assert!(debug.contains("user_count: 1"));
        assert!(debug.contains("client_count: 1"));
    }

    // ==================== Add / Get Tests ====================

    #[test]
    fn test_add_and_get() {
        let registry = Registry::new();
        let c = client();
        assert!(registry.add(5001, 1, c.clone()).is_none());

        let devices = registry.get(5001).unwrap();
        assert_eq!(devices.len(), 1);
        assert!(same_client(devices.get(1).unwrap(), &c));
        assert!(same_client(&registry.get_device(5001, 1).unwrap(), &c));
    }

    #[test]
    fn test_get_missing_user() {
        let registry = Registry::new();
        assert!(registry.get(42).is_none());
        assert!(registry.get_device(42, 0).is_none());
    }

    #[test]
    fn test_add_multiple_devices() {
        let registry = Registry::new();
        registry.add(5001, 1, client());
        registry.add(5001, 2, client());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.client_count(), 2);
        assert_eq!(registry.get(5001).unwrap().device_ids(), vec![1, 2]);
    }

    #[test]
    fn test_add_replaces_occupant() {
        let registry = Registry::new();
        let first = client();
        let second = client();
        registry.add(5001, 1, first.clone());

        let replaced = registry.add(5001, 1, second.clone()).unwrap();
        assert!(same_client(&replaced, &first));
        assert!(same_client(&registry.get_device(5001, 1).unwrap(), &second));
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let registry = Registry::new();
        registry.add(5001, 1, client());
        let snapshot = registry.get(5001).unwrap();

        registry.add(5001, 2, client());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.get(5001).unwrap().len(), 2);
    }

    // ==================== Delete Tests ====================

    #[test]
    fn test_delete_last_device_drops_user() {
        let registry = Registry::new();
        registry.add(5001, 1, client());

        assert!(registry.delete(5001, 1).is_some());
        assert!(registry.get(5001).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_delete_keeps_other_devices() {
        let registry = Registry::new();
        registry.add(5001, 1, client());
        registry.add(5001, 2, client());

        registry.delete(5001, 1);
        assert_eq!(registry.get(5001).unwrap().device_ids(), vec![2]);
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let registry = Registry::new();
        registry.add(5001, 1, client());

        assert!(registry.delete(5001, 9).is_none());
        assert!(registry.delete(777, 1).is_none());
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn test_delete_missing_device_does_not_create_entry() {
        let registry = Registry::new();
        assert!(registry.delete(5001, 1).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_delete_if_checks_occupant() {
        let registry = Registry::new();
        let owner = client();
        let stranger = client();
        registry.add(5001, 1, owner.clone());

        assert!(registry
            .delete_if(5001, 1, |c| same_client(c, &stranger))
            .is_none());
        assert!(registry.get_device(5001, 1).is_some());

        assert!(registry
            .delete_if(5001, 1, |c| same_client(c, &owner))
            .is_some());
        assert!(registry.get(5001).is_none());
    }

    // ==================== Claim Tests ====================

    #[test]
    fn test_claim_empty_slot() {
        let registry = Registry::new();
        let c = client();

        match registry.claim(5001, 1, c.clone(), |_| panic!("nothing to evict")) {
            Claim::Bound { evicted, others } => {
                assert!(evicted.is_none());
                assert!(others.is_empty());
            }
            Claim::AlreadyBound => panic!("slot was empty"),
        }
        assert!(same_client(&registry.get_device(5001, 1).unwrap(), &c));
    }

    #[test]
    fn test_claim_evicts_occupant_before_insert() {
        let registry = Registry::new();
        let old = MockClient::new();
        let new = client();
        registry.add(5001, 1, old.clone());

        let mut seen = None;
        let claim = registry.claim(5001, 1, new.clone(), |existing| {
            existing.set_identity(999, 0);
            seen = Some(existing.clone());
        });

        let Claim::Bound { evicted, others } = claim else {
            panic!("expected bind");
        };
        let evicted = evicted.unwrap();
        assert!(same_client(&evicted, &seen.unwrap()));
        assert_eq!(old.identity().user_id, 999);
        assert!(others.is_empty());
        assert!(same_client(&registry.get_device(5001, 1).unwrap(), &new));
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn test_claim_reports_other_devices() {
        let registry = Registry::new();
        let phone = client();
        registry.add(5001, 2, phone.clone());

        let Claim::Bound { others, .. } = registry.claim(5001, 1, client(), |_| {}) else {
            panic!("expected bind");
        };
        assert_eq!(others.len(), 1);
        assert!(same_client(&others[0], &phone));
    }

    #[test]
    fn test_claim_same_client_is_noop() {
        let registry = Registry::new();
        let c = client();
        registry.add(5001, 1, c.clone());

        assert!(matches!(
            registry.claim(5001, 1, c, |_| panic!("must not evict itself")),
            Claim::AlreadyBound
        ));
        assert_eq!(registry.client_count(), 1);
    }

    // ==================== Sample Tests ====================

    #[test]
    fn test_sample_one_per_user_and_skips() {
        let registry = Registry::new();
        for user in [1, 2, 3] {
            let c = MockClient::new();
            c.set_identity(user, 1);
            registry.add(user, 1, c);
        }
        let extra = MockClient::new();
        extra.set_identity(1, 2);
        registry.add(1, 2, extra);

        let all = registry.sample(10, |_| false);
        assert_eq!(all.len(), 3);

        let filtered = registry.sample(10, |id| id == 2);
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|info| info.user_id != 2));

        assert_eq!(registry.sample(1, |_| false).len(), 1);
        assert!(registry.sample(0, |_| false).is_empty());
    }

    // ==================== Concurrency Tests ====================

    #[tokio::test]
    async fn test_concurrent_claims_leave_one_occupant() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let c = MockClient::new();
                let evicted = match registry.claim(5001, 1, c.clone(), |old| old.request_close()) {
                    Claim::Bound { evicted, .. } => evicted.is_some(),
                    Claim::AlreadyBound => false,
                };
                (c, evicted)
            }));
        }

        let mut evictions = 0;
        let mut clients = Vec::new();
        for handle in handles {
            let (c, evicted) = handle.await.unwrap();
            if evicted {
                evictions += 1;
            }
            clients.push(c);
        }

        assert_eq!(registry.client_count(), 1);
        assert_eq!(evictions, 15);
        // Exactly the occupant survived
        let open: Vec<_> = clients.iter().filter(|c| !c.is_closed()).collect();
        assert_eq!(open.len(), 1);
        let occupant = registry.get_device(5001, 1).unwrap();
        let open_ref: ClientRef = open[0].clone();
        assert!(same_client(&occupant, &open_ref));
    }

    #[tokio::test]
    async fn test_concurrent_add_delete() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();

        for user in 0..10i64 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                for device in 0..20 {
                    registry.add(user, device, MockClient::new());
                }
                for device in 0..20 {
                    registry.delete(user, device);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(registry.is_empty());
        assert_eq!(registry.client_count(), 0);
    }
}
