//! In-process device registry.
//!
//! [`MemoryStore`] keeps users, devices, networks, and memberships in
//! `parking_lot`-guarded maps. It backs the test suites and single-node
//! deployments that load their topology from a JSON seed file.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tether_proto::{Device, DeviceId, Network, NetworkId, User, UserId};

use crate::error::{Result, StoreError};
use crate::{Store, overlay};

/// Attempts at drawing a free overlay address before giving up.
const MAX_ALLOCATION_ATTEMPTS: usize = 64;

/// A network membership row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// Network joined.
    pub network: NetworkId,
    /// Member device.
    pub device: DeviceId,
}

/// Initial registry contents, read from JSON.
///
/// Unknown top-level keys are ignored so that the same file can carry
/// sections meant for other components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Seed {
    /// Users.
    #[serde(default)]
    pub users: Vec<User>,
    /// Devices, with their overlay addresses already assigned.
    #[serde(default)]
    pub devices: Vec<Device>,
    /// Networks.
    #[serde(default)]
    pub networks: Vec<Network>,
    /// Memberships.
    #[serde(default)]
    pub memberships: Vec<Membership>,
}

impl Seed {
    /// Parse a seed from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StoreError::Seed(e.to_string()))
    }

    /// Read a seed from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Seed(format!("{}: {e}", path.display())))?;
        Self::from_json(&content)
    }
}

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<UserId, User>,
    devices: BTreeMap<DeviceId, Device>,
    networks: BTreeMap<NetworkId, Network>,
    memberships: BTreeSet<(NetworkId, DeviceId)>,
    next_user: i64,
    next_device: i64,
    next_network: i64,
}

/// The id after `id`, or `None` once the id space is used up.
fn successor(id: i64) -> Option<i64> {
    id.checked_add(1)
}

fn seed_successor(kind: &str, id: i64) -> Result<i64> {
    successor(id).ok_or_else(|| StoreError::Seed(format!("{kind} id {id} too large")))
}

fn exhausted(kind: &str) -> StoreError {
    StoreError::Conflict(format!("{kind} ids exhausted"))
}

impl State {
    fn ip_in_use(&self, ip: IpAddr) -> bool {
        self.devices.values().any(|d| d.ip == ip)
    }

    fn key_in_use(&self, key: &str) -> bool {
        self.devices.values().any(|d| d.public_key == key)
    }
}

/// Registry held entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    subnet: IpNet,
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create an empty registry allocating overlay addresses from `subnet`.
    #[must_use]
    pub fn new(subnet: IpNet) -> Self {
        Self {
            subnet,
            state: RwLock::new(State {
                next_user: 1,
                next_device: 1,
                next_network: 1,
                ..State::default()
            }),
        }
    }

    /// Create a registry pre-populated from `seed`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - An id is not positive or appears twice
    /// - A device or network refers to an unknown user
    /// - A device address lies outside `subnet` or is shared
    /// - A membership refers to an unknown device or network
    pub fn from_seed(subnet: IpNet, seed: Seed) -> Result<Self> {
        let store = Self::new(subnet);
        {
            let mut state = store.state.write();

            for user in seed.users {
                if !user.id.is_valid() || state.users.contains_key(&user.id) {
                    return Err(StoreError::Seed(format!("bad or duplicate user id {}", user.id)));
                }
                state.next_user = state.next_user.max(seed_successor("user", user.id.get())?);
                state.users.insert(user.id, user);
            }

            for network in seed.networks {
                if !network.id.is_valid() || state.networks.contains_key(&network.id) {
                    return Err(StoreError::Seed(format!(
                        "bad or duplicate network id {}",
                        network.id
                    )));
                }
                if !state.users.contains_key(&network.owner) {
                    return Err(StoreError::UserNotFound(network.owner.get()));
                }
                state.next_network = state.next_network.max(seed_successor("network", network.id.get())?);
                state.networks.insert(network.id, network);
            }

            for device in seed.devices {
                if !device.id.is_valid() || state.devices.contains_key(&device.id) {
                    return Err(StoreError::Seed(format!(
                        "bad or duplicate device id {}",
                        device.id
                    )));
                }
                if !state.users.contains_key(&device.owner) {
                    return Err(StoreError::UserNotFound(device.owner.get()));
                }
                if !subnet.contains(&device.ip) {
                    return Err(StoreError::Seed(format!(
                        "device {} address {} outside {subnet}",
                        device.id, device.ip
                    )));
                }
                if state.ip_in_use(device.ip) {
                    return Err(StoreError::Conflict(format!("address {} already assigned", device.ip)));
                }
                state.next_device = state.next_device.max(seed_successor("device", device.id.get())?);
                state.devices.insert(device.id, device);
            }

            for m in seed.memberships {
                if !state.networks.contains_key(&m.network) {
                    return Err(StoreError::NetworkNotFound(m.network.get()));
                }
                if !state.devices.contains_key(&m.device) {
                    return Err(StoreError::DeviceNotFound(m.device.get()));
                }
                state.memberships.insert((m.network, m.device));
            }

            info!(
                users = state.users.len(),
                devices = state.devices.len(),
                networks = state.networks.len(),
                memberships = state.memberships.len(),
                "Loaded registry seed"
            );
        }
        Ok(store)
    }

    /// Load a registry from a JSON seed file.
    pub fn from_seed_file(subnet: IpNet, path: impl AsRef<Path>) -> Result<Self> {
        Self::from_seed(subnet, Seed::from_file(path)?)
    }

    /// The subnet overlay addresses are drawn from.
    #[must_use]
    pub const fn subnet(&self) -> &IpNet {
        &self.subnet
    }

    /// Register a user.
    pub fn create_user(&self, username: &str, email: &str) -> Result<User> {
        let mut state = self.state.write();
        if state.users.values().any(|u| u.username == username) {
            return Err(StoreError::Conflict(format!("username {username} taken")));
        }
        let id = UserId::new(state.next_user);
        state.next_user = successor(state.next_user).ok_or_else(|| exhausted("user"))?;
        let user = User::new(id, username, email);
        state.users.insert(id, user.clone());
        Ok(user)
    }

    /// Look up a user.
    pub fn user_by_id(&self, id: UserId) -> Result<User> {
        self.state
            .read()
            .users
            .get(&id)
            .cloned()
            .ok_or(StoreError::UserNotFound(id.get()))
    }

    /// Register a device for `owner` with a freshly allocated overlay address.
    ///
    /// # Errors
    ///
    /// Returns an error if the owner does not exist, the key is already
    /// registered, or no free address turns up within a bounded number of draws.
    pub fn create_device(&self, owner: UserId, name: &str, public_key: &str) -> Result<Device> {
        let mut state = self.state.write();
        if !state.users.contains_key(&owner) {
            return Err(StoreError::UserNotFound(owner.get()));
        }
        if state.key_in_use(public_key) {
            return Err(StoreError::Conflict(format!("key {public_key} already registered")));
        }

        let mut rng = rand::thread_rng();
        let ip = (0..MAX_ALLOCATION_ATTEMPTS)
            .filter_map(|_| overlay::random_address(&self.subnet, &mut rng))
            .find(|ip| !state.ip_in_use(*ip))
            .ok_or_else(|| StoreError::SubnetExhausted(self.subnet.to_string()))?;

        let id = DeviceId::new(state.next_device);
        state.next_device = successor(state.next_device).ok_or_else(|| exhausted("device"))?;
        let device = Device::new(id, owner, name, public_key, ip);
        debug!(device_id = %id, ip = %ip, "Created device");
        state.devices.insert(id, device.clone());
        Ok(device)
    }

    /// Create a network owned by `owner`.
    pub fn create_network(&self, owner: UserId, name: &str) -> Result<Network> {
        let mut state = self.state.write();
        if !state.users.contains_key(&owner) {
            return Err(StoreError::UserNotFound(owner.get()));
        }
        let id = NetworkId::new(state.next_network);
        state.next_network = successor(state.next_network).ok_or_else(|| exhausted("network"))?;
        let network = Network::new(id, owner, name);
        state.networks.insert(id, network.clone());
        Ok(network)
    }

    /// Add `device` to `network`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the device is already a member.
    pub fn join_network(&self, network: NetworkId, device: DeviceId) -> Result<()> {
        let mut state = self.state.write();
        if !state.networks.contains_key(&network) {
            return Err(StoreError::NetworkNotFound(network.get()));
        }
        if !state.devices.contains_key(&device) {
            return Err(StoreError::DeviceNotFound(device.get()));
        }
        if !state.memberships.insert((network, device)) {
            return Err(StoreError::Conflict(format!(
                "device {device} already in network {network}"
            )));
        }
        Ok(())
    }

    /// Remove `device` from `network`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the device is not a member.
    pub fn leave_network(&self, network: NetworkId, device: DeviceId) -> Result<()> {
        let mut state = self.state.write();
        if !state.memberships.remove(&(network, device)) {
            return Err(StoreError::Conflict(format!(
                "device {device} not in network {network}"
            )));
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn device_by_id(&self, id: DeviceId) -> Result<Device> {
        self.state
            .read()
            .devices
            .get(&id)
            .cloned()
            .ok_or(StoreError::DeviceNotFound(id.get()))
    }

    fn all_devices(&self) -> Result<Vec<Device>> {
        Ok(self.state.read().devices.values().cloned().collect())
    }

    fn devices_in_network(&self, network: NetworkId) -> Result<Vec<Device>> {
        let state = self.state.read();
        if !state.networks.contains_key(&network) {
            return Err(StoreError::NetworkNotFound(network.get()));
        }
        Ok(state
            .memberships
            .range((network, DeviceId::new(i64::MIN))..=(network, DeviceId::new(i64::MAX)))
            .filter_map(|(_, d)| state.devices.get(d).cloned())
            .collect())
    }

    fn networks_of_device(&self, device: DeviceId) -> Result<Vec<Network>> {
        let state = self.state.read();
        if !state.devices.contains_key(&device) {
            return Err(StoreError::DeviceNotFound(device.get()));
        }
        Ok(state
            .memberships
            .iter()
            .filter(|(_, d)| *d == device)
            .filter_map(|(n, _)| state.networks.get(n).cloned())
            .collect())
    }

    fn save_device(&self, device: &Device) -> Result<()> {
        let mut state = self.state.write();
        let slot = state
            .devices
            .get_mut(&device.id)
            .ok_or(StoreError::DeviceNotFound(device.id.get()))?;
        *slot = device.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use test_case::test_case;

    fn subnet() -> IpNet {
        "fd00::/32".parse().expect("subnet")
    }

    fn store_with_user() -> (MemoryStore, User) {
        let store = MemoryStore::new(subnet());
        let user = store.create_user("alice", "alice@example.com").expect("user");
        (store, user)
    }

    // ==================== Creation Tests ====================

    #[test]
    fn create_device_allocates_address_in_subnet() {
        let (store, user) = store_with_user();
        let device = store.create_device(user.id, "laptop", "k1").expect("device");

        assert!(device.id.is_valid());
        assert!(subnet().contains(&device.ip));
        assert_eq!(device.endpoint, None);
        assert_eq!(store.device_by_id(device.id).expect("lookup"), device);
    }

    #[test]
    fn device_addresses_are_unique() {
        let (store, user) = store_with_user();
        let mut seen = BTreeSet::new();
        for i in 0..50 {
            let d = store
                .create_device(user.id, "d", &format!("key-{i}"))
                .expect("device");
            assert!(seen.insert(d.ip));
        }
    }

    #[test]
    fn create_device_for_unknown_owner_fails() {
        let store = MemoryStore::new(subnet());
        let err = store.create_device(UserId::new(9), "x", "k");
        assert!(matches!(err, Err(StoreError::UserNotFound(9))));
    }

    #[test]
    fn duplicate_key_is_a_conflict() {
        let (store, user) = store_with_user();
        store.create_device(user.id, "a", "same").expect("first");
        let err = store.create_device(user.id, "b", "same");
        assert!(matches!(err, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn exhausted_subnet_is_reported() {
        let store = MemoryStore::new("fd00::/127".parse().expect("subnet"));
        let user = store.create_user("bob", "b@example.com").expect("user");
        store.create_device(user.id, "only", "k1").expect("first device");
        let err = store.create_device(user.id, "second", "k2");
        assert!(matches!(err, Err(StoreError::SubnetExhausted(_))));
    }

    // ==================== Membership Tests ====================

    #[test]
    fn membership_queries() {
        let (store, user) = store_with_user();
        let a = store.create_device(user.id, "a", "ka").expect("a");
        let b = store.create_device(user.id, "b", "kb").expect("b");
        let n1 = store.create_network(user.id, "home").expect("n1");
        let n2 = store.create_network(user.id, "work").expect("n2");

        store.join_network(n1.id, a.id).expect("join");
        store.join_network(n1.id, b.id).expect("join");
        store.join_network(n2.id, a.id).expect("join");

        let members: Vec<_> = store
            .devices_in_network(n1.id)
            .expect("members")
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(members, vec![a.id, b.id]);
        assert_eq!(store.networks_of_device(a.id).expect("networks").len(), 2);
        assert_eq!(store.networks_of_device(b.id).expect("networks"), vec![n1]);
    }

    #[test]
    fn joining_twice_is_a_conflict() {
        let (store, user) = store_with_user();
        let d = store.create_device(user.id, "a", "ka").expect("d");
        let n = store.create_network(user.id, "n").expect("n");
        store.join_network(n.id, d.id).expect("join");
        assert!(matches!(store.join_network(n.id, d.id), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn leave_removes_membership() {
        let (store, user) = store_with_user();
        let d = store.create_device(user.id, "a", "ka").expect("d");
        let n = store.create_network(user.id, "n").expect("n");
        store.join_network(n.id, d.id).expect("join");
        store.leave_network(n.id, d.id).expect("leave");

        assert!(store.devices_in_network(n.id).expect("members").is_empty());
        assert!(store.leave_network(n.id, d.id).is_err());
    }

    #[test]
    fn unknown_network_lookup_fails() {
        let store = MemoryStore::new(subnet());
        assert!(matches!(
            store.devices_in_network(NetworkId::new(3)),
            Err(StoreError::NetworkNotFound(3))
        ));
    }

    // ==================== Persistence Tests ====================

    #[test]
    fn save_device_updates_endpoint() {
        let (store, user) = store_with_user();
        let d = store.create_device(user.id, "a", "ka").expect("d");
        store
            .save_device(&d.clone().with_endpoint("198.51.100.1:51820"))
            .expect("save");
        assert_eq!(
            store.device_by_id(d.id).expect("lookup").endpoint.as_deref(),
            Some("198.51.100.1:51820")
        );
    }

    #[test]
    fn save_unknown_device_fails() {
        let store = MemoryStore::new(subnet());
        let ghost = Device::new(DeviceId::new(4), UserId::new(1), "g", "k", "fd00::4".parse().expect("ip"));
        assert!(matches!(store.save_device(&ghost), Err(StoreError::DeviceNotFound(4))));
    }

    // ==================== Seed Tests ====================

    const SEED: &str = r#"{
        "users": [{"id": 1, "username": "alice", "email": "a@example.com"}],
        "devices": [
            {"id": 10, "owner": 1, "name": "a", "key": "ka", "ip": "fd00::a"},
            {"id": 11, "owner": 1, "name": "b", "key": "kb", "ip": "fd00::b", "endpoint": "1.2.3.4:5"}
        ],
        "networks": [{"id": 3, "owner": 1, "name": "home"}],
        "memberships": [{"network": 3, "device": 10}, {"network": 3, "device": 11}],
        "tokens": {"secret": 1}
    }"#;

    #[test]
    fn seed_loads_and_continues_ids() {
        let store = MemoryStore::from_seed(subnet(), Seed::from_json(SEED).expect("seed")).expect("store");

        assert_eq!(store.all_devices().expect("devices").len(), 2);
        assert_eq!(store.devices_in_network(NetworkId::new(3)).expect("members").len(), 2);

        let d = store.create_device(UserId::new(1), "c", "kc").expect("device");
        assert_eq!(d.id, DeviceId::new(12));
        let n = store.create_network(UserId::new(1), "work").expect("network");
        assert_eq!(n.id, NetworkId::new(4));
    }

    #[test]
    fn seed_file_is_read_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(SEED.as_bytes()).expect("write");

        let store = MemoryStore::from_seed_file(subnet(), file.path()).expect("store");
        assert_eq!(store.user_by_id(UserId::new(1)).expect("user").username, "alice");
    }

    #[test]
    fn seed_rejects_address_outside_subnet() {
        let seed = r#"{
            "users": [{"id": 1, "username": "a", "email": "e"}],
            "devices": [{"id": 1, "owner": 1, "name": "a", "key": "k", "ip": "10.0.0.1"}]
        }"#;
        let err = MemoryStore::from_seed(subnet(), Seed::from_json(seed).expect("seed"));
        assert!(matches!(err, Err(StoreError::Seed(_))));
    }

    #[test]
    fn seed_rejects_dangling_membership() {
        let seed = r#"{
            "users": [{"id": 1, "username": "a", "email": "e"}],
            "networks": [{"id": 2, "owner": 1, "name": "n"}],
            "memberships": [{"network": 2, "device": 99}]
        }"#;
        let err = MemoryStore::from_seed(subnet(), Seed::from_json(seed).expect("seed"));
        assert!(matches!(err, Err(StoreError::DeviceNotFound(99))));
    }

    #[test_case(r#"{"users": [{"id": 9223372036854775807, "username": "a", "email": "e"}]}"# ; "user")]
    #[test_case(r#"{
        "users": [{"id": 1, "username": "a", "email": "e"}],
        "networks": [{"id": 9223372036854775807, "owner": 1, "name": "n"}]
    }"# ; "network")]
    #[test_case(r#"{
        "users": [{"id": 1, "username": "a", "email": "e"}],
        "devices": [{"id": 9223372036854775807, "owner": 1, "name": "a", "key": "k", "ip": "fd00::1"}]
    }"# ; "device")]
    fn seed_rejects_max_id(seed: &str) {
        let err = MemoryStore::from_seed(subnet(), Seed::from_json(seed).expect("seed"));
        assert!(matches!(err, Err(StoreError::Seed(msg)) if msg.contains("too large")));
    }

    #[test]
    fn id_space_exhaustion_is_an_error() {
        let seed = r#"{"users": [{"id": 9223372036854775806, "username": "a", "email": "e"}]}"#;
        let store = MemoryStore::from_seed(subnet(), Seed::from_json(seed).expect("seed")).expect("store");

        assert!(matches!(store.create_user("b", "b@example.com"), Err(StoreError::Conflict(_))));
        assert!(store.create_device(UserId::new(i64::MAX - 1), "a", "ka").is_ok());
    }

    #[test]
    fn malformed_seed_is_an_error() {
        assert!(matches!(Seed::from_json("{not json"), Err(StoreError::Seed(_))));
    }

    #[test]
    fn store_is_object_safe() {
        let store: std::sync::Arc<dyn Store> = std::sync::Arc::new(MemoryStore::new(subnet()));
        assert!(store.all_devices().expect("devices").is_empty());
    }
}
