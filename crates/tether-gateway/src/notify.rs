//! Topology-change fan-out.
//!
//! The engine only decides who must hear about a change. Every notification
//! becomes a [`SendRequest`] on the [`DeliveryPool`]; nothing here touches a
//! connection.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use tether_proto::{Device, DeviceId, GatewayMessage, Network, NetworkId};
use tether_store::{Store, StoreError};

use crate::delivery::{DeliveryPool, SendRequest};

/// Computes recipients for topology events and queues the notices.
#[derive(Clone)]
pub struct NotificationEngine {
    store: Arc<dyn Store>,
    pool: DeliveryPool,
}

impl std::fmt::Debug for NotificationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationEngine")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl NotificationEngine {
    /// Create an engine reading topology from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, pool: DeliveryPool) -> Self {
        Self { store, pool }
    }

    /// `device` reported a new endpoint.
    ///
    /// Every device sharing a network with it, and the device itself, gets
    /// one `dev_update`.
    pub async fn on_device_endpoint_change(&self, device: &Device) {
        let requests = match self.endpoint_change_requests(device) {
            Ok(requests) => requests,
            Err(e) => {
                warn!(device_id = %device.id, error = %e, "Dropping endpoint change");
                return;
            }
        };
        self.dispatch("dev_update", device.id, requests).await;
    }

    /// `device` joined `network`.
    ///
    /// Existing members learn about `device`; `device` learns about each
    /// existing member.
    pub async fn on_network_join(&self, device: &Device, network: &Network) {
        let requests = match self.join_requests(device, network) {
            Ok(requests) => requests,
            Err(e) => {
                warn!(device_id = %device.id, network_id = %network.id, error = %e, "Dropping network join");
                return;
            }
        };
        self.dispatch("network_join", device.id, requests).await;
    }

    /// `device` left `network`.
    ///
    /// Only members that no longer share any network with `device` are told
    /// to forget it, and `device` is told to forget them.
    pub async fn on_network_leave(&self, device: &Device, network: &Network) {
        let requests = match self.leave_requests(device, network) {
            Ok(requests) => requests,
            Err(e) => {
                warn!(device_id = %device.id, network_id = %network.id, error = %e, "Dropping network leave");
                return;
            }
        };
        self.dispatch("network_leave", device.id, requests).await;
    }

    fn endpoint_change_requests(&self, device: &Device) -> Result<Vec<SendRequest>, StoreError> {
        let networks = self.store.networks_of_device(device.id)?;
        let peers = self.peers_through(networks.iter().map(|n| n.id), device.id)?;

        let message = GatewayMessage::dev_update(device.clone());
        Ok(peers
            .into_iter()
            .chain(std::iter::once(device.id))
            .map(|target| SendRequest {
                device: target,
                message: message.clone(),
            })
            .collect())
    }

    fn join_requests(&self, device: &Device, network: &Network) -> Result<Vec<SendRequest>, StoreError> {
        let members = self.store.devices_in_network(network.id)?;

        let mut requests = Vec::with_capacity(members.len() * 2);
        for member in members.into_iter().filter(|m| m.id != device.id) {
            requests.push(SendRequest {
                device: member.id,
                message: GatewayMessage::network_join(device.clone(), network.clone()),
            });
            requests.push(SendRequest {
                device: device.id,
                message: GatewayMessage::network_join(member, network.clone()),
            });
        }
        Ok(requests)
    }

    fn leave_requests(&self, device: &Device, network: &Network) -> Result<Vec<SendRequest>, StoreError> {
        let members = self.store.devices_in_network(network.id)?;

        let remaining = self
            .store
            .networks_of_device(device.id)?
            .into_iter()
            .map(|n| n.id)
            .filter(|id| *id != network.id);
        let still_connected = self.peers_through(remaining, device.id)?;

        let mut requests = Vec::new();
        for member in members {
            if member.id == device.id || still_connected.contains(&member.id) {
                continue;
            }
            requests.push(SendRequest {
                device: member.id,
                message: GatewayMessage::network_leave(device.clone(), network.clone()),
            });
            requests.push(SendRequest {
                device: device.id,
                message: GatewayMessage::network_leave(member, network.clone()),
            });
        }
        Ok(requests)
    }

    /// Distinct members of `networks`, excluding `except`.
    fn peers_through(
        &self,
        networks: impl IntoIterator<Item = NetworkId>,
        except: DeviceId,
    ) -> Result<BTreeSet<DeviceId>, StoreError> {
        let mut peers = BTreeSet::new();
        for network in networks {
            for member in self.store.devices_in_network(network)? {
                if member.id != except {
                    peers.insert(member.id);
                }
            }
        }
        Ok(peers)
    }

    async fn dispatch(&self, kind: &'static str, subject: DeviceId, requests: Vec<SendRequest>) {
        debug!(device_id = %subject, kind, recipients = requests.len(), "Fanning out");
        for SendRequest { device, message } in requests {
            if let Err(e) = self.pool.enqueue(device, message).await {
                warn!(device_id = %subject, kind, error = %e, "Delivery pool rejected notice");
                return;
            }
        }
    }
}
