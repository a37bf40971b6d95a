//! Kernel peer reconciliation.
//!
//! [`KernelPeerReconciler::start`] configures the interface, spawns the single
//! task that owns the [`KernelBackend`], and queues one add event for every
//! registered device. From then on, [`PeerEventSender`]s feed it peer changes
//! which are applied strictly in arrival order.

use std::net::IpAddr;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_store::Store;

use crate::backend::KernelBackend;
use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;
use crate::types::{InterfaceConfig, PeerEvent};

/// Capacity of the peer event channel. Producers wait when it is full.
pub const CHANNEL_CAPACITY: usize = 1000;

/// Producer side of the reconciler's event channel.
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    tx: mpsc::Sender<PeerEvent>,
}

impl PeerEventSender {
    /// Queue a peer change, waiting while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::ReconcilerClosed`] once the reconciler has
    /// begun shutting down.
    pub async fn enqueue(&self, public_key: PublicKey, ip: IpAddr, remove: bool) -> Result<()> {
        self.send(PeerEvent {
            public_key,
            ip,
            remove,
        })
        .await
    }

    /// Queue a prepared event.
    pub async fn send(&self, event: PeerEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| WireGuardError::ReconcilerClosed)
    }

    /// Whether the reconciler has stopped accepting events.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Handle on a running reconciler.
#[derive(Debug)]
pub struct ReconcilerHandle {
    sender: PeerEventSender,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// A new producer for peer events.
    #[must_use]
    pub fn sender(&self) -> PeerEventSender {
        self.sender.clone()
    }

    /// Stop accepting events, apply everything already queued, tear the
    /// interface down, and wait for all of it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Peer reconciler task failed");
        }
    }
}

/// The only component permitted to mutate the kernel interface.
pub struct KernelPeerReconciler;

impl KernelPeerReconciler {
    /// Set up the interface and start reconciling.
    ///
    /// Devices whose key does not parse are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be configured or the device
    /// registry cannot be read. The interface is torn down in both cases.
    pub async fn start<B: KernelBackend>(
        mut backend: B,
        config: &InterfaceConfig,
        store: &dyn Store,
        cancel: CancellationToken,
    ) -> Result<ReconcilerHandle> {
        if let Err(e) = backend.setup(config).await {
            error!(interface = %config.name, error = %e, "Failed to set up WireGuard interface");
            if let Err(teardown) = backend.teardown().await {
                debug!(error = %teardown, "Teardown after failed setup also failed");
            }
            return Err(e);
        }
        info!(interface = %config.name, address = %config.address, port = config.listen_port, "WireGuard interface configured");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = cancel.child_token();
        let task = tokio::spawn(run(backend, rx, cancel.clone()));
        let handle = ReconcilerHandle {
            sender: PeerEventSender { tx },
            cancel,
            task,
        };

        match full_sync(store, &handle.sender).await {
            Ok(count) => {
                info!(peers = count, "Queued initial peer sync");
                Ok(handle)
            }
            Err(e) => {
                error!(error = %e, "Initial peer sync failed");
                handle.shutdown().await;
                Err(e)
            }
        }
    }
}

async fn full_sync(store: &dyn Store, sender: &PeerEventSender) -> Result<usize> {
    let devices = store.all_devices()?;
    let mut queued = 0;
    for device in &devices {
        match PeerEvent::for_device(device) {
            Ok(event) => {
                sender.send(event).await?;
                queued += 1;
            }
            Err(e) => {
                warn!(device_id = %device.id, error = %e, "Skipping device with invalid key");
            }
        }
    }
    Ok(queued)
}

async fn run<B: KernelBackend>(
    mut backend: B,
    mut rx: mpsc::Receiver<PeerEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => apply(&mut backend, event).await,
                None => break,
            },
        }
    }

    rx.close();
    let mut drained = 0usize;
    while let Some(event) = rx.recv().await {
        apply(&mut backend, event).await;
        drained += 1;
    }
    debug!(drained, "Peer event channel drained");

    if let Err(e) = backend.teardown().await {
        warn!(error = %e, "Failed to remove WireGuard interface");
    }
    info!("Peer reconciler stopped");
}

async fn apply<B: KernelBackend>(backend: &mut B, event: PeerEvent) {
    let dst = event.allowed_ip();
    if event.remove {
        info!(peer = %event.public_key, ip = %event.ip, "Removing WireGuard peer");
        if let Err(e) = backend.remove_route(dst).await {
            warn!(dst = %dst, error = %e, "Failed to remove route");
        }
        if let Err(e) = backend.remove_peer(&event.public_key).await {
            warn!(peer = %event.public_key, error = %e, "Failed to remove peer");
        }
    } else {
        info!(peer = %event.public_key, ip = %event.ip, "Adding WireGuard peer");
        if let Err(e) = backend.add_route(dst).await {
            warn!(dst = %dst, error = %e, "Failed to add route");
        }
        if let Err(e) = backend.upsert_peer(&event.public_key, &[dst]).await {
            warn!(peer = %event.public_key, error = %e, "Failed to configure peer");
        }
    }
}
