//! Outbound delivery workers.
//!
//! The queue is split into one shard per worker and requests are routed by
//! `device_id % workers`, so all messages for one device are written in the
//! order they were enqueued. A request whose device has no live connection is
//! dropped; a write that fails or exceeds the send timeout is logged and not
//! retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_proto::{DeviceId, GatewayMessage};

use crate::error::{GatewayError, Result};
use crate::registry::ConnectionRegistry;

/// Per-write timeout.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Default total queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// A message addressed to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// Target device.
    pub device: DeviceId,
    /// Payload.
    pub message: GatewayMessage,
}

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Number of workers (and queue shards).
    pub workers: usize,
    /// Total queue capacity across all shards.
    pub queue_capacity: usize,
    /// Per-write timeout.
    pub send_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            send_timeout: SEND_TIMEOUT,
        }
    }
}

impl DeliveryConfig {
    /// Set the worker count.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the total queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the per-write timeout.
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    fn shard_capacity(&self) -> usize {
        self.queue_capacity.div_ceil(self.workers.max(1)).max(1)
    }
}

struct Inner {
    shards: RwLock<Option<Vec<mpsc::Sender<SendRequest>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queued: Arc<AtomicUsize>,
}

/// Bounded queue plus a fixed set of sender tasks.
///
/// Cloning yields another handle on the same pool.
#[derive(Clone)]
pub struct DeliveryPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeliveryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPool")
            .field("queued", &self.queue_len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn shard_index(device: DeviceId, shards: usize) -> usize {
    device.get().rem_euclid(shards as i64) as usize
}

impl DeliveryPool {
    /// Start `workers` workers sharing `queue_capacity` slots.
    #[must_use]
    pub fn start(registry: Arc<ConnectionRegistry>, workers: usize, queue_capacity: usize) -> Self {
        Self::start_with(
            registry,
            DeliveryConfig::default()
                .with_workers(workers)
                .with_queue_capacity(queue_capacity),
        )
    }

    /// Start a pool from a full configuration. A worker count of zero is
    /// raised to one.
    #[must_use]
    pub fn start_with(registry: Arc<ConnectionRegistry>, config: DeliveryConfig) -> Self {
        let workers = config.workers.max(1);
        let capacity = config.shard_capacity();
        let queued = Arc::new(AtomicUsize::new(0));

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            handles.push(tokio::spawn(worker(
                index,
                rx,
                Arc::clone(&registry),
                Arc::clone(&queued),
                config.send_timeout,
            )));
        }

        info!(workers, shard_capacity = capacity, "Delivery pool started");

        Self {
            inner: Arc::new(Inner {
                shards: RwLock::new(Some(senders)),
                workers: Mutex::new(handles),
                queued,
            }),
        }
    }

    /// Queue `message` for `device`, waiting while its shard is full.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PoolClosed`] after [`DeliveryPool::stop`].
    pub async fn enqueue(&self, device: DeviceId, message: GatewayMessage) -> Result<()> {
        let tx = {
            let shards = self.inner.shards.read();
            let shards = shards.as_ref().ok_or(GatewayError::PoolClosed)?;
            shards[shard_index(device, shards.len())].clone()
        };

        self.inner.queued.fetch_add(1, Ordering::AcqRel);
        if tx.send(SendRequest { device, message }).await.is_err() {
            self.inner.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(GatewayError::PoolClosed);
        }
        Ok(())
    }

    /// Requests waiting across all shards.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }

    /// Whether [`DeliveryPool::stop`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shards.read().is_none()
    }

    /// Close the queue and wait for the workers to drain it and exit.
    ///
    /// Calling this more than once is harmless.
    pub async fn stop(&self) {
        let shards = self.inner.shards.write().take();
        drop(shards);

        let handles = std::mem::take(&mut *self.inner.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Delivery worker panicked");
            }
        }
        info!("Delivery pool stopped");
    }
}

async fn worker(
    index: usize,
    mut rx: mpsc::Receiver<SendRequest>,
    registry: Arc<ConnectionRegistry>,
    queued: Arc<AtomicUsize>,
    send_timeout: Duration,
) {
    while let Some(request) = rx.recv().await {
        queued.fetch_sub(1, Ordering::AcqRel);
        deliver(&registry, request, send_timeout).await;
    }
    debug!(worker = index, "Delivery worker exiting");
}

async fn deliver(registry: &ConnectionRegistry, request: SendRequest, send_timeout: Duration) {
    let SendRequest { device, message } = request;
    let kind = message.kind();

    let Some(conn) = registry.find_by_device(device) else {
        debug!(device_id = %device, kind, "Device not connected, dropping message");
        return;
    };

    let result = tokio::time::timeout(send_timeout, conn.send(message))
        .await
        .unwrap_or(Err(GatewayError::Timeout(send_timeout)));
    match result {
        Ok(()) => debug!(device_id = %device, kind, "Delivered message"),
        Err(e) => warn!(device_id = %device, kind, error = %e, "Delivery failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::{SinkExt, StreamExt};
    use test_case::test_case;
    use tether_proto::{User, UserId};

    use crate::connection::GatewayConnection;

    fn bound(
        registry: &ConnectionRegistry,
        device: i64,
    ) -> (Arc<GatewayConnection>, fmpsc::UnboundedReceiver<GatewayMessage>) {
        let (tx, rx) = fmpsc::unbounded();
        let sink = tx.sink_map_err(|e| GatewayError::Transport(e.to_string()));
        let conn = Arc::new(GatewayConnection::new(
            User::new(UserId::new(1), "u", "u@example.com"),
            "127.0.0.1".parse().expect("ip"),
            sink,
        ));
        conn.bind_device(DeviceId::new(device));
        registry.register(Arc::clone(&conn));
        (conn, rx)
    }

    fn ping(n: i64) -> GatewayMessage {
        GatewayMessage::ping(DeviceId::new(n), format!("10.0.0.{n}:1"))
    }

    #[test_case(4096, 8, 512 ; "even split")]
    #[test_case(10, 3, 4 ; "rounded up")]
    #[test_case(1, 4, 1 ; "at least one")]
    #[test_case(5, 0, 5 ; "zero workers")]
    fn shard_capacity(total: usize, workers: usize, expected: usize) {
        let config = DeliveryConfig::default()
            .with_queue_capacity(total)
            .with_workers(workers);
        assert_eq!(config.shard_capacity(), expected);
    }

    #[test]
    fn shard_index_handles_negative_ids() {
        assert_eq!(shard_index(DeviceId::new(7), 4), 3);
        assert!(shard_index(DeviceId::new(-7), 4) < 4);
    }

    #[tokio::test]
    async fn delivers_to_bound_connection_in_order() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_conn, mut rx) = bound(&registry, 3);
        let pool = DeliveryPool::start(Arc::clone(&registry), 4, 64);

        for n in 1..=10 {
            pool.enqueue(DeviceId::new(3), ping(n)).await.expect("enqueue");
        }
        pool.stop().await;

        let received: Vec<_> = rx.by_ref().take(10).collect().await;
        assert_eq!(received, (1..=10).map(ping).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unknown_device_is_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_conn, mut rx) = bound(&registry, 1);
        let pool = DeliveryPool::start(Arc::clone(&registry), 2, 8);

        pool.enqueue(DeviceId::new(99), ping(1)).await.expect("enqueue");
        pool.stop().await;

        assert!(rx.try_next().is_err());
    }

    #[tokio::test]
    async fn queue_is_empty_after_stop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let pool = DeliveryPool::start(Arc::clone(&registry), 3, 300);
        for n in 0..100 {
            pool.enqueue(DeviceId::new(n), ping(n)).await.expect("enqueue");
        }
        pool.stop().await;
        assert_eq!(pool.queue_len(), 0);
    }

    #[tokio::test]
    async fn enqueue_after_stop_fails() {
        let pool = DeliveryPool::start(Arc::new(ConnectionRegistry::new()), 1, 1);
        pool.stop().await;
        pool.stop().await;

        assert!(pool.is_closed());
        let err = pool.enqueue(DeviceId::new(1), ping(1)).await;
        assert!(matches!(err, Err(GatewayError::PoolClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_write_times_out_and_worker_moves_on() {
        let registry = Arc::new(ConnectionRegistry::new());

        // A bounded channel nobody reads: the first send fills it, the second blocks.
        let (tx, _stuck_rx) = fmpsc::channel::<GatewayMessage>(0);
        let stuck = Arc::new(GatewayConnection::new(
            User::new(UserId::new(1), "u", "u@example.com"),
            "127.0.0.1".parse().expect("ip"),
            tx.sink_map_err(|e| GatewayError::Transport(e.to_string())),
        ));
        stuck.bind_device(DeviceId::new(2));
        registry.register(Arc::clone(&stuck));

        let pool = DeliveryPool::start_with(
            Arc::clone(&registry),
            DeliveryConfig::default()
                .with_workers(1)
                .with_queue_capacity(8)
                .with_send_timeout(Duration::from_secs(15)),
        );
        let (_ok, mut ok_rx) = bound(&registry, 4);

        for n in 0..3 {
            pool.enqueue(DeviceId::new(2), ping(n)).await.expect("enqueue");
        }
        pool.enqueue(DeviceId::new(4), ping(4)).await.expect("enqueue");

        pool.stop().await;
        assert_eq!(ok_rx.next().await, Some(ping(4)));
    }
}
