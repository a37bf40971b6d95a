//! Process wiring for `tetherd`.
//!
//! Start order: registry, delivery pool, kernel reconciler (optional, fatal on
//! setup failure), rendezvous server, gateway listener. [`Daemon::shutdown`]
//! unwinds in the opposite direction: listeners stop, the delivery queue
//! drains, and the reconciler drains and tears the interface down last.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tether_gateway::{ConnectionRegistry, DeliveryPool, GatewayContext, NotificationEngine};
use tether_punch::{Lookup, MeshLookup, RendezvousServer};
use tether_store::{MemoryStore, Store};
use tether_wireguard::{KernelBackend, KernelPeerReconciler, PeerEventSender, ReconcilerHandle};

use crate::auth::StaticTokenAuthenticator;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::server::GatewayServer;

/// Everything that exists before the kernel interface is touched.
struct Core {
    store: Arc<MemoryStore>,
    auth: StaticTokenAuthenticator,
    registry: Arc<ConnectionRegistry>,
    pool: DeliveryPool,
    ctx: GatewayContext,
}

impl Core {
    fn build(config: &ServerConfig) -> ServerResult<Self> {
        let (store, auth) = match &config.registry_file {
            Some(path) => {
                let store = MemoryStore::from_seed_file(config.subnet, path)?;
                let auth = StaticTokenAuthenticator::from_seed_file(path, &store)?;
                (store, auth)
            }
            None => (MemoryStore::new(config.subnet), StaticTokenAuthenticator::new()),
        };
        let store = Arc::new(store);
        if auth.is_empty() {
            warn!("No gateway tokens configured, every connection will be rejected");
        }

        let registry = Arc::new(ConnectionRegistry::new());
        let pool = DeliveryPool::start_with(Arc::clone(&registry), config.delivery.to_delivery_config());
        let dyn_store: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
        let engine = NotificationEngine::new(Arc::clone(&dyn_store), pool.clone());
        let ctx = GatewayContext::new(Arc::clone(&registry), dyn_store, engine);

        Ok(Self {
            store,
            auth,
            registry,
            pool,
            ctx,
        })
    }

    async fn abort(self, reconciler: Option<ReconcilerHandle>) {
        self.pool.stop().await;
        if let Some(reconciler) = reconciler {
            reconciler.shutdown().await;
        }
    }
}

/// A running daemon.
pub struct Daemon {
    store: Arc<MemoryStore>,
    registry: Arc<ConnectionRegistry>,
    pool: DeliveryPool,
    ctx: GatewayContext,
    reconciler: Option<ReconcilerHandle>,
    cancel: CancellationToken,
    gateway_addr: SocketAddr,
    rendezvous_addr: SocketAddr,
    gateway: JoinHandle<ServerResult<()>>,
    rendezvous: JoinHandle<tether_punch::Result<()>>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("gateway_addr", &self.gateway_addr)
            .field("rendezvous_addr", &self.rendezvous_addr)
            .field("kernel", &self.reconciler.is_some())
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Start without a kernel interface.
    ///
    /// # Errors
    ///
    /// Fails if `kernel.enabled` is set, the registry seed cannot be loaded,
    /// or a listener cannot be bound.
    pub async fn start(config: &ServerConfig) -> ServerResult<Self> {
        if config.kernel.enabled {
            return Err(ServerError::Config(
                "kernel.enabled requires a kernel backend (build with the `linux` feature)".to_string(),
            ));
        }

        let core = Core::build(config)?;
        let rendezvous = match RendezvousServer::bind(config.rendezvous_addr()).await {
            Ok(server) => server,
            Err(e) => {
                core.abort(None).await;
                return Err(e.into());
            }
        };
        Self::launch(config, core, None, rendezvous).await
    }

    /// Start with `backend` managing the kernel interface.
    ///
    /// The rendezvous server answers from the kernel peer table.
    ///
    /// # Errors
    ///
    /// Fails if the interface cannot be set up, the registry cannot be read,
    /// or a listener cannot be bound. Anything already started is stopped.
    pub async fn start_with_kernel<B: KernelBackend>(config: &ServerConfig, backend: B) -> ServerResult<Self> {
        let iface = config.kernel.interface_config()?;
        let core = Core::build(config)?;

        let table = backend.peer_table();
        let reconciler =
            match KernelPeerReconciler::start(backend, &iface, core.store.as_ref(), CancellationToken::new()).await {
                Ok(handle) => handle,
                Err(e) => {
                    core.abort(None).await;
                    return Err(e.into());
                }
            };

        let rendezvous = match RendezvousServer::bind(config.rendezvous_addr()).await {
            Ok(server) => server.with_lookup(MeshLookup::new(table)),
            Err(e) => {
                core.abort(Some(reconciler)).await;
                return Err(e.into());
            }
        };
        Self::launch(config, core, Some(reconciler), rendezvous).await
    }

    async fn launch<L: Lookup + 'static>(
        config: &ServerConfig,
        core: Core,
        reconciler: Option<ReconcilerHandle>,
        rendezvous: RendezvousServer<L>,
    ) -> ServerResult<Self> {
        let gateway = match GatewayServer::bind(config.listen, core.auth.clone(), core.ctx.clone()).await {
            Ok(server) => server,
            Err(e) => {
                core.abort(reconciler).await;
                return Err(e);
            }
        };

        let (gateway_addr, rendezvous_addr) = match (gateway.local_addr(), rendezvous.local_addr()) {
            (Ok(gateway_addr), Ok(rendezvous_addr)) => (gateway_addr, rendezvous_addr),
            (Err(e), _) => {
                core.abort(reconciler).await;
                return Err(e);
            }
            (_, Err(e)) => {
                core.abort(reconciler).await;
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let rendezvous = tokio::spawn(rendezvous.serve(cancel.child_token()));
        let gateway = tokio::spawn(gateway.serve(cancel.child_token()));
        info!(gateway = %gateway_addr, rendezvous = %rendezvous_addr, kernel = reconciler.is_some(), "tetherd started");

        Ok(Self {
            store: core.store,
            registry: core.registry,
            pool: core.pool,
            ctx: core.ctx,
            reconciler,
            cancel,
            gateway_addr,
            rendezvous_addr,
            gateway,
            rendezvous,
        })
    }

    /// The bound gateway address.
    #[must_use]
    pub const fn gateway_addr(&self) -> SocketAddr {
        self.gateway_addr
    }

    /// The bound rendezvous address.
    #[must_use]
    pub const fn rendezvous_addr(&self) -> SocketAddr {
        self.rendezvous_addr
    }

    /// The device registry.
    #[must_use]
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Live gateway connections.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The notification engine, for raising join and leave events.
    #[must_use]
    pub const fn engine(&self) -> &NotificationEngine {
        self.ctx.engine()
    }

    /// Producer handle for runtime peer changes, when a kernel interface is managed.
    #[must_use]
    pub fn peer_events(&self) -> Option<PeerEventSender> {
        self.reconciler.as_ref().map(ReconcilerHandle::sender)
    }

    /// Stop everything in reverse start order.
    pub async fn shutdown(self) {
        info!("tetherd shutting down");
        self.cancel.cancel();

        match self.gateway.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Gateway server failed"),
            Err(e) => error!(error = %e, "Gateway server task panicked"),
        }
        match self.rendezvous.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Rendezvous server failed"),
            Err(e) => error!(error = %e, "Rendezvous server task panicked"),
        }

        self.pool.stop().await;
        if let Some(reconciler) = self.reconciler {
            reconciler.shutdown().await;
        }
        info!("tetherd stopped");
    }
}
