//! The local peer: identity, session server, entities and outbound routing.

use crate::entity_manager::EntityManager;
use crate::error::{KernelError, KernelResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_runtime::retry::{RetryError, RetryPolicy, RetryRegistry, RetryTask};
use tether_types::config::PeerConfig;
use tether_types::entity::Entity;
use tether_types::error::{ErrorKind, ServiceError};
use tether_types::identity::{parse_public_key, Keypair, PeerAddress};
use tether_types::service::{ServiceAddress, ServiceId};
use tether_wire::{
    AuthContext, AuthMode, Authorizer, Connector, Endpoint, Service, Session, SessionHandler,
    SessionServer, TransponderSet,
};
use tracing::{debug, info, warn};

struct AdminInner {
    keypair: Arc<Keypair>,
    config: PeerConfig,
    routes: DashMap<PeerAddress, SocketAddr>,
    registry: Arc<RetryRegistry>,
    connect: RetryTask<ServiceError>,
    context: AuthContext,
    transponders: TransponderSet,
    server: Arc<SessionServer>,
    entities: Arc<EntityManager>,
    shut_down: AtomicBool,
}

/// Handle to a running peer. Clones share the peer.
#[derive(Clone)]
pub struct ServiceAdmin {
    inner: Arc<AdminInner>,
}

impl ServiceAdmin {
    /// Boots a peer from `config`: binds the session server, activates the
    /// exchange service and registers the configured routes and entities.
    pub async fn start(config: PeerConfig) -> KernelResult<Self> {
        let keypair = if config.secret_key.is_empty() {
            info!("No secret key configured, generating an ephemeral identity");
            Keypair::generate()
        } else {
            Keypair::from_secret_hex(&config.secret_key)?
        };
        let system_key = config
            .system_public_key
            .as_deref()
            .map(parse_public_key)
            .transpose()?
            .map(|key| key.to_bytes());
        let keypair = Arc::new(keypair);

        let entities = EntityManager::new(config.exchange_timeout());
        let context = AuthContext::new(
            Arc::clone(&keypair),
            system_key,
            Arc::clone(&entities) as Arc<dyn Authorizer>,
        );
        let transponders = TransponderSet::default();
        let server = SessionServer::bind(config.listen_addr, context.clone(), transponders.clone())
            .await
            .map_err(|e| KernelError::BootFailed(format!("bind {}: {e}", config.listen_addr)))?;

        let policy = config
            .connect_retry
            .iter()
            .fold(RetryPolicy::new(), |policy, stage| {
                policy.stage(stage.count, stage.delay())
            });
        let connect = RetryTask::new(policy).retry_if(|e: &ServiceError| e.kind() == ErrorKind::Io);

        let routes = DashMap::new();
        for route in &config.routes {
            routes.insert(route.address, route.socket);
        }

        let inner = Arc::new(AdminInner {
            keypair,
            config,
            routes,
            registry: Arc::new(RetryRegistry::new()),
            connect,
            context,
            transponders,
            server,
            entities,
            shut_down: AtomicBool::new(false),
        });
        let connector: Weak<dyn Connector> = Arc::downgrade(&inner) as Weak<dyn Connector>;
        inner.entities.attach(connector);

        let admin = Self { inner };
        let address = admin.address();
        admin.activate(admin.inner.entities.exchange_service(address));
        for entity in &admin.inner.config.entities {
            admin
                .inner
                .entities
                .add(Entity::new(entity.address, entity.name.clone()));
        }
        info!(peer = %address, addr = %admin.local_addr(), "Peer started");
        Ok(admin)
    }

    /// This peer's network identity.
    pub fn address(&self) -> PeerAddress {
        self.inner.keypair.address()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    /// The address the session server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.server.local_addr()
    }

    /// A new local service address with a random id.
    pub fn new_service_address(&self) -> ServiceAddress {
        self.service_address(ServiceId::random())
    }

    pub fn service_address(&self, id: ServiceId) -> ServiceAddress {
        ServiceAddress::new(id, self.address())
    }

    pub fn entity_manager(&self) -> &Arc<EntityManager> {
        &self.inner.entities
    }

    /// Default deadline for session requests.
    pub fn request_timeout(&self) -> Duration {
        self.inner.config.request_timeout()
    }

    /// Tells this peer where `address` can be reached.
    pub fn add_route(&self, address: PeerAddress, socket: SocketAddr) {
        debug!(peer = %address, socket = %socket, "Route added");
        self.inner.routes.insert(address, socket);
    }

    pub fn remove_route(&self, address: PeerAddress) -> Option<SocketAddr> {
        self.inner.routes.remove(&address).map(|(_, socket)| socket)
    }

    pub fn activate(&self, service: Service) {
        self.inner.server.activate(service);
    }

    /// Deactivates the service `id` and strips it from every entity's grant
    /// sets.
    pub fn deactivate(&self, id: ServiceId) -> Option<Service> {
        let service = self.inner.server.deactivate(id)?;
        self.inner.entities.purge(service.address());
        Some(service)
    }

    pub fn active_services(&self) -> Vec<Service> {
        self.inner.server.services()
    }

    /// A proxy session to the remote service at `address`. It connects on
    /// first use.
    pub fn proxy(
        &self,
        address: ServiceAddress,
        mode: AuthMode,
        handler: Arc<dyn SessionHandler>,
    ) -> Session {
        let connector: Weak<dyn Connector> = Arc::downgrade(&self.inner) as Weak<dyn Connector>;
        Session::proxy(address, mode, handler, connector)
    }

    /// Number of open connections, inbound and outbound.
    pub fn connection_count(&self) -> usize {
        self.inner.transponders.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Cancels pending connection retries, closes every session and stops
    /// accepting connections. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.registry.shutdown();
        self.inner.entities.shutdown();
        self.inner.server.shutdown();
        self.inner.transponders.close_all();
        info!(peer = %self.address(), "Peer shut down");
    }
}

#[async_trait]
impl Connector for AdminInner {
    async fn open(&self, host: PeerAddress) -> Result<Endpoint, ServiceError> {
        let socket = self
            .routes
            .get(&host)
            .map(|route| *route.value())
            .ok_or(ServiceError::Unregistered(host))?;

        let handle = self.connect.execute(
            &self.registry,
            move || async move { Endpoint::connect(socket).await.map_err(ServiceError::from) },
            (),
        );
        handle.result().await.map_err(|e| match e {
            RetryError::Cancelled => {
                ServiceError::Interrupted(format!("Connecting to {host} was cancelled"))
            }
            RetryError::Aborted(e) => e,
            RetryError::Exhausted { attempts, last } => {
                warn!(peer = %host, attempts, "Peer unreachable");
                last
            }
        })
    }

    fn auth_context(&self) -> AuthContext {
        self.context.clone()
    }

    fn transponders(&self) -> TransponderSet {
        self.transponders.clone()
    }
}
