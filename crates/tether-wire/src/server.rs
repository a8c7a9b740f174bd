//! The listening side of a peer: accepts connections and binds each one to
//! the locally activated service it asks for.

use crate::auth::AuthContext;
use crate::endpoint::{Endpoint, WireError};
use crate::session::Service;
use crate::transponder::{ServiceTable, Transponder, TransponderSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tether_types::service::ServiceId;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct SessionServer {
    local_addr: SocketAddr,
    services: ServiceTable,
    context: AuthContext,
    transponders: TransponderSet,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl SessionServer {
    /// Binds `addr` and starts accepting connections.
    pub async fn bind(
        addr: SocketAddr,
        context: AuthContext,
        transponders: TransponderSet,
    ) -> Result<Arc<Self>, WireError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, peer = %context.address(), "Listening for sessions");

        let server = Arc::new(Self {
            local_addr,
            services: ServiceTable::default(),
            context,
            transponders,
            accept: Mutex::new(None),
        });

        let worker = Arc::clone(&server);
        let handle = tokio::spawn(async move { worker.accept_loop(listener).await });
        *server.accept.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(server)
    }

    /// The actual bound address (useful when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Makes `service` reachable. Replaces any service with the same id.
    pub fn activate(&self, service: Service) {
        info!(service = %service.address(), mode = ?service.mode(), "Service activated");
        self.services.insert(service.id(), service);
    }

    /// Stops accepting sessions for `id`. Open sessions stay up.
    pub fn deactivate(&self, id: ServiceId) -> Option<Service> {
        let removed = self.services.remove(&id).map(|(_, service)| service);
        if let Some(service) = &removed {
            info!(service = %service.address(), "Service deactivated");
        }
        removed
    }

    pub fn service(&self, id: ServiceId) -> Option<Service> {
        self.services.get(&id).map(|s| s.value().clone())
    }

    pub fn services(&self) -> Vec<Service> {
        self.services.iter().map(|s| s.value().clone()).collect()
    }

    /// Runs the server side of the protocol on an already established
    /// endpoint.
    pub async fn accept_endpoint(&self, endpoint: Endpoint) -> Result<Transponder, WireError> {
        Transponder::connect_server(
            endpoint,
            &self.services,
            &self.context,
            self.transponders.clone(),
        )
        .await
    }

    /// Stops the accept loop and closes every live connection.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .accept
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
            info!(addr = %self.local_addr, "Session server stopped");
        }
        self.transponders.close_all();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.accept_endpoint(Endpoint::from_tcp(stream)).await {
                            warn!(remote = %addr, error = %e, "Inbound session rejected");
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthMode, Authorizer};
    use crate::message::Message;
    use crate::session::{Connector, HandlerError, Handlers, Session, SessionHandler};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tether_types::codec::{get_varint, put_varint};
    use tether_types::entity::Entity;
    use tether_types::error::{ErrorKind, ServiceError};
    use tether_types::identity::{Keypair, PeerAddress};
    use tether_types::service::ServiceAddress;

    const ADD: u8 = 1;
    const SUM: u8 = 2;
    const FAIL: u8 = 3;
    const SILENT: u8 = 4;

    #[derive(Default)]
    struct Entities(DashMap<PeerAddress, Entity>);

    impl Authorizer for Entities {
        fn entity(&self, address: PeerAddress) -> Option<Entity> {
            self.0.get(&address).map(|e| e.value().clone())
        }

        fn authorize(&self, address: PeerAddress, service: ServiceId) -> Option<Entity> {
            self.entity(address)
                .filter(|e| service == ServiceId::ENTITY || e.granted(service))
        }
    }

    struct Adder;

    impl SessionHandler for Adder {
        fn configure(&self, _: &Session, handlers: &mut Handlers) {
            handlers
                .handle(ADD, |_, mut m| {
                    let a = get_varint(m.reader())?;
                    let b = get_varint(m.reader())?;
                    let mut response = m.respond(SUM);
                    put_varint(response.writer(), a + b);
                    Ok(Some(response))
                })
                .handle(FAIL, |_, _| Err(HandlerError::new("division by zero")))
                .handle(SILENT, |_, _| Ok(None));
        }
    }

    /// Client-side counterpart: dials the server socket directly.
    struct Dialer {
        addr: SocketAddr,
        context: AuthContext,
        transponders: TransponderSet,
    }

    #[async_trait]
    impl Connector for Dialer {
        async fn open(&self, _host: PeerAddress) -> Result<Endpoint, ServiceError> {
            Ok(Endpoint::connect(self.addr).await?)
        }

        fn auth_context(&self) -> AuthContext {
            self.context.clone()
        }

        fn transponders(&self) -> TransponderSet {
            self.transponders.clone()
        }
    }

    struct Peer {
        keypair: Keypair,
        entities: Arc<Entities>,
    }

    impl Peer {
        fn new() -> Self {
            Self {
                keypair: Keypair::generate(),
                entities: Arc::default(),
            }
        }

        fn context(&self) -> AuthContext {
            AuthContext::new(
                Arc::new(self.keypair.clone()),
                None,
                Arc::clone(&self.entities) as Arc<dyn Authorizer>,
            )
        }
    }

    async fn serve(peer: &Peer) -> Arc<SessionServer> {
        SessionServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            peer.context(),
            TransponderSet::default(),
        )
        .await
        .unwrap()
    }

    fn dialer(client: &Peer, server: &SessionServer) -> Arc<dyn Connector> {
        Arc::new(Dialer {
            addr: server.local_addr(),
            context: client.context(),
            transponders: TransponderSet::default(),
        })
    }

    async fn add(session: &Session, a: u64, b: u64) -> Result<u64, ServiceError> {
        session
            .request(Duration::from_secs(5), |reply| {
                let mut request = Message::request(ADD);
                put_varint(request.writer(), a);
                put_varint(request.writer(), b);
                let listener = reply.listener(SUM, |mut m| Ok(get_varint(m.reader())?));
                (request, vec![listener])
            })
            .await
    }

    #[tokio::test]
    async fn test_public_service_roundtrip() {
        let host = Peer::new();
        let server = serve(&host).await;
        let address = ServiceAddress::new(ServiceId::random(), host.keypair.address());
        server.activate(Service::new(address, AuthMode::Public, || Arc::new(Adder)));

        let connector = dialer(&Peer::new(), &server);
        let session = Session::proxy(address, AuthMode::Public, Arc::new(()), Arc::downgrade(&connector));
        assert!(!session.is_open());
        assert_eq!(add(&session, 1, 1).await.unwrap(), 2);
        assert!(session.is_open());
        assert_eq!(add(&session, 20, 22).await.unwrap(), 42);

        session.close();
        assert!(!session.is_open());
        // The next call reconnects.
        assert_eq!(add(&session, 2, 3).await.unwrap(), 5);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_remote_failures_surface_as_execution() {
        let host = Peer::new();
        let server = serve(&host).await;
        let address = ServiceAddress::new(ServiceId::random(), host.keypair.address());
        server.activate(Service::new(address, AuthMode::Public, || Arc::new(Adder)));
        let connector = dialer(&Peer::new(), &server);
        let session = Session::proxy(address, AuthMode::Public, Arc::new(()), Arc::downgrade(&connector));

        let err = session
            .call(Duration::from_secs(5), Message::request(9), 9)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.to_string().contains("Unknown request: 9"));

        let err = session
            .call(Duration::from_secs(5), Message::request(FAIL), SUM)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.to_string().contains("Remote error: division by zero"));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_suppressed_response_times_out() {
        let host = Peer::new();
        let server = serve(&host).await;
        let address = ServiceAddress::new(ServiceId::random(), host.keypair.address());
        server.activate(Service::new(address, AuthMode::Public, || Arc::new(Adder)));
        let connector = dialer(&Peer::new(), &server);
        let session = Session::proxy(address, AuthMode::Public, Arc::new(()), Arc::downgrade(&connector));

        let err = session
            .call(Duration::from_millis(200), Message::request(SILENT), SILENT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        // The connection survives a timeout.
        assert_eq!(add(&session, 1, 2).await.unwrap(), 3);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_restricted_service_requires_grant() {
        let host = Peer::new();
        let granted = Peer::new();
        let stranger = Peer::new();
        let server = serve(&host).await;
        let address = ServiceAddress::new(ServiceId::random(), host.keypair.address());
        server.activate(Service::new(address, AuthMode::Restricted, || Arc::new(Adder)));

        let mut entity = Entity::new(granted.keypair.address(), "granted");
        entity.grant([address.id()], []);
        host.entities.0.insert(entity.address(), entity);
        host.entities.0.insert(
            stranger.keypair.address(),
            Entity::new(stranger.keypair.address(), "stranger"),
        );
        for client in [&granted, &stranger] {
            client.entities.0.insert(
                host.keypair.address(),
                Entity::new(host.keypair.address(), "host"),
            );
        }

        let connector = dialer(&granted, &server);
        let session = Session::proxy(address, AuthMode::Restricted, Arc::new(()), Arc::downgrade(&connector));
        assert_eq!(add(&session, 1, 1).await.unwrap(), 2);
        assert_eq!(session.entity().unwrap().address(), host.keypair.address());

        let connector = dialer(&stranger, &server);
        let session = Session::proxy(address, AuthMode::Restricted, Arc::new(()), Arc::downgrade(&connector));
        let err = add(&session, 1, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        server.shutdown();
    }

    #[derive(Default)]
    struct Hooks {
        connected: AtomicUsize,
        auth_failed: AtomicUsize,
        connect_failed: AtomicUsize,
    }

    struct Counting(Arc<Hooks>);

    impl SessionHandler for Counting {
        fn on_connected(&self, _: &Session) {
            self.0.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn authentication_failed(&self, _: &Session, _: &crate::auth::AuthError) {
            self.0.auth_failed.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_failed(&self, _: &Session, _: &ServiceError) {
            self.0.connect_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_each_attempt_fires_one_hook() {
        let host = Peer::new();
        let server = serve(&host).await;
        let address = ServiceAddress::new(ServiceId::random(), host.keypair.address());
        server.activate(Service::new(address, AuthMode::Public, || Arc::new(Adder)));
        let connector = dialer(&Peer::new(), &server);

        let hooks = Arc::new(Hooks::default());
        let session = Session::proxy(
            address,
            AuthMode::Public,
            Arc::new(Counting(Arc::clone(&hooks))),
            Arc::downgrade(&connector),
        );
        add(&session, 1, 1).await.unwrap();
        assert_eq!(hooks.connected.load(Ordering::SeqCst), 1);

        // Unknown service: the server drops the connection mid-handshake.
        let missing = ServiceAddress::new(ServiceId::random(), host.keypair.address());
        let session = Session::proxy(
            missing,
            AuthMode::Public,
            Arc::new(Counting(Arc::clone(&hooks))),
            Arc::downgrade(&connector),
        );
        assert_eq!(add(&session, 1, 1).await.unwrap_err().kind(), ErrorKind::Io);
        assert_eq!(hooks.auth_failed.load(Ordering::SeqCst), 1);

        // Nothing listening.
        server.shutdown();
        drop(server);
        let refused: Arc<dyn Connector> = Arc::new(Dialer {
            addr: "127.0.0.1:1".parse().unwrap(),
            context: Peer::new().context(),
            transponders: TransponderSet::default(),
        });
        let session = Session::proxy(
            address,
            AuthMode::Public,
            Arc::new(Counting(Arc::clone(&hooks))),
            Arc::downgrade(&refused),
        );
        assert_eq!(add(&session, 1, 1).await.unwrap_err().kind(), ErrorKind::Io);
        assert_eq!(hooks.connect_failed.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_stops_accepting() {
        let host = Peer::new();
        let server = serve(&host).await;
        let address = ServiceAddress::new(ServiceId::random(), host.keypair.address());
        server.activate(Service::new(address, AuthMode::Public, || Arc::new(Adder)));
        assert!(server.service(address.id()).is_some());
        let connector = dialer(&Peer::new(), &server);
        let session = Session::proxy(address, AuthMode::Public, Arc::new(()), Arc::downgrade(&connector));
        add(&session, 1, 1).await.unwrap();

        server.shutdown();
        for _ in 0..50 {
            if !session.is_open() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!session.is_open());
        assert!(add(&session, 1, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_deactivated_service_is_unreachable() {
        let host = Peer::new();
        let server = serve(&host).await;
        let address = ServiceAddress::new(ServiceId::random(), host.keypair.address());
        server.activate(Service::new(address, AuthMode::Public, || Arc::new(Adder)));
        assert_eq!(server.services().len(), 1);
        assert!(server.deactivate(address.id()).is_some());
        assert!(server.deactivate(address.id()).is_none());

        let connector = dialer(&Peer::new(), &server);
        let session = Session::proxy(address, AuthMode::Public, Arc::new(()), Arc::downgrade(&connector));
        assert!(add(&session, 1, 1).await.is_err());
        server.shutdown();
    }
}
