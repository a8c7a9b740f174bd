//! Known remote peers and the exchange protocol that keeps grants in sync.
//!
//! Every peer runs a Restricted service on [`ServiceId::ENTITY`]. An exchange
//! is one request/response on it: the initiator sends its exported set, the
//! responder adopts it as its imported view and, if its own record of the
//! initiator was still pending, answers with its exported set in the same
//! round trip. Both sides then clear `pending`.

use crate::error::{KernelError, KernelResult};
use dashmap::DashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tether_types::codec::{get_bool, put_bool};
use tether_types::descriptor::Descriptor;
use tether_types::entity::{Entity, ExchangeData};
use tether_types::error::{ServiceError, ServiceResult};
use tether_types::identity::PeerAddress;
use tether_types::service::{ServiceAddress, ServiceId};
use tether_wire::{
    AuthMode, Authorizer, Connector, HandlerError, Handlers, Message, Service, Session,
    SessionHandler,
};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Request and response code of the exchange.
pub const EXCHANGE_CODE: u8 = 100;

const EVENT_CAPACITY: usize = 256;

/// Changes to the entity set.
#[derive(Debug, Clone)]
pub enum EntityEvent {
    Added(Entity),
    Updated(Entity),
    Deleted(PeerAddress),
    PendingChanged { address: PeerAddress, pending: bool },
    /// An exchange completed and its result is stored.
    Exchanged(Entity),
}

/// Which set a deleted service is removed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// A remote service we consume: drop it from the imported sets.
    Proxy,
    /// A local service: drop it from the exported sets.
    Service,
}

pub struct EntityManager {
    entities: DashMap<PeerAddress, Entity>,
    sessions: DashMap<PeerAddress, Session>,
    events: broadcast::Sender<EntityEvent>,
    connector: OnceLock<Weak<dyn Connector>>,
    exchange_timeout: Duration,
    this: Weak<EntityManager>,
}

impl EntityManager {
    pub fn new(exchange_timeout: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|this| Self {
            entities: DashMap::new(),
            sessions: DashMap::new(),
            events,
            connector: OnceLock::new(),
            exchange_timeout,
            this: this.clone(),
        })
    }

    /// Sets the connector used to reach remote exchange services. Only the
    /// first call has any effect.
    pub fn attach(&self, connector: Weak<dyn Connector>) {
        let _ = self.connector.set(connector);
    }

    /// The built-in exchange service hosted at `host`.
    pub fn exchange_service(&self, host: PeerAddress) -> Service {
        let manager = self.this.clone();
        Service::new(
            ServiceAddress::new(ServiceId::ENTITY, host),
            AuthMode::Restricted,
            move || {
                Arc::new(ExchangeHandler {
                    manager: manager.clone(),
                }) as Arc<dyn SessionHandler>
            },
        )
    }

    /// Receives every subsequent [`EntityEvent`]. Drop the receiver to
    /// unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: EntityEvent) {
        let _ = self.events.send(event);
    }

    pub fn entity(&self, address: PeerAddress) -> Option<Entity> {
        self.entities.get(&address).map(|e| e.value().clone())
    }

    /// All known entities, ordered by name.
    pub fn entities(&self) -> Vec<Entity> {
        let mut all: Vec<Entity> = self.entities.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()).then(a.address().cmp(&b.address())));
        all
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Registers `entity`, replacing any record for the same address, and
    /// starts an exchange with it.
    pub fn add(&self, entity: Entity) {
        let address = entity.address();
        info!(peer = %address, name = entity.name(), "Entity added");
        self.entities.insert(address, entity.clone());
        self.emit(EntityEvent::Added(entity));
        self.exchange(address);
    }

    /// Replaces the record of a known entity and starts an exchange with it.
    pub fn update(&self, entity: Entity) -> KernelResult<()> {
        let address = entity.address();
        match self.entities.get_mut(&address) {
            Some(mut current) => *current = entity.clone(),
            None => return Err(KernelError::UnknownEntity(address)),
        }
        self.emit(EntityEvent::Updated(entity));
        self.exchange(address);
        Ok(())
    }

    /// Forgets `address` and closes any exchange session with it.
    pub fn delete(&self, address: PeerAddress) -> Option<Entity> {
        let removed = self.entities.remove(&address).map(|(_, e)| e);
        if let Some((_, session)) = self.sessions.remove(&address) {
            session.close();
        }
        if removed.is_some() {
            info!(peer = %address, "Entity deleted");
            self.emit(EntityEvent::Deleted(address));
        }
        removed
    }

    /// Grants `ids` and `descriptors` to `address`, replacing the previous
    /// grant, and pushes the new set to the peer.
    pub fn grant(
        &self,
        address: PeerAddress,
        ids: impl IntoIterator<Item = ServiceId>,
        descriptors: impl IntoIterator<Item = Descriptor>,
    ) -> KernelResult<()> {
        let (entity, was_pending) = {
            let mut entity = self
                .entities
                .get_mut(&address)
                .ok_or(KernelError::UnknownEntity(address))?;
            let was_pending = entity.is_pending();
            entity.grant(ids, descriptors);
            (entity.value().clone(), was_pending)
        };
        debug!(peer = %address, version = entity.exported().version(), "Grant updated");
        if !was_pending {
            self.emit(EntityEvent::PendingChanged {
                address,
                pending: true,
            });
        }
        self.emit(EntityEvent::Updated(entity));
        self.exchange(address);
        Ok(())
    }

    /// Removes the service at `address` from one side of every entity.
    pub fn deleted(&self, side: Side, address: ServiceAddress) {
        self.for_each_changed(|entity| match side {
            Side::Proxy => entity.remove_imported(address),
            Side::Service => entity.remove_exported(address),
        });
    }

    /// Removes the service at `address` from both sides of every entity.
    pub fn purge(&self, address: ServiceAddress) {
        self.for_each_changed(|entity| entity.remove_service(address));
    }

    fn for_each_changed(&self, mut change: impl FnMut(&mut Entity) -> bool) {
        let mut changed = Vec::new();
        for mut entry in self.entities.iter_mut() {
            if change(entry.value_mut()) {
                changed.push(entry.value().clone());
            }
        }
        for entity in changed {
            self.emit(EntityEvent::Updated(entity));
        }
    }

    /// The entity for `address` if it may open `service`. The exchange
    /// service is open to every known entity.
    pub fn authenticate(&self, address: PeerAddress, service: ServiceId) -> Option<Entity> {
        self.entity(address)
            .filter(|e| service == ServiceId::ENTITY || e.granted(service))
    }

    /// Starts an exchange with `address` in the background. Failures, such
    /// as the peer being offline, are logged and dropped.
    pub fn exchange(&self, address: PeerAddress) {
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = manager.exchange_now(address).await {
                debug!(peer = %address, error = %e, "Exchange failed");
            }
        });
    }

    /// Runs one exchange with `address` and waits for it to finish.
    pub async fn exchange_now(&self, address: PeerAddress) -> ServiceResult<()> {
        let entity = self
            .entity(address)
            .ok_or(ServiceError::Unregistered(address))?;
        let session = self.session_for(address)?;
        let data = entity.exchange_data();
        let manager = self.this.clone();

        session
            .submit(self.exchange_timeout, move |reply| {
                let mut request = Message::request(EXCHANGE_CODE);
                request.put(&data);
                let listener = reply.listener(EXCHANGE_CODE, move |mut response| {
                    let received = if get_bool(response.reader())? {
                        Some(response.get::<ExchangeData>()?)
                    } else {
                        None
                    };
                    if let Some(manager) = manager.upgrade() {
                        manager.exchanged(address, received);
                    }
                    Ok(())
                });
                (request, vec![listener])
            })
            .await
    }

    /// The cached exchange session with `address`, or a new proxy session.
    fn session_for(&self, address: PeerAddress) -> ServiceResult<Session> {
        if let Some(session) = self.sessions.get(&address) {
            return Ok(session.value().clone());
        }
        let connector = self
            .connector
            .get()
            .cloned()
            .ok_or_else(|| ServiceError::io(std::io::ErrorKind::NotConnected, "No connector"))?;
        let handler = Arc::new(ExchangeHandler {
            manager: self.this.clone(),
        });
        let session = self
            .sessions
            .entry(address)
            .or_insert_with(|| {
                Session::proxy(
                    ServiceAddress::new(ServiceId::ENTITY, address),
                    AuthMode::Restricted,
                    handler,
                    connector,
                )
            })
            .value()
            .clone();
        Ok(session)
    }

    /// Responder side: adopts the initiator's exported set and returns our
    /// own exported set if our record of the initiator was still pending.
    fn receive_exchange(
        &self,
        address: PeerAddress,
        data: ExchangeData,
    ) -> Result<Option<ExchangeData>, HandlerError> {
        let (entity, reply) = {
            let mut entity = self
                .entities
                .get_mut(&address)
                .ok_or_else(|| HandlerError::new(format!("Unknown entity: {address}")))?;
            let reply = entity.is_pending().then(|| entity.exchange_data());
            entity.apply_exchange(data);
            (entity.value().clone(), reply)
        };
        self.finish_exchange(entity, reply.is_some());
        Ok(reply)
    }

    /// Initiator side: adopts the responder's set, if it sent one.
    fn exchanged(&self, address: PeerAddress, data: Option<ExchangeData>) {
        let result = self.entities.get_mut(&address).map(|mut entity| {
            let was_pending = entity.is_pending();
            match data {
                Some(data) => entity.apply_exchange(data),
                None => entity.set_pending(false),
            }
            (entity.value().clone(), was_pending)
        });
        if let Some((entity, was_pending)) = result {
            self.finish_exchange(entity, was_pending);
        }
    }

    fn finish_exchange(&self, entity: Entity, was_pending: bool) {
        debug!(
            peer = %entity.address(),
            imported = entity.imported().version(),
            "Exchange applied"
        );
        if was_pending {
            self.emit(EntityEvent::PendingChanged {
                address: entity.address(),
                pending: false,
            });
        }
        self.emit(EntityEvent::Exchanged(entity));
    }

    /// Closes every exchange session and empties the cache.
    pub fn shutdown(&self) {
        let sessions: Vec<Session> = self.sessions.iter().map(|s| s.value().clone()).collect();
        self.sessions.clear();
        for session in sessions {
            session.close();
        }
    }

    fn cache(&self, session: &Session) {
        let Some(peer) = session.peer() else {
            return;
        };
        self.sessions
            .entry(peer)
            .and_modify(|cached| {
                if cached.id() != session.id() && !cached.is_open() {
                    *cached = session.clone();
                }
            })
            .or_insert_with(|| session.clone());
    }

    fn evict(&self, session: &Session) {
        if let Some(peer) = session.peer() {
            self.sessions
                .remove_if(&peer, |_, cached| cached.id() == session.id());
        }
    }
}

impl Authorizer for EntityManager {
    fn entity(&self, address: PeerAddress) -> Option<Entity> {
        EntityManager::entity(self, address)
    }

    fn authorize(&self, address: PeerAddress, service: ServiceId) -> Option<Entity> {
        self.authenticate(address, service)
    }
}

/// Session hooks of the exchange service, on both the proxy and the
/// service side.
struct ExchangeHandler {
    manager: Weak<EntityManager>,
}

impl SessionHandler for ExchangeHandler {
    fn configure(&self, _session: &Session, handlers: &mut Handlers) {
        let manager = self.manager.clone();
        handlers.handle(EXCHANGE_CODE, move |session, mut request| {
            let manager = manager
                .upgrade()
                .ok_or_else(|| HandlerError::new("Peer shut down"))?;
            let peer = session
                .peer()
                .ok_or_else(|| HandlerError::new("Unauthenticated exchange"))?;
            let data: ExchangeData = request.get()?;
            let reply = manager.receive_exchange(peer, data)?;

            let mut response = request.respond(EXCHANGE_CODE);
            put_bool(response.writer(), reply.is_some());
            if let Some(reply) = &reply {
                response.put(reply);
            }
            Ok(Some(response))
        });
    }

    fn on_connected(&self, session: &Session) {
        if let Some(manager) = self.manager.upgrade() {
            manager.cache(session);
        }
    }

    fn closed(&self, session: &Session, _reason: Option<&tether_wire::WireError>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.evict(session);
        }
    }

    fn authentication_failed(&self, session: &Session, _error: &tether_wire::AuthError) {
        if let Some(manager) = self.manager.upgrade() {
            manager.evict(session);
        }
    }

    fn connection_failed(&self, session: &Session, _error: &ServiceError) {
        if let Some(manager) = self.manager.upgrade() {
            manager.evict(session);
        }
    }
}
