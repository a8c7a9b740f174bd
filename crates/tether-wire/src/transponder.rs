//! One authenticated connection, multiplexing requests and responses.
//!
//! A single reader task decodes messages. Requests are answered with the
//! session's handler for their code; responses are matched by `uid` against
//! the table of outstanding listeners and delivered on a spawned task. Writes
//! are serialized through an async mutex around the write half.

use crate::auth::{AuthContext, AuthError, Authenticator};
use crate::endpoint::{Endpoint, EndpointReader, EndpointWriter, WireError};
use crate::message::Message;
use crate::session::{Service, Session};
use dashmap::DashMap;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tether_types::entity::Entity;
use tether_types::error::ServiceError;
use tether_types::identity::PeerAddress;
use tether_types::service::{ServiceAddress, ServiceId};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static NEXT_TRANSPONDER_ID: AtomicU64 = AtomicU64::new(1);

/// How long an inbound client may take to name a service and authenticate.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Locally hosted services, keyed by id.
pub type ServiceTable = Arc<DashMap<ServiceId, Service>>;

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Authenticating,
    Open,
    Closed,
}

/// Callback for one expected response code of an outstanding request.
pub struct ResponseListener {
    code: u8,
    callback: Box<dyn FnOnce(Message) + Send>,
}

impl ResponseListener {
    pub fn new(code: u8, callback: impl FnOnce(Message) + Send + 'static) -> Self {
        Self {
            code,
            callback: Box::new(callback),
        }
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn invoke(self, message: Message) {
        (self.callback)(message)
    }
}

impl std::fmt::Debug for ResponseListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseListener")
            .field("code", &self.code)
            .finish()
    }
}

type PendingTable = HashMap<i64, Vec<ResponseListener>>;

struct TransponderInner {
    id: u64,
    state: Mutex<State>,
    remote: Option<SocketAddr>,
    writer: tokio::sync::Mutex<Option<EndpointWriter>>,
    pending: Mutex<Option<PendingTable>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    session: Mutex<Option<Session>>,
    entity: OnceLock<Entity>,
    peer: OnceLock<PeerAddress>,
    set: TransponderSet,
}

/// Handle to one connection. Clones share the connection.
#[derive(Clone)]
pub struct Transponder {
    inner: Arc<TransponderInner>,
}

impl Transponder {
    fn new(remote: Option<SocketAddr>, set: TransponderSet) -> Self {
        Self {
            inner: Arc::new(TransponderInner {
                id: NEXT_TRANSPONDER_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(State::Connecting),
                remote,
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(Some(HashMap::new())),
                reader: Mutex::new(None),
                session: Mutex::new(None),
                entity: OnceLock::new(),
                peer: OnceLock::new(),
                set,
            }),
        }
    }

    /// Connects `session` to its remote service over `endpoint`: sends the
    /// target id, runs the proxy handshake and starts reading.
    pub async fn connect_proxy(
        mut endpoint: Endpoint,
        session: Session,
        authenticator: Authenticator,
        set: TransponderSet,
    ) -> Result<Transponder, ServiceError> {
        let target = session.address();
        let transponder = Self::new(endpoint.peer_addr(), set);
        transponder.set_state(State::Authenticating);

        match handshake_proxy(&mut endpoint, &authenticator, target).await {
            Ok(entity) => {
                let _ = transponder.inner.peer.set(target.host());
                transponder.open(endpoint, session, entity).await;
                Ok(transponder)
            }
            Err(e) => {
                warn!(service = %target, error = %e, "Proxy handshake failed");
                transponder.set_state(State::Closed);
                session.authentication_failed(&e);
                Err(ServiceError::io(
                    ErrorKind::ConnectionAborted,
                    "Authentication failed",
                ))
            }
        }
    }

    /// Accepts a connection: reads the requested service id, runs the
    /// server handshake for that service and starts reading. The client has
    /// [`HANDSHAKE_TIMEOUT`] to get through the handshake.
    pub async fn connect_server(
        endpoint: Endpoint,
        services: &ServiceTable,
        context: &AuthContext,
        set: TransponderSet,
    ) -> Result<Transponder, WireError> {
        Self::connect_server_within(endpoint, services, context, set, HANDSHAKE_TIMEOUT).await
    }

    pub async fn connect_server_within(
        mut endpoint: Endpoint,
        services: &ServiceTable,
        context: &AuthContext,
        set: TransponderSet,
        deadline: Duration,
    ) -> Result<Transponder, WireError> {
        let transponder = Self::new(endpoint.peer_addr(), set);
        let handshake = async {
            let id: ServiceId = endpoint.read().await?;
            let service = services
                .get(&id)
                .map(|s| s.value().clone())
                .ok_or(WireError::UnknownService(id))?;

            let session = service.new_session();
            transponder.set_state(State::Authenticating);
            let authenticator = Authenticator::new(service.mode(), context.clone());
            let outcome = authenticator.authenticate_server(&mut endpoint, id).await;
            Ok::<_, WireError>((session, outcome))
        };
        let finished = tokio::time::timeout(deadline, handshake).await;
        let Ok(handshake) = finished else {
            transponder.set_state(State::Closed);
            warn!(remote = ?transponder.inner.remote, "Handshake timed out");
            return Err(WireError::HandshakeTimeout(deadline));
        };
        let (session, outcome) = handshake?;

        match outcome {
            Ok(entity) => {
                transponder.open(endpoint, session, entity).await;
                Ok(transponder)
            }
            Err(e) => {
                transponder.set_state(State::Closed);
                session.authentication_failed(&e);
                Err(WireError::HandshakeFailed(e.to_string()))
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> State {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote
    }

    /// The entity resolved by a Restricted handshake.
    pub fn entity(&self) -> Option<&Entity> {
        self.inner.entity.get()
    }

    pub fn peer(&self) -> Option<PeerAddress> {
        self.inner.peer.get().copied()
    }

    fn set_state(&self, state: State) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    async fn open(&self, endpoint: Endpoint, session: Session, entity: Option<Entity>) {
        if let Some(entity) = entity {
            let _ = self.inner.peer.set(entity.address());
            let _ = self.inner.entity.set(entity);
        }
        let (reader, writer) = endpoint.into_split();
        *self.inner.writer.lock().await = Some(writer);
        *self.inner.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        self.set_state(State::Open);
        self.inner.set.insert(self.clone());

        debug!(
            transponder = self.inner.id,
            service = %session.address(),
            remote = ?self.inner.remote,
            "Connection open"
        );
        session.connected(self);

        let this = self.clone();
        let handle = tokio::spawn(async move { this.read_loop(reader).await });
        *self.inner.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Registers `listeners` under the message uid, then writes it.
    pub async fn request(
        &self,
        message: &Message,
        listeners: Vec<ResponseListener>,
    ) -> Result<(), WireError> {
        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            let table = pending.as_mut().ok_or(WireError::NotConnected)?;
            table.insert(message.uid(), listeners);
        }
        if let Err(e) = self.write(message).await {
            self.forget(message.uid());
            return Err(e);
        }
        Ok(())
    }

    /// Drops the listeners registered for `uid`. A later response for it is
    /// discarded.
    pub fn forget(&self, uid: i64) -> bool {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
            .and_then(|table| table.remove(&uid))
            .is_some()
    }

    pub async fn write(&self, message: &Message) -> Result<(), WireError> {
        if !self.is_open() {
            return Err(WireError::NotConnected);
        }
        let mut writer = self.inner.writer.lock().await;
        writer
            .as_mut()
            .ok_or(WireError::NotConnected)?
            .write(message)
            .await
    }

    /// Closes the connection. Safe to call repeatedly.
    pub fn close(&self) {
        self.terminate(None);
    }

    fn terminate(&self, reason: Option<WireError>) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == State::Closed {
                return;
            }
            *state = State::Closed;
        }

        // Dropping the listeners drops every waiting reply.
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reader) = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            reader.abort();
        }
        match self.inner.writer.try_lock() {
            Ok(mut writer) => {
                writer.take();
            }
            Err(_) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    inner.writer.lock().await.take();
                });
            }
        }

        self.inner.set.remove(self.inner.id);
        let session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match &reason {
            Some(e) => info!(transponder = self.inner.id, reason = %e, "Connection closed"),
            None => debug!(transponder = self.inner.id, "Connection closed locally"),
        }
        if let Some(session) = session {
            session.closed(self, reason.as_ref());
        }
    }

    fn session(&self) -> Option<Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn read_loop(self, mut reader: EndpointReader) {
        let reason = loop {
            match reader.read::<Message>().await {
                Ok(message) if message.is_request() => self.dispatch_request(message).await,
                Ok(message) => self.dispatch_response(message),
                Err(WireError::Codec(e)) => {
                    warn!(transponder = self.inner.id, error = %e, "Dropping malformed frame");
                }
                Err(e) => break e,
            }
        };
        self.terminate(Some(reason));
    }

    async fn dispatch_request(&self, message: Message) {
        let Some(session) = self.session() else {
            return;
        };
        let uid = message.uid();
        let code = message.code();
        let response = match session.handler_for(code) {
            None => Some(Message::error_for(uid, &format!("Unknown request: {code}"))),
            Some(handler) => match handler(&session, message) {
                Ok(response) => response,
                Err(e) => Some(Message::error_for(uid, &format!("Remote error: {e}"))),
            },
        };
        if let Some(response) = response {
            if let Err(e) = self.write(&response).await {
                debug!(transponder = self.inner.id, uid, error = %e, "Failed to write response");
            }
        }
    }

    fn dispatch_response(&self, message: Message) {
        let listeners = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
            .and_then(|table| table.remove(&message.uid()));
        let Some(listeners) = listeners else {
            debug!(transponder = self.inner.id, uid = message.uid(), "Dropping unmatched response");
            return;
        };

        let mut listeners = listeners.into_iter();
        let chosen = if message.is_error() {
            listeners.next()
        } else {
            listeners.find(|l| l.code == message.code())
        };
        match chosen {
            Some(listener) => {
                tokio::spawn(async move { listener.invoke(message) });
            }
            None => debug!(
                transponder = self.inner.id,
                code = message.code(),
                "No listener for response code"
            ),
        }
    }
}

impl std::fmt::Debug for Transponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transponder")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

async fn handshake_proxy(
    endpoint: &mut Endpoint,
    authenticator: &Authenticator,
    target: ServiceAddress,
) -> Result<Option<Entity>, AuthError> {
    endpoint.write(&target.id()).await?;
    authenticator.authenticate_proxy(endpoint, target).await
}

/// Every live transponder of a peer, for bulk shutdown.
#[derive(Clone, Default)]
pub struct TransponderSet {
    inner: Arc<Mutex<HashMap<u64, Transponder>>>,
}

impl TransponderSet {
    fn insert(&self, transponder: Transponder) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(transponder.id(), transponder);
    }

    fn remove(&self, id: u64) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every live transponder.
    pub fn close_all(&self) {
        let drained: Vec<Transponder> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, t)| t)
            .collect();
        for transponder in drained {
            transponder.close();
        }
    }
}
