//! Sessions: the application-facing side of one conversation.
//!
//! A service session is created by the server for each accepted connection
//! and is bound to a local [`Service`]. A proxy session is created by the
//! caller and bound to a remote [`ServiceAddress`]; it connects lazily on the
//! first request through a [`Connector`].
//!
//! Behaviour is supplied by a [`SessionHandler`]. Its `configure` hook is the
//! only place request handlers can be registered and runs once, right after
//! the first successful handshake.

use crate::auth::{AuthContext, AuthError, AuthMode, Authenticator};
use crate::endpoint::{Endpoint, WireError};
use crate::message::Message;
use crate::transponder::{ResponseListener, Transponder, TransponderSet};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tether_types::codec::CodecError;
use tether_types::descriptor::Descriptor;
use tether_types::entity::Entity;
use tether_types::error::{ServiceError, ServiceResult, TypesError};
use tether_types::identity::PeerAddress;
use tether_types::service::{ServiceAddress, ServiceId};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Failure raised by a request handler. Sent back to the caller as an error
/// response.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<CodecError> for HandlerError {
    fn from(e: CodecError) -> Self {
        Self(e.to_string())
    }
}

impl From<TypesError> for HandlerError {
    fn from(e: TypesError) -> Self {
        Self(e.to_string())
    }
}

/// A request handler. Returning `Ok(None)` sends no response.
pub type HandlerFn =
    dyn Fn(&Session, Message) -> Result<Option<Message>, HandlerError> + Send + Sync;

/// Request handlers of one session, keyed by request code.
#[derive(Default)]
pub struct Handlers {
    table: HashMap<u8, Arc<HandlerFn>>,
}

impl Handlers {
    /// Registers `handler` for requests carrying `code`, replacing any
    /// earlier registration.
    pub fn handle<F>(&mut self, code: u8, handler: F) -> &mut Self
    where
        F: Fn(&Session, Message) -> Result<Option<Message>, HandlerError> + Send + Sync + 'static,
    {
        self.table.insert(code, Arc::new(handler));
        self
    }

    pub fn contains(&self, code: u8) -> bool {
        self.table.contains_key(&code)
    }

    fn get(&self, code: u8) -> Option<Arc<HandlerFn>> {
        self.table.get(&code).cloned()
    }
}

/// Lifecycle hooks of a session. Every hook defaults to doing nothing.
pub trait SessionHandler: Send + Sync + 'static {
    /// Registers request handlers. Runs once per session.
    fn configure(&self, _session: &Session, _handlers: &mut Handlers) {}

    /// The handshake succeeded and the connection is open.
    fn on_connected(&self, _session: &Session) {}

    /// The connection closed. `reason` is `None` for a local close.
    fn closed(&self, _session: &Session, _reason: Option<&WireError>) {}

    fn authentication_failed(&self, _session: &Session, _error: &AuthError) {}

    fn connection_failed(&self, _session: &Session, _error: &ServiceError) {}
}

impl SessionHandler for () {}

/// Opens outbound connections for proxy sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a transport to `host`.
    async fn open(&self, host: PeerAddress) -> Result<Endpoint, ServiceError>;

    fn auth_context(&self) -> AuthContext;

    fn transponders(&self) -> TransponderSet;
}

type HandlerFactory = dyn Fn() -> Arc<dyn SessionHandler> + Send + Sync;

/// A locally hosted service: its address, handshake mode and the factory
/// producing a handler for each accepted session.
#[derive(Clone)]
pub struct Service {
    address: ServiceAddress,
    mode: AuthMode,
    descriptor: Option<Descriptor>,
    factory: Arc<HandlerFactory>,
}

impl Service {
    pub fn new<F>(address: ServiceAddress, mode: AuthMode, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn SessionHandler> + Send + Sync + 'static,
    {
        Self {
            address,
            mode,
            descriptor: None,
            factory: Arc::new(factory),
        }
    }

    /// A service advertised by `descriptor`; the handshake mode follows its
    /// scope.
    pub fn described<F>(descriptor: Descriptor, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn SessionHandler> + Send + Sync + 'static,
    {
        Self {
            address: descriptor.address(),
            mode: descriptor.scope().into(),
            descriptor: Some(descriptor),
            factory: Arc::new(factory),
        }
    }

    pub fn address(&self) -> ServiceAddress {
        self.address
    }

    pub fn id(&self) -> ServiceId {
        self.address.id()
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref()
    }

    pub(crate) fn new_session(&self) -> Session {
        Session::new(self.address, self.mode, (self.factory)(), Role::Service)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("address", &self.address)
            .field("mode", &self.mode)
            .finish()
    }
}

enum Role {
    Service,
    Proxy(Weak<dyn Connector>),
}

struct SessionInner {
    id: u64,
    address: ServiceAddress,
    mode: AuthMode,
    role: Role,
    handler: Arc<dyn SessionHandler>,
    handlers: OnceLock<Handlers>,
    transponder: Mutex<Option<Transponder>>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// Handle to one conversation. Clones share the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    fn new(
        address: ServiceAddress,
        mode: AuthMode,
        handler: Arc<dyn SessionHandler>,
        role: Role,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                address,
                mode,
                role,
                handler,
                handlers: OnceLock::new(),
                transponder: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// A session to the remote service at `address`. Nothing is opened until
    /// the first request.
    pub fn proxy(
        address: ServiceAddress,
        mode: AuthMode,
        handler: Arc<dyn SessionHandler>,
        connector: Weak<dyn Connector>,
    ) -> Self {
        Self::new(address, mode, handler, Role::Proxy(connector))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The service this session talks to or serves.
    pub fn address(&self) -> ServiceAddress {
        self.inner.address
    }

    pub fn mode(&self) -> AuthMode {
        self.inner.mode
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.inner.role, Role::Proxy(_))
    }

    pub fn is_open(&self) -> bool {
        self.current().is_some()
    }

    /// The entity resolved by a Restricted handshake.
    pub fn entity(&self) -> Option<Entity> {
        self.current().and_then(|t| t.entity().cloned())
    }

    /// Address of the remote peer, when known.
    pub fn peer(&self) -> Option<PeerAddress> {
        match self.inner.role {
            Role::Proxy(_) => Some(self.inner.address.host()),
            Role::Service => self.current().and_then(|t| t.peer()),
        }
    }

    /// Closes the connection, if any. Safe to call repeatedly.
    pub fn close(&self) {
        let transponder = self
            .inner
            .transponder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(transponder) = transponder {
            transponder.close();
        }
    }

    /// Sends a request built by `body` and waits up to `timeout` for one of
    /// its listeners to resolve the [`Reply`].
    pub async fn request<T, F>(&self, timeout: Duration, body: F) -> ServiceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Reply<T>) -> (Message, Vec<ResponseListener>),
    {
        let transponder = self.transponder().await?;
        let (reply, rx) = Reply::channel();
        let (message, listeners) = body(reply);
        let uid = message.uid();

        transponder.request(&message, listeners).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ServiceError::io(
                ErrorKind::ConnectionAborted,
                "Connection closed",
            )),
            Err(_) => {
                transponder.forget(uid);
                debug!(service = %self.inner.address, uid, "Request timed out");
                Err(ServiceError::Timeout(timeout))
            }
        }
    }

    /// Like [`Session::request`] for operations with no result value.
    pub async fn submit<F>(&self, timeout: Duration, body: F) -> ServiceResult<()>
    where
        F: FnOnce(Reply<()>) -> (Message, Vec<ResponseListener>),
    {
        self.request(timeout, body).await
    }

    /// Sends `message` and returns the response carrying `expect_code`.
    pub async fn call(
        &self,
        timeout: Duration,
        message: Message,
        expect_code: u8,
    ) -> ServiceResult<Message> {
        self.request(timeout, |reply| {
            let listener = reply.listener(expect_code, Ok);
            (message, vec![listener])
        })
        .await
    }

    fn current(&self) -> Option<Transponder> {
        self.inner
            .transponder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|t| t.is_open())
            .cloned()
    }

    /// The open transponder, connecting first for proxy sessions.
    async fn transponder(&self) -> ServiceResult<Transponder> {
        if let Some(open) = self.current() {
            return Ok(open);
        }
        let Role::Proxy(connector) = &self.inner.role else {
            return Err(ServiceError::io(ErrorKind::NotConnected, "Not connected"));
        };

        let _connecting = self.inner.connect_lock.lock().await;
        if let Some(open) = self.current() {
            return Ok(open);
        }
        let Some(connector) = connector.upgrade() else {
            let err = ServiceError::io(ErrorKind::NotConnected, "Peer shut down");
            self.inner.handler.connection_failed(self, &err);
            return Err(err);
        };

        let endpoint = match connector.open(self.inner.address.host()).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.inner.handler.connection_failed(self, &e);
                return Err(e);
            }
        };
        let authenticator = Authenticator::new(self.inner.mode, connector.auth_context());
        Transponder::connect_proxy(endpoint, self.clone(), authenticator, connector.transponders())
            .await
    }

    pub(crate) fn handler_for(&self, code: u8) -> Option<Arc<HandlerFn>> {
        self.inner.handlers.get().and_then(|h| h.get(code))
    }

    /// Attaches an open transponder, configures handlers on first use and
    /// fires `on_connected`.
    pub(crate) fn connected(&self, transponder: &Transponder) {
        *self
            .inner
            .transponder
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(transponder.clone());
        self.inner.handlers.get_or_init(|| {
            let mut handlers = Handlers::default();
            self.inner.handler.configure(self, &mut handlers);
            handlers
        });
        self.inner.handler.on_connected(self);
    }

    pub(crate) fn closed(&self, transponder: &Transponder, reason: Option<&WireError>) {
        {
            let mut current = self
                .inner
                .transponder
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if current.as_ref().map(Transponder::id) == Some(transponder.id()) {
                current.take();
            }
        }
        self.inner.handler.closed(self, reason);
    }

    pub(crate) fn authentication_failed(&self, error: &AuthError) {
        self.inner.handler.authentication_failed(self, error);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("proxy", &self.is_proxy())
            .finish()
    }
}

/// Completion handle for one request. The first resolution wins; later
/// ones are ignored.
pub struct Reply<T> {
    tx: Arc<Mutex<Option<oneshot::Sender<ServiceResult<T>>>>>,
}

impl<T> Clone for Reply<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Send + 'static> Reply<T> {
    fn channel() -> (Self, oneshot::Receiver<ServiceResult<T>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn resolve(&self, result: ServiceResult<T>) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }

    pub fn complete(&self, value: T) {
        self.resolve(Ok(value));
    }

    pub fn fail(&self, error: ServiceError) {
        self.resolve(Err(error));
    }

    /// A listener for responses carrying `code`. Error responses resolve the
    /// reply with [`ServiceError::Execution`]; others go through `parse`.
    pub fn listener<F>(&self, code: u8, parse: F) -> ResponseListener
    where
        F: FnOnce(Message) -> ServiceResult<T> + Send + 'static,
    {
        let reply = self.clone();
        ResponseListener::new(code, move |message| {
            let result = if message.is_error() {
                Err(ServiceError::Execution(
                    message.error_text().unwrap_or_default(),
                ))
            } else {
                parse(message)
            };
            reply.resolve(result);
        })
    }
}
