//! Tether session protocol.
//!
//! Peers talk over framed [`Endpoint`]s. Each connection starts with a
//! challenge-response handshake ([`auth`]) and then becomes a
//! [`Transponder`] multiplexing request/response [`Message`]s for one
//! [`Session`]. A [`SessionServer`] accepts inbound connections for locally
//! activated [`Service`]s.

pub mod auth;
pub mod endpoint;
pub mod message;
pub mod server;
pub mod session;
pub mod transponder;

pub use auth::{AuthContext, AuthError, AuthMode, Authenticator, Authorizer};
pub use endpoint::{Endpoint, WireError};
pub use message::Message;
pub use server::SessionServer;
pub use session::{
    Connector, HandlerError, Handlers, Reply, Service, Session, SessionHandler,
};
pub use transponder::{ResponseListener, Transponder, TransponderSet};
