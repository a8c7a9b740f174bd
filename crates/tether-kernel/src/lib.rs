//! Tether peer kernel.
//!
//! [`ServiceAdmin`] boots one peer: it loads its identity, binds the session
//! server, hosts the built-in exchange service and opens outbound connections
//! with retry. [`EntityManager`] tracks known remote peers and keeps grants
//! in sync through the exchange protocol.

pub mod admin;
pub mod config;
pub mod entity_manager;
pub mod error;

pub use admin::ServiceAdmin;
pub use entity_manager::{EntityEvent, EntityManager, Side, EXCHANGE_CODE};
pub use error::{KernelError, KernelResult};
