//! Kernel-specific error types.

use tether_types::error::{ServiceError, TypesError};
use tether_types::identity::PeerAddress;
use tether_wire::WireError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error(transparent)]
    Types(#[from] TypesError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The peer failed to start.
    #[error("Boot failed: {0}")]
    BootFailed(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(PeerAddress),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
