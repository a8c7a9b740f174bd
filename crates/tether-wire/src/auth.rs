//! Challenge-response authentication run before any session traffic.
//!
//! Every mode starts with the server proving its identity: the proxy sends a
//! random [`Challenge`], the server signs it, and the proxy checks the
//! signature, the signer and the echoed bytes. Restricted and Admin modes then
//! reverse the roles so the server can identify the client.
//!
//! | mode       | server proves                 | client proves                          |
//! |------------|-------------------------------|----------------------------------------|
//! | Public     | holds the service host's key  | nothing                                |
//! | Restricted | holds the service host's key  | is an entity granted the service       |
//! | System     | holds the system key          | nothing                                |
//! | Admin      | holds the service host's key  | holds the system key                   |

use crate::endpoint::{Endpoint, WireError};
use bytes::{Buf, BufMut};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tether_types::codec::{get_array, CodecError, Read, Write};
use tether_types::entity::Entity;
use tether_types::identity::{Keypair, PeerAddress, SignedData, PUBLIC_KEY_LEN};
use tether_types::service::{Scope, ServiceAddress, ServiceId};
use thiserror::Error;
use tracing::debug;

/// Size of a challenge nonce.
pub const CHALLENGE_LEN: usize = 16;

/// Why a handshake was rejected.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Handshake I/O failed: {0}")]
    Wire(#[from] WireError),
    #[error("Server proof rejected")]
    ServerProof,
    #[error("Client proof rejected")]
    ClientProof,
    #[error("No entity known for {0}")]
    UnknownEntity(PeerAddress),
    #[error("{peer} is not granted service {service}")]
    NotGranted { peer: PeerAddress, service: ServiceId },
    #[error("No system key configured")]
    NoSystemKey,
}

/// Which handshake a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMode {
    Public,
    Restricted,
    System,
    Admin,
}

impl From<Scope> for AuthMode {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Public => Self::Public,
            Scope::Restricted => Self::Restricted,
        }
    }
}

/// Entity lookups the Restricted handshake depends on.
pub trait Authorizer: Send + Sync {
    /// The entity registered for `address`.
    fn entity(&self, address: PeerAddress) -> Option<Entity>;

    /// The entity for `address` if it may use `service`.
    fn authorize(&self, address: PeerAddress, service: ServiceId) -> Option<Entity>;
}

/// A fresh random nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge([u8; CHALLENGE_LEN]);

impl Challenge {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; CHALLENGE_LEN] {
        &self.0
    }

    /// Checks that `proof` is a valid signature over exactly these bytes and
    /// returns the signer's address.
    pub fn verify(&self, proof: &SignedData) -> Option<PeerAddress> {
        let echoed: bool = proof.data().ct_eq(&self.0[..]).into();
        (echoed && proof.verify()).then(|| proof.signer())
    }
}

impl Write for Challenge {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }
}

impl Read for Challenge {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self(get_array(buf)?))
    }
}

/// Local identity and lookups shared by every handshake of one peer.
#[derive(Clone)]
pub struct AuthContext {
    keypair: Arc<Keypair>,
    system_key: Option<[u8; PUBLIC_KEY_LEN]>,
    authorizer: Arc<dyn Authorizer>,
}

impl AuthContext {
    pub fn new(
        keypair: Arc<Keypair>,
        system_key: Option<[u8; PUBLIC_KEY_LEN]>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            keypair,
            system_key,
            authorizer,
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn address(&self) -> PeerAddress {
        self.keypair.address()
    }

    fn is_system_key(&self, key: &[u8; PUBLIC_KEY_LEN]) -> bool {
        self.system_key
            .map(|system| bool::from(system[..].ct_eq(&key[..])))
            .unwrap_or(false)
    }
}

/// One handshake of a given mode.
pub struct Authenticator {
    mode: AuthMode,
    context: AuthContext,
}

impl Authenticator {
    pub fn new(mode: AuthMode, context: AuthContext) -> Self {
        Self { mode, context }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Runs the connecting side against the service at `target`. Returns the
    /// entity for the host when the mode resolves one.
    pub async fn authenticate_proxy(
        &self,
        endpoint: &mut Endpoint,
        target: ServiceAddress,
    ) -> Result<Option<Entity>, AuthError> {
        self.challenge_server(endpoint, target.host()).await?;

        match self.mode {
            AuthMode::Public | AuthMode::System => Ok(None),
            AuthMode::Restricted => {
                let entity = self
                    .context
                    .authorizer
                    .entity(target.host())
                    .ok_or(AuthError::UnknownEntity(target.host()))?;
                self.answer_challenge(endpoint).await?;
                Ok(Some(entity))
            }
            AuthMode::Admin => {
                self.answer_challenge(endpoint).await?;
                Ok(None)
            }
        }
    }

    /// Runs the accepting side for `service`. Returns the caller's entity
    /// in Restricted mode.
    pub async fn authenticate_server(
        &self,
        endpoint: &mut Endpoint,
        service: ServiceId,
    ) -> Result<Option<Entity>, AuthError> {
        self.answer_challenge(endpoint).await?;

        match self.mode {
            AuthMode::Public | AuthMode::System => Ok(None),
            AuthMode::Restricted => {
                let (peer, _) = self.challenge_client(endpoint).await?;
                let entity = self
                    .context
                    .authorizer
                    .authorize(peer, service)
                    .ok_or(AuthError::NotGranted { peer, service })?;
                debug!(peer = %peer, service = %service, "Client authorized");
                Ok(Some(entity))
            }
            AuthMode::Admin => {
                let (_, proof) = self.challenge_client(endpoint).await?;
                if !self.context.is_system_key(proof.public_key()) {
                    return Err(AuthError::ClientProof);
                }
                Ok(None)
            }
        }
    }

    /// Proxy side of the server proof.
    async fn challenge_server(
        &self,
        endpoint: &mut Endpoint,
        expected: PeerAddress,
    ) -> Result<(), AuthError> {
        if self.mode == AuthMode::System && self.context.system_key.is_none() {
            return Err(AuthError::NoSystemKey);
        }
        let challenge = Challenge::random();
        endpoint.write(&challenge).await?;
        let proof: SignedData = endpoint.read().await?;
        let signer = challenge.verify(&proof).ok_or(AuthError::ServerProof)?;

        let accepted = match self.mode {
            AuthMode::System => self.context.is_system_key(proof.public_key()),
            _ => signer == expected,
        };
        if !accepted {
            return Err(AuthError::ServerProof);
        }
        Ok(())
    }

    /// Server side of the client proof: returns the verified signer.
    async fn challenge_client(
        &self,
        endpoint: &mut Endpoint,
    ) -> Result<(PeerAddress, SignedData), AuthError> {
        let challenge = Challenge::random();
        endpoint.write(&challenge).await?;
        let proof: SignedData = endpoint.read().await?;
        let signer = challenge.verify(&proof).ok_or(AuthError::ClientProof)?;
        Ok((signer, proof))
    }

    /// Signs a challenge issued by the other side.
    async fn answer_challenge(&self, endpoint: &mut Endpoint) -> Result<(), AuthError> {
        let challenge: Challenge = endpoint.read().await?;
        endpoint
            .write(&self.context.keypair.sign(challenge.as_bytes()))
            .await?;
        Ok(())
    }
}
