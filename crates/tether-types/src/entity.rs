//! Entities: the local record of one remote peer and the services granted
//! in each direction.
//!
//! Both grant sets are immutable [`Services`] snapshots held behind an
//! `Arc`. Every change builds a new snapshot and swaps it in, so a reader
//! holding an older snapshot never sees a half-applied update.

use crate::codec::{
    get_blob, get_bool, get_i64, get_set, get_str, get_u8, put_blob, put_bool, put_set, put_str,
    CodecError, Read, Write,
};
use crate::descriptor::Descriptor;
use crate::identity::PeerAddress;
use crate::service::{ServiceAddress, ServiceId};
use bytes::{Buf, BufMut, Bytes};
use std::collections::BTreeSet;
use std::sync::Arc;

const SERIAL_VERSION: u8 = 0;

/// A versioned set of granted services.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Services {
    version: i64,
    ids: BTreeSet<ServiceId>,
    descriptors: BTreeSet<Descriptor>,
}

impl Services {
    pub fn new(
        version: i64,
        ids: impl IntoIterator<Item = ServiceId>,
        descriptors: impl IntoIterator<Item = Descriptor>,
    ) -> Self {
        Self {
            version,
            ids: ids.into_iter().collect(),
            descriptors: descriptors.into_iter().collect(),
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn ids(&self) -> &BTreeSet<ServiceId> {
        &self.ids
    }

    pub fn descriptors(&self) -> &BTreeSet<Descriptor> {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.descriptors.is_empty()
    }

    /// True if `id` is granted directly or through a descriptor.
    pub fn contains(&self, id: ServiceId) -> bool {
        self.ids.contains(&id) || self.content(id).is_some()
    }

    /// The descriptor published for `id`, if any.
    pub fn content(&self, id: ServiceId) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.address().id() == id)
    }

    /// A copy without the descriptors bound to `address`, or `None` if
    /// nothing would change.
    pub fn without(&self, address: ServiceAddress) -> Option<Self> {
        if !self.descriptors.iter().any(|d| d.address() == address) {
            return None;
        }
        Some(Self {
            version: self.version,
            ids: self.ids.clone(),
            descriptors: self
                .descriptors
                .iter()
                .filter(|d| d.address() != address)
                .cloned()
                .collect(),
        })
    }
}

impl Write for Services {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.version);
        put_set(buf, self.ids.iter());
        put_set(buf, self.descriptors.iter());
    }
}

impl Read for Services {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            version: get_i64(buf)?,
            ids: get_set(buf)?,
            descriptors: get_set(buf)?,
        })
    }
}

/// Payload of the exchange protocol: one side's exported services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeData(Arc<Services>);

impl ExchangeData {
    pub fn new(services: Arc<Services>) -> Self {
        Self(services)
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.0
    }
}

impl Write for ExchangeData {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl Read for ExchangeData {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self(Arc::new(Services::read(buf)?)))
    }
}

/// The local peer's record of one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    address: PeerAddress,
    name: String,
    pending: bool,
    exported: Arc<Services>,
    imported: Arc<Services>,
    ext: Bytes,
}

impl Entity {
    /// A newly introduced peer: pending, nothing granted either way.
    pub fn new(address: PeerAddress, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            pending: true,
            exported: Arc::default(),
            imported: Arc::default(),
            ext: Bytes::new(),
        }
    }

    pub fn address(&self) -> PeerAddress {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn set_pending(&mut self, pending: bool) {
        self.pending = pending;
    }

    /// Services the local peer grants to this entity.
    pub fn exported(&self) -> Arc<Services> {
        Arc::clone(&self.exported)
    }

    /// Services this entity grants to the local peer.
    pub fn imported(&self) -> Arc<Services> {
        Arc::clone(&self.imported)
    }

    /// Replaces the exported set, bumping its version and marking the
    /// relationship pending until the next exchange.
    pub fn grant(
        &mut self,
        ids: impl IntoIterator<Item = ServiceId>,
        descriptors: impl IntoIterator<Item = Descriptor>,
    ) {
        self.exported = Arc::new(Services::new(self.exported.version + 1, ids, descriptors));
        self.pending = true;
    }

    /// Whether the local peer grants `id` to this entity.
    pub fn granted(&self, id: ServiceId) -> bool {
        self.exported.contains(id)
    }

    /// Whether this entity grants `id` to the local peer.
    pub fn available(&self, id: ServiceId) -> bool {
        self.imported.contains(id)
    }

    pub fn available_content(&self, id: ServiceId) -> Option<&Descriptor> {
        self.imported.content(id)
    }

    /// Snapshot of the exported set to send to the remote side.
    pub fn exchange_data(&self) -> ExchangeData {
        ExchangeData::new(self.exported())
    }

    /// Adopts the remote side's exported set as our imported view and clears
    /// the pending flag.
    pub fn apply_exchange(&mut self, data: ExchangeData) {
        self.imported = data.0;
        self.pending = false;
    }

    /// Drops descriptors bound to `address` from the exported set, bumping
    /// its version. Returns `true` if anything was removed.
    pub fn remove_exported(&mut self, address: ServiceAddress) -> bool {
        match self.exported.without(address) {
            Some(mut exported) => {
                exported.version += 1;
                self.exported = Arc::new(exported);
                true
            }
            None => false,
        }
    }

    /// Drops descriptors bound to `address` from the imported set.
    pub fn remove_imported(&mut self, address: ServiceAddress) -> bool {
        match self.imported.without(address) {
            Some(imported) => {
                self.imported = Arc::new(imported);
                true
            }
            None => false,
        }
    }

    /// Drops every descriptor bound to `address` from both sets. Returns
    /// `true` if anything was removed.
    pub fn remove_service(&mut self, address: ServiceAddress) -> bool {
        let exported = self.remove_exported(address);
        let imported = self.remove_imported(address);
        exported || imported
    }
}

impl Write for Entity {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(SERIAL_VERSION);
        self.address.write(buf);
        put_str(buf, &self.name);
        put_bool(buf, self.pending);
        self.exported.write(buf);
        self.imported.write(buf);
        put_blob(buf, &self.ext);
    }
}

impl Read for Entity {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let version = get_u8(buf)?;
        if version != SERIAL_VERSION {
            return Err(CodecError::InvalidData(
                "entity",
                format!("unsupported serial version {version}"),
            ));
        }
        Ok(Self {
            address: PeerAddress::read(buf)?,
            name: get_str(buf)?,
            pending: get_bool(buf)?,
            exported: Arc::new(Services::read(buf)?),
            imported: Arc::new(Services::read(buf)?),
            ext: get_blob(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn service(host: PeerAddress, group: &str) -> Descriptor {
        Descriptor::basic(ServiceAddress::new(ServiceId::random(), host), group, 1)
    }

    #[test]
    fn test_new_entity_is_pending_and_empty() {
        let entity = Entity::new(Keypair::generate().address(), "bob");
        assert!(entity.is_pending());
        assert!(entity.exported().is_empty());
        assert!(entity.imported().is_empty());
        assert_eq!(entity.exported().version(), 0);
    }

    #[test]
    fn test_grant_bumps_version_and_sets_pending() {
        let host = Keypair::generate().address();
        let mut entity = Entity::new(Keypair::generate().address(), "bob");
        entity.set_pending(false);

        let d = service(host, "math");
        let id = d.address().id();
        entity.grant([], [d]);
        assert!(entity.is_pending());
        assert_eq!(entity.exported().version(), 1);
        assert!(entity.granted(id));
        assert!(!entity.available(id));

        entity.grant([ServiceId::ENTITY], []);
        assert_eq!(entity.exported().version(), 2);
        assert!(!entity.granted(id));
        assert!(entity.granted(ServiceId::ENTITY));
    }

    #[test]
    fn test_old_snapshot_survives_grant() {
        let mut entity = Entity::new(Keypair::generate().address(), "bob");
        let before = entity.exported();
        entity.grant([ServiceId::random()], []);
        assert!(before.is_empty());
        assert!(!entity.exported().is_empty());
    }

    #[test]
    fn test_apply_exchange() {
        let host = Keypair::generate().address();
        let mut alice = Entity::new(host, "alice");
        let d = service(host, "math");
        let id = d.address().id();
        alice.grant([], [d.clone()]);

        let mut bob = Entity::new(Keypair::generate().address(), "bob");
        bob.apply_exchange(alice.exchange_data());
        assert!(!bob.is_pending());
        assert!(bob.available(id));
        assert_eq!(bob.available_content(id), Some(&d));
    }

    #[test]
    fn test_remove_service_from_both_sets() {
        let host = Keypair::generate().address();
        let gone = service(host, "gone");
        let kept = service(host, "kept");

        let mut entity = Entity::new(Keypair::generate().address(), "bob");
        entity.grant([], [gone.clone(), kept.clone()]);
        entity.apply_exchange(ExchangeData::new(Arc::new(Services::new(
            4,
            [],
            [gone.clone()],
        ))));

        assert!(entity.remove_service(gone.address()));
        assert!(!entity.granted(gone.address().id()));
        assert!(entity.granted(kept.address().id()));
        assert!(!entity.available(gone.address().id()));
        assert_eq!(entity.exported().version(), 2);
        assert_eq!(entity.imported().version(), 4);

        assert!(!entity.remove_service(gone.address()));
        assert_eq!(entity.exported().version(), 2);
    }

    #[test]
    fn test_services_contains_by_id_or_descriptor() {
        let d = service(Keypair::generate().address(), "g");
        let direct = ServiceId::random();
        let services = Services::new(1, [direct], [d.clone()]);
        assert!(services.contains(direct));
        assert!(services.contains(d.address().id()));
        assert!(!services.contains(ServiceId::random()));
    }

    #[test]
    fn test_entity_decode() {
        let host = Keypair::generate().address();
        let mut entity = Entity::new(host, "carol");
        entity.grant([ServiceId::random()], [service(host, "g")]);
        let decoded = Entity::decode(entity.encode()).unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn test_entity_decode_rejects_truncated_and_trailing() {
        let entity = Entity::new(Keypair::generate().address(), "dave");
        let bytes = entity.encode();
        assert_eq!(
            Entity::decode(bytes.slice(..bytes.len() - 1)),
            Err(CodecError::EndOfBuffer)
        );
        let mut extra = bytes.to_vec();
        extra.push(0);
        assert_eq!(Entity::decode(&extra[..]), Err(CodecError::ExtraData(1)));
    }
}
