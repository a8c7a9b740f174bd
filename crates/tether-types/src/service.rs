//! Service identifiers, addresses and scopes.

use crate::codec::{get_i64, get_u8, CodecError, Read, Write};
use crate::error::TypesError;
use crate::identity::PeerAddress;
use bytes::{Buf, BufMut};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque 64-bit service identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(i64);

impl ServiceId {
    /// Unused id, part of `ServiceAddress::NULL`.
    pub const NULL: ServiceId = ServiceId(0);
    /// The built-in entity exchange service.
    pub const ENTITY: ServiceId = ServiceId(-1);

    /// Generates a fresh positive id.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(1..=i64::MAX))
    }

    /// Accepts only positive ids; reserved values cannot be produced from input.
    pub fn new(value: i64) -> Result<Self, TypesError> {
        if value < 1 {
            return Err(TypesError::NonPositiveServiceId(value));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServiceId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s.trim().parse().map_err(|_| TypesError::Parse {
            kind: "service id",
            value: s.to_string(),
        })?;
        Self::new(value)
    }
}

impl Write for ServiceId {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.0);
    }
}

impl Read for ServiceId {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self(get_i64(buf)?))
    }
}

/// A service hosted by a specific peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceAddress {
    id: ServiceId,
    host: PeerAddress,
}

impl ServiceAddress {
    pub const NULL: ServiceAddress = ServiceAddress {
        id: ServiceId::NULL,
        host: PeerAddress::NULL,
    };

    pub fn new(id: ServiceId, host: PeerAddress) -> Self {
        Self { id, host }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn host(&self) -> PeerAddress {
        self.host
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.id)
    }
}

impl FromStr for ServiceAddress {
    type Err = TypesError;

    /// Parses `"<peer-address>:<service-id>"`. The text of
    /// [`ServiceAddress::NULL`] parses back to it; any other address needs
    /// a positive id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, id) = s.rsplit_once(':').ok_or_else(|| TypesError::Parse {
            kind: "service address",
            value: s.to_string(),
        })?;
        let host: PeerAddress = host.parse()?;
        if host == PeerAddress::NULL && id.trim() == "0" {
            return Ok(Self::NULL);
        }
        Ok(Self {
            id: id.parse()?,
            host,
        })
    }
}

impl Write for ServiceAddress {
    fn write(&self, buf: &mut impl BufMut) {
        self.id.write(buf);
        self.host.write(buf);
    }
}

impl Read for ServiceAddress {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            id: ServiceId::read(buf)?,
            host: PeerAddress::read(buf)?,
        })
    }
}

/// Authorization tier of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Anyone may connect.
    Public,
    /// Only entities granted the service may connect.
    Restricted,
}

impl Write for Scope {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(match self {
            Self::Public => 0,
            Self::Restricted => 1,
        });
    }
}

impl Read for Scope {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        match get_u8(buf)? {
            0 => Ok(Self::Public),
            1 => Ok(Self::Restricted),
            value => Err(CodecError::InvalidOrdinal {
                kind: "scope",
                value,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn test_reserved_ids() {
        assert_eq!(ServiceId::NULL.value(), 0);
        assert_eq!(ServiceId::ENTITY.value(), -1);
    }

    #[test]
    fn test_random_ids_are_positive() {
        for _ in 0..100 {
            assert!(ServiceId::random().value() > 0);
        }
    }

    #[test]
    fn test_parse_rejects_non_positive() {
        assert_eq!("42".parse::<ServiceId>().unwrap().value(), 42);
        assert_eq!(
            "0".parse::<ServiceId>(),
            Err(TypesError::NonPositiveServiceId(0))
        );
        assert_eq!(
            "-1".parse::<ServiceId>(),
            Err(TypesError::NonPositiveServiceId(-1))
        );
        assert!("abc".parse::<ServiceId>().is_err());
    }

    #[test]
    fn test_service_address_text_form() {
        let host = Keypair::generate().address();
        let address = ServiceAddress::new(ServiceId::new(7).unwrap(), host);
        let text = address.to_string();
        assert_eq!(text, format!("{host}:7"));
        assert_eq!(text.parse::<ServiceAddress>().unwrap(), address);
        assert!("no-separator".parse::<ServiceAddress>().is_err());
    }

    #[test]
    fn test_null_service_address_text_round_trips() {
        let text = ServiceAddress::NULL.to_string();
        assert_eq!(text.parse::<ServiceAddress>().unwrap(), ServiceAddress::NULL);

        let host = Keypair::generate().address();
        assert!(format!("{host}:0").parse::<ServiceAddress>().is_err());
        assert!(format!("{}:-1", PeerAddress::NULL)
            .parse::<ServiceAddress>()
            .is_err());
    }

    #[test]
    fn test_service_address_decode_truncated() {
        let address = ServiceAddress::new(ServiceId::random(), Keypair::generate().address());
        let bytes = address.encode();
        assert_eq!(ServiceAddress::decode(bytes.clone()).unwrap(), address);
        assert_eq!(
            ServiceAddress::decode(bytes.slice(..10)),
            Err(CodecError::EndOfBuffer)
        );
    }

    #[test]
    fn test_scope_rejects_unknown_ordinal() {
        let bytes = [9u8];
        assert_eq!(
            Scope::decode(&bytes[..]),
            Err(CodecError::InvalidOrdinal {
                kind: "scope",
                value: 9
            })
        );
    }
}
