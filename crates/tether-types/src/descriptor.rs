//! Service descriptors: the metadata a peer publishes for one service.

use crate::codec::{
    get_blob, get_i32, get_str, get_u8, put_blob, put_str, CodecError, Read, Write,
};
use crate::error::TypesError;
use crate::service::{Scope, ServiceAddress};
use bytes::{Buf, BufMut, Bytes};
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

/// Brand keyword that service titles may not contain.
pub const RESERVED_KEYWORD: &str = "tether";
/// Maximum title length, in characters.
pub const MAX_TITLE_LEN: usize = 15;
/// Maximum blurb length, in characters.
pub const MAX_BLURB_LEN: usize = 140;
/// Maximum number of tags parsed from a descriptor.
pub const MAX_TAGS: usize = 5;

const VERSION_0: u8 = 0;

/// Human-facing summary of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Description {
    title: String,
    blurb: String,
    image: Bytes,
}

impl Description {
    /// Builds a description, cropping title and blurb to their limits.
    pub fn new(
        title: &str,
        blurb: &str,
        image: impl Into<Bytes>,
    ) -> Result<Self, TypesError> {
        if title.to_lowercase().contains(RESERVED_KEYWORD) {
            return Err(TypesError::ReservedKeyword(RESERVED_KEYWORD));
        }
        Ok(Self {
            title: crop(title, MAX_TITLE_LEN),
            blurb: crop(blurb, MAX_BLURB_LEN),
            image: image.into(),
        })
    }

    pub fn titled(title: &str) -> Result<Self, TypesError> {
        Self::new(title, "", Bytes::new())
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn blurb(&self) -> &str {
        &self.blurb
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }
}

fn crop(src: &str, max_chars: usize) -> String {
    src.chars().take(max_chars).collect()
}

impl Write for Description {
    fn write(&self, buf: &mut impl BufMut) {
        put_str(buf, &self.title);
        put_str(buf, &self.blurb);
        put_blob(buf, &self.image);
    }
}

impl Read for Description {
    /// Decoded fields pass through [`Description::new`], so remote
    /// descriptions obey the same keyword and length rules as local ones.
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let title = get_str(buf)?;
        let blurb = get_str(buf)?;
        let image = get_blob(buf)?;
        Self::new(&title, &blurb, image)
            .map_err(|e| CodecError::InvalidData("description", e.to_string()))
    }
}

/// Versioned metadata for one service.
///
/// Equality covers every field; hashing uses the address alone, so two
/// revisions of the same service land in the same bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Descriptor {
    address: ServiceAddress,
    version: u8,
    kind: i32,
    scope: Scope,
    group: String,
    tags: String,
    description: Description,
    ext: Bytes,
}

impl Descriptor {
    pub fn new(
        address: ServiceAddress,
        kind: i32,
        scope: Scope,
        group: impl Into<String>,
        tags: impl Into<String>,
        description: Description,
    ) -> Self {
        Self {
            address,
            version: VERSION_0,
            kind,
            scope,
            group: group.into(),
            tags: tags.into(),
            description,
            ext: Bytes::new(),
        }
    }

    /// A public descriptor with no tags and an empty description.
    pub fn basic(address: ServiceAddress, group: impl Into<String>, kind: i32) -> Self {
        Self::new(address, kind, Scope::Public, group, "", Description::default())
    }

    pub fn address(&self) -> ServiceAddress {
        self.address
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn kind(&self) -> i32 {
        self.kind
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_public(&self) -> bool {
        self.scope == Scope::Public
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// The raw tag string as published.
    pub fn raw_tags(&self) -> &str {
        &self.tags
    }

    /// Up to [`MAX_TAGS`] whitespace-separated tags, lower-cased.
    pub fn tags(&self) -> BTreeSet<String> {
        parse_tags(&self.tags)
    }

    pub fn description(&self) -> &Description {
        &self.description
    }
}

fn parse_tags(tags: &str) -> BTreeSet<String> {
    tags.split_whitespace()
        .take(MAX_TAGS)
        .map(str::to_lowercase)
        .collect()
}

impl Hash for Descriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl Write for Descriptor {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        self.address.write(buf);
        buf.put_i32(self.kind);
        self.scope.write(buf);
        put_str(buf, &self.group);
        put_str(buf, &self.tags);
        self.description.write(buf);
        put_blob(buf, &self.ext);
    }
}

impl Read for Descriptor {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let version = get_u8(buf)?;
        if version != VERSION_0 {
            return Err(CodecError::InvalidData(
                "descriptor",
                format!("unsupported version {version}"),
            ));
        }
        Ok(Self {
            version,
            address: ServiceAddress::read(buf)?,
            kind: get_i32(buf)?,
            scope: Scope::read(buf)?,
            group: get_str(buf)?,
            tags: get_str(buf)?,
            description: Description::read(buf)?,
            ext: get_blob(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::service::ServiceId;
    use std::collections::hash_map::DefaultHasher;

    fn address() -> ServiceAddress {
        ServiceAddress::new(ServiceId::random(), Keypair::generate().address())
    }

    fn hash_of(d: &Descriptor) -> u64 {
        let mut h = DefaultHasher::new();
        d.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_description_rejects_reserved_keyword() {
        assert_eq!(
            Description::titled("My Tether app"),
            Err(TypesError::ReservedKeyword(RESERVED_KEYWORD))
        );
        assert!(Description::titled("Calculator").is_ok());
    }

    #[test]
    fn test_description_crops() {
        let long_blurb = "x".repeat(200);
        let d = Description::new("A very long service title", &long_blurb, Bytes::new()).unwrap();
        assert_eq!(d.title().chars().count(), MAX_TITLE_LEN);
        assert_eq!(d.title(), "A very long ser");
        assert_eq!(d.blurb().len(), MAX_BLURB_LEN);
    }

    #[test]
    fn test_tags_limited_and_lowercased() {
        let d = Descriptor::new(
            address(),
            1,
            Scope::Public,
            "tools",
            "Math ADD sum calc arith extra",
            Description::default(),
        );
        let tags = d.tags();
        assert_eq!(tags.len(), MAX_TAGS);
        assert!(tags.contains("math"));
        assert!(tags.contains("add"));
        assert!(!tags.contains("extra"));
        assert!(Descriptor::basic(address(), "", 0).tags().is_empty());
    }

    #[test]
    fn test_equality_is_structural_hash_is_address() {
        let addr = address();
        let a = Descriptor::new(addr, 1, Scope::Public, "g", "", Description::default());
        let b = Descriptor::new(addr, 2, Scope::Restricted, "g", "", Description::default());
        assert_ne!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_decode_full_descriptor() {
        let description =
            Description::new("Adder", "Adds numbers", Bytes::from_static(&[1, 2, 3])).unwrap();
        let d = Descriptor::new(address(), 3, Scope::Restricted, "math", "add", description);
        assert_eq!(Descriptor::decode(d.encode()).unwrap(), d);
    }

    #[test]
    fn test_decode_applies_description_rules() {
        let mut bytes = Vec::<u8>::new();
        put_str(&mut bytes, "Tether Chat");
        put_str(&mut bytes, "");
        put_blob(&mut bytes, &[]);
        assert!(matches!(
            Description::decode(&bytes[..]),
            Err(CodecError::InvalidData("description", _))
        ));

        let mut bytes = Vec::<u8>::new();
        put_str(&mut bytes, "A very long service title");
        put_str(&mut bytes, &"y".repeat(300));
        put_blob(&mut bytes, &[7]);
        let d = Description::decode(&bytes[..]).unwrap();
        assert_eq!(d.title(), "A very long ser");
        assert_eq!(d.blurb().chars().count(), MAX_BLURB_LEN);
        assert_eq!(d.image(), &[7]);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let d = Descriptor::basic(address(), "group", 1);
        let bytes = d.encode();
        for cut in [1, 10, bytes.len() - 1] {
            assert!(Descriptor::decode(bytes.slice(..cut)).is_err());
        }
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let d = Descriptor::basic(address(), "group", 1);
        let mut bytes = d.encode().to_vec();
        bytes[0] = 7;
        assert!(matches!(
            Descriptor::decode(&bytes[..]),
            Err(CodecError::InvalidData("descriptor", _))
        ));
    }
}
