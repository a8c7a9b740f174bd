//! Ed25519 peer identities and signed payloads.
//!
//! A peer is identified by a [`PeerAddress`]: the first 20 bytes of the
//! SHA-256 digest of its Ed25519 public key. The [`Keypair`] signs arbitrary
//! payloads into a [`SignedData`] envelope that carries the signer's public
//! key, so a verifier can both check the signature and derive the signer's
//! address without any prior lookup.

use crate::codec::{get_array, get_blob, put_blob, CodecError, Read, Write};
use crate::error::TypesError;
use bytes::{Buf, BufMut, Bytes};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Length of an encoded peer address.
pub const ADDRESS_LEN: usize = 20;
/// Length of an Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Network identity of a peer, derived from its public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress([u8; ADDRESS_LEN]);

impl PeerAddress {
    /// Placeholder address used by `ServiceAddress::NULL`.
    pub const NULL: PeerAddress = PeerAddress([0u8; ADDRESS_LEN]);

    /// Derives the address of the holder of `key`.
    pub fn from_public_key(key: &[u8; PUBLIC_KEY_LEN]) -> Self {
        let digest = Sha256::digest(key);
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest[..ADDRESS_LEN]);
        Self(out)
    }

    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({self})")
    }
}

impl FromStr for PeerAddress {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_err = || TypesError::Parse {
            kind: "peer address",
            value: s.to_string(),
        };
        let bytes = hex::decode(s.trim()).map_err(|_| parse_err())?;
        let bytes: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|_| parse_err())?;
        Ok(Self(bytes))
    }
}

impl Serialize for PeerAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Write for PeerAddress {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }
}

impl Read for PeerAddress {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self(get_array(buf)?))
    }
}

/// Parses a hex-encoded Ed25519 public key.
pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey, TypesError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| TypesError::InvalidKey(format!("public key is not hex: {e}")))?;
    let bytes: [u8; PUBLIC_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| TypesError::InvalidKey("invalid public key length (expected 32 bytes)".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| TypesError::InvalidKey(format!("invalid public key: {e}")))
}

/// The local peer's signing identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generates a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restores a keypair from its hex-encoded 32-byte secret seed.
    pub fn from_secret_hex(secret: &str) -> Result<Self, TypesError> {
        let bytes = Zeroizing::new(
            hex::decode(secret.trim())
                .map_err(|e| TypesError::InvalidKey(format!("secret key is not hex: {e}")))?,
        );
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| TypesError::InvalidKey("invalid secret key length (expected 32 bytes)".into()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Hex-encoded secret seed, suitable for a config file.
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn address(&self) -> PeerAddress {
        PeerAddress::from_public_key(&self.public_key().to_bytes())
    }

    /// Signs `data`, bundling the signature with our public key.
    pub fn sign(&self, data: &[u8]) -> SignedData {
        let signature = self.signing_key.sign(data);
        SignedData {
            public_key: self.public_key().to_bytes(),
            data: Bytes::copy_from_slice(data),
            signature: signature.to_bytes(),
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// A payload signed by the holder of `public_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedData {
    public_key: [u8; PUBLIC_KEY_LEN],
    data: Bytes,
    signature: [u8; SIGNATURE_LEN],
}

impl SignedData {
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Address derived from the claimed public key.
    pub fn signer(&self) -> PeerAddress {
        PeerAddress::from_public_key(&self.public_key)
    }

    /// Returns `true` if the signature is valid for `data` under the claimed key.
    pub fn verify(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.public_key) else {
            return false;
        };
        let signature = Signature::from_bytes(&self.signature);
        key.verify(&self.data, &signature).is_ok()
    }
}

impl Write for SignedData {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.public_key);
        put_blob(buf, &self.data);
        buf.put_slice(&self.signature);
    }
}

impl Read for SignedData {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            public_key: get_array(buf)?,
            data: get_blob(buf)?,
            signature: get_array(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::generate();
        let signed = keypair.sign(b"challenge bytes");
        assert!(signed.verify());
        assert_eq!(signed.signer(), keypair.address());
        assert_eq!(signed.data(), b"challenge bytes");
    }

    #[test]
    fn test_tampered_data_fails() {
        let keypair = Keypair::generate();
        let mut signed = keypair.sign(b"original");
        signed.data = Bytes::from_static(b"tampered");
        assert!(!signed.verify());
    }

    #[test]
    fn test_wrong_key_fails() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let mut signed = keypair.sign(b"payload");
        signed.public_key = other.public_key().to_bytes();
        assert!(!signed.verify());
        assert_eq!(signed.signer(), other.address());
    }

    #[test]
    fn test_secret_hex_restores_same_identity() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_hex(&keypair.secret_hex()).unwrap();
        assert_eq!(restored.address(), keypair.address());
    }

    #[test]
    fn test_secret_hex_rejects_bad_length() {
        assert!(matches!(
            Keypair::from_secret_hex("abcd"),
            Err(TypesError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_address_text_form() {
        let address = Keypair::generate().address();
        let text = address.to_string();
        assert_eq!(text.len(), ADDRESS_LEN * 2);
        assert_eq!(text.parse::<PeerAddress>().unwrap(), address);
        assert!("not-hex".parse::<PeerAddress>().is_err());
        assert!("abcd".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_signed_data_truncated() {
        let signed = Keypair::generate().sign(b"abc");
        let bytes = signed.encode();
        let short = bytes.slice(..bytes.len() - 1);
        assert_eq!(SignedData::decode(short), Err(CodecError::EndOfBuffer));
    }

    #[test]
    fn test_parse_public_key() {
        let keypair = Keypair::generate();
        let hex_key = hex::encode(keypair.public_key().to_bytes());
        assert_eq!(parse_public_key(&hex_key).unwrap(), keypair.public_key());
        assert!(parse_public_key("00").is_err());
    }
}
