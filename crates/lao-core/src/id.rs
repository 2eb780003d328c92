//! Content-addressed identifiers for the LAO protocol
//!
//! Two identifier spaces share one digest scheme but are never mixed:
//! - `MessageId` addresses a signed envelope (hash of data + signature)
//! - `EntityId` addresses a protocol object (hash of its defining fields)
//!
//! Digest: SHA-256 over the concatenation of every field prefixed by its
//! decimal byte length. Identifiers are carried as unpadded base64url.

use std::fmt;
use std::str::FromStr;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::ProtocolError;

/// Digest size in bytes
pub const DIGEST_SIZE: usize = 32;

/// Length of an unpadded base64url-encoded digest
pub const ENCODED_DIGEST_LEN: usize = 43;

/// URL-safe base64 used for every binary field on the wire.
/// Encodes without padding, decodes with or without it.
pub const BASE64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Hash an ordered list of fields with length prefixes.
///
/// The prefix is the ASCII decimal byte length, so the result does not
/// depend on platform integer width or byte order.
pub fn hash_fields<I, T>(fields: I) -> [u8; DIGEST_SIZE]
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for field in fields {
        let field = field.as_ref();
        hasher.update(field.len().to_string().as_bytes());
        hasher.update(field);
    }
    hasher.finalize().into()
}

/// Encoded digest kept in its base64url text form.
///
/// Ordering the ASCII bytes gives the same order as comparing the
/// identifier strings, which is what the tie-break policy is defined on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct EncodedDigest([u8; ENCODED_DIGEST_LEN]);

impl EncodedDigest {
    fn from_digest(digest: &[u8; DIGEST_SIZE]) -> Self {
        let mut out = [0u8; ENCODED_DIGEST_LEN];
        // 32 bytes always encode to exactly 43 unpadded characters
        let written = BASE64URL
            .encode_slice(digest, &mut out)
            .unwrap_or_default();
        debug_assert_eq!(written, ENCODED_DIGEST_LEN);
        EncodedDigest(out)
    }

    fn parse(s: &str) -> Result<Self, ProtocolError> {
        let bytes = BASE64URL
            .decode(s)
            .map_err(|e| ProtocolError::MalformedData(format!("identifier {s:?}: {e}")))?;
        let digest: [u8; DIGEST_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            ProtocolError::MalformedData(format!(
                "identifier {s:?}: expected {DIGEST_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_digest(&digest))
    }

    fn as_str(&self) -> &str {
        // Only ever filled by the base64url encoder
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    fn digest(&self) -> [u8; DIGEST_SIZE] {
        let mut out = [0u8; DIGEST_SIZE];
        if let Ok(bytes) = BASE64URL.decode(self.0) {
            let n = DIGEST_SIZE.min(bytes.len());
            out[..n].copy_from_slice(&bytes[..n]);
        }
        out
    }
}

/// Message identity - hash of an envelope's data and signature
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(EncodedDigest);

impl MessageId {
    /// Compute the identifier of a signed payload.
    ///
    /// Fields are the base64url wire encodings of payload and signature,
    /// so any holder of the JSON message can recompute it.
    pub fn compute(payload: &[u8], signature: &[u8]) -> Self {
        let data = BASE64URL.encode(payload);
        let sig = BASE64URL.encode(signature);
        MessageId(EncodedDigest::from_digest(&hash_fields([data, sig])))
    }

    #[inline]
    pub fn from_digest(digest: [u8; DIGEST_SIZE]) -> Self {
        MessageId(EncodedDigest::from_digest(&digest))
    }

    /// Raw digest bytes; witnesses sign these
    #[inline]
    pub fn digest(&self) -> [u8; DIGEST_SIZE] {
        self.0.digest()
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg({})", &self.as_str()[..8])
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EncodedDigest::parse(s).map(MessageId)
    }
}

/// Protocol object identity - hash of the object's defining fields
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(EncodedDigest);

impl EntityId {
    /// Compute an entity identifier from its ordered semantic fields
    pub fn compute<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        EntityId(EncodedDigest::from_digest(&hash_fields(parts)))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", &self.as_str()[..8])
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EncodedDigest::parse(s).map(EntityId)
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(MessageId);
string_serde!(EntityId);
