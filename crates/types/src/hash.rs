//! The [`H256`] digest type.
//!
//! Witness hashes, block hashes, and state roots are all 32-byte Keccak256
//! digests. `H256` wraps the raw bytes and carries the hex and RLP
//! representations the wire and the logs need; everything renders through
//! one `Display` impl so a hash looks the same everywhere.

use crate::{Error, Result};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// Size of a hash in bytes
pub const HASH_SIZE: usize = 32;

/// A 32-byte Keccak256 digest.
///
/// # Example
///
/// ```rust
/// use veritas_types::H256;
///
/// let hash = H256::keccak256(b"block");
///
/// // Hex round-trips through Display/FromStr.
/// let parsed: H256 = hash.to_hex().parse().unwrap();
/// assert_eq!(parsed, hash);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct H256([u8; HASH_SIZE]);

impl H256 {
    /// The all-zero hash, standing in for "no hash".
    pub const NIL: Self = Self([0u8; HASH_SIZE]);

    /// Wraps a 32-byte array.
    #[inline]
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Copies a hash out of a slice, which must be exactly 32 bytes long.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        slice
            .try_into()
            .map(Self)
            .map_err(|_| Error::InvalidLength {
                expected: HASH_SIZE,
                actual: slice.len(),
            })
    }

    /// Digests `data` with Keccak256.
    pub fn keccak256(data: &[u8]) -> Self {
        Self(Keccak256::digest(data).into())
    }

    /// The raw digest bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether this is the all-zero hash.
    #[inline]
    pub fn is_nil(&self) -> bool {
        self == &Self::NIL
    }

    /// Parses a 64-digit hex string, with or without a `0x` prefix.
    pub fn from_hex(text: &str) -> Result<Self> {
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);

        let mut bytes = [0u8; HASH_SIZE];
        hex::decode_to_slice(digits, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// The `0x`-prefixed hex form.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// An abbreviated hex form (first four bytes), used in log lines.
    pub fn short(&self) -> String {
        format!("0x{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for H256 {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        Self::from_hex(text)
    }
}

impl From<[u8; HASH_SIZE]> for H256 {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for H256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for H256 {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for H256 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

impl Encodable for H256 {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl Decodable for H256 {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        rlp.decoder().decode_value(|bytes| {
            bytes
                .try_into()
                .map(H256)
                .map_err(|_| DecoderError::RlpInvalidLength)
        })
    }
}
