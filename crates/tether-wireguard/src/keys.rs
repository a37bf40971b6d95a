//! `WireGuard` key types.
//!
//! `WireGuard` uses Curve25519 for key exchange. Keys are 32 bytes and travel
//! as standard base64 text, both in configuration files and in device records.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use rand_core::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::WireGuardError;

/// `WireGuard` key size in bytes (256-bit Curve25519 keys).
pub const KEY_SIZE: usize = 32;

fn decode_base64(s: &str) -> Result<[u8; KEY_SIZE], WireGuardError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| WireGuardError::InvalidBase64(e.to_string()))?;
    <[u8; KEY_SIZE]>::try_from(bytes.as_slice())
        .map_err(|_| WireGuardError::InvalidKeyLength(bytes.len()))
}

/// A `WireGuard` public key (Curve25519, 32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a public key from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireGuardError> {
        <[u8; KEY_SIZE]>::try_from(bytes)
            .map(Self)
            .map_err(|_| WireGuardError::InvalidKeyLength(bytes.len()))
    }

    /// Returns the raw bytes of the public key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decodes a public key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, WireGuardError> {
        decode_base64(s).map(Self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = self.to_base64();
        let short = &b64[..8.min(b64.len())];
        write!(f, "PublicKey({short}...)")
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl FromStr for PublicKey {
    type Err = WireGuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(key: X25519PublicKey) -> Self {
        Self::from_bytes_array(*key.as_bytes())
    }
}

/// A `WireGuard` private key (Curve25519, 32 bytes).
#[derive(Clone)]
pub struct PrivateKey([u8; KEY_SIZE]);

impl PrivateKey {
    /// Generates a new random private key.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self(secret.to_bytes())
    }

    /// Creates a private key from a 32-byte array.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the private key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Derives the corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey::from(X25519PublicKey::from(&secret))
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decodes a private key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, WireGuardError> {
        decode_base64(s).map(Self)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

impl FromStr for PrivateKey {
    type Err = WireGuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PrivateKey {}

/// Generates a new `WireGuard` keypair.
#[must_use]
pub fn generate_keypair() -> (PrivateKey, PublicKey) {
    let private = PrivateKey::generate();
    let public = private.public_key();
    (private, public)
}
