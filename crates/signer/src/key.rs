//! Ed25519 key types.
//!
//! Keys travel as `keyid:base64` strings. A secret key string carries the
//! 32-byte seed followed by the 32-byte public key; a public key string
//! carries the public key alone. The key id names the key in signature
//! headers so servers can rotate keys without breaking installed clients.

use crate::error::{SignerError, SignerResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;
use std::path::Path;

fn split_key_string(s: &str) -> SignerResult<(&str, Vec<u8>)> {
    let (key_id, b64) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| SignerError::KeyParsing("expected 'keyid:base64' format".to_string()))?;
    if key_id.is_empty() {
        return Err(SignerError::KeyParsing("empty key id".to_string()));
    }
    let bytes = STANDARD
        .decode(b64)
        .map_err(|e| SignerError::KeyParsing(format!("invalid base64: {e}")))?;
    Ok((key_id, bytes))
}

/// A secret key for signing manifests.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self {
            inner: SigningKey::generate(&mut rng),
        }
    }

    /// Parse `keyid:base64(seed || public)`.
    pub fn parse(s: &str) -> SignerResult<(String, Self)> {
        let (key_id, bytes) = split_key_string(s)?;
        if bytes.len() != 64 {
            return Err(SignerError::KeyParsing(format!(
                "expected 64 bytes, got {}",
                bytes.len()
            )));
        }

        let seed: [u8; 32] = bytes[..32]
            .try_into()
            .map_err(|_| SignerError::KeyParsing("invalid secret key bytes".to_string()))?;
        let inner = SigningKey::from_bytes(&seed);

        // The embedded public half must belong to the seed.
        if inner.verifying_key().as_bytes() != &bytes[32..] {
            return Err(SignerError::KeyParsing(
                "public key does not match secret key".to_string(),
            ));
        }

        Ok((key_id.to_string(), Self { inner }))
    }

    pub fn to_key_string(&self, key_id: &str) -> String {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(self.inner.as_bytes());
        bytes.extend_from_slice(self.inner.verifying_key().as_bytes());
        format!("{key_id}:{}", STANDARD.encode(&bytes))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.inner
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// A public key for verifying manifests.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Parse `keyid:base64(public)`.
    pub fn parse(s: &str) -> SignerResult<(String, Self)> {
        let (key_id, bytes) = split_key_string(s)?;
        let key_bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            SignerError::KeyParsing(format!("expected 32 bytes, got {}", b.len()))
        })?;

        let inner = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| SignerError::KeyParsing(format!("invalid public key: {e}")))?;

        Ok((key_id.to_string(), Self { inner }))
    }

    pub fn to_key_string(&self, key_id: &str) -> String {
        format!("{key_id}:{}", STANDARD.encode(self.inner.as_bytes()))
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.inner
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = STANDARD.encode(self.inner.as_bytes());
        write!(f, "PublicKey({}...)", &b64[..8])
    }
}

/// A named key pair.
pub struct KeyPair {
    /// Key id sent in the signature header (e.g. "main-2024").
    pub key_id: String,
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new key pair with the given id.
    pub fn generate(key_id: impl Into<String>) -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self {
            key_id: key_id.into(),
            secret,
            public,
        }
    }

    pub fn from_secret_key_string(s: &str) -> SignerResult<Self> {
        let (key_id, secret) = SecretKey::parse(s)?;
        let public = secret.public_key();
        Ok(Self {
            key_id,
            secret,
            public,
        })
    }

    /// Read a secret key string from a file.
    pub fn from_file(path: impl AsRef<Path>) -> SignerResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_secret_key_string(&contents)
    }

    pub fn secret_key_string(&self) -> String {
        self.secret.to_key_string(&self.key_id)
    }

    pub fn public_key_string(&self) -> String {
        self.public.to_key_string(&self.key_id)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id)
            .field("public", &self.public)
            .finish()
    }
}
