//! Detached manifest signing and verification.

use crate::error::{SignerError, SignerResult};
use crate::header::SignatureHeader;
use crate::key::{KeyPair, PublicKey};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier;

/// Signs raw manifest bodies.
pub struct ManifestSigner {
    keypair: KeyPair,
}

impl ManifestSigner {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    pub fn from_secret_key_string(s: &str) -> SignerResult<Self> {
        Ok(Self::new(KeyPair::from_secret_key_string(s)?))
    }

    /// Generate a signer with a random key.
    pub fn generate(key_id: impl Into<String>) -> Self {
        Self::new(KeyPair::generate(key_id))
    }

    pub fn key_id(&self) -> &str {
        &self.keypair.key_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    pub fn public_key_string(&self) -> String {
        self.keypair.public_key_string()
    }

    /// Sign the exact bytes of a manifest response body.
    pub fn sign(&self, body: &[u8]) -> SignatureHeader {
        let sig = self.keypair.secret.signing_key().sign(body);
        SignatureHeader::new(&self.keypair.key_id, STANDARD.encode(sig.to_bytes()))
    }
}

/// Verifies detached manifest signatures.
///
/// Injected into the loader so hosts can plug in platform key stores.
pub trait SignatureVerifier: Send + Sync + 'static {
    /// Check `signature` over `payload`. `false` means reject the manifest.
    fn verify(&self, payload: &[u8], signature: &SignatureHeader) -> bool;
}

/// Verify one signature against one public key.
pub fn verify_signature(
    payload: &[u8],
    signature: &SignatureHeader,
    public_key: &PublicKey,
) -> SignerResult<()> {
    let sig_bytes = STANDARD
        .decode(&signature.sig)
        .map_err(|e| SignerError::InvalidSignature(format!("invalid base64: {e}")))?;

    let sig_array: [u8; 64] = sig_bytes.try_into().map_err(|b: Vec<u8>| {
        SignerError::InvalidSignature(format!("expected 64 bytes, got {}", b.len()))
    })?;
    let sig = ed25519_dalek::Signature::from_bytes(&sig_array);

    public_key
        .verifying_key()
        .verify(payload, &sig)
        .map_err(|_| SignerError::VerificationFailed)
}

/// Ed25519 verifier over a set of trusted keys, selected by key id.
#[derive(Clone, Debug, Default)]
pub struct Ed25519Verifier {
    trusted: Vec<(String, PublicKey)>,
}

impl Ed25519Verifier {
    pub fn new(trusted: Vec<(String, PublicKey)>) -> Self {
        Self { trusted }
    }

    /// Build from `keyid:base64` public key strings.
    pub fn from_key_strings<S: AsRef<str>>(keys: &[S]) -> SignerResult<Self> {
        let trusted = keys
            .iter()
            .map(|k| PublicKey::parse(k.as_ref()))
            .collect::<SignerResult<Vec<_>>>()?;
        Ok(Self { trusted })
    }

    pub fn is_empty(&self) -> bool {
        self.trusted.is_empty()
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, payload: &[u8], signature: &SignatureHeader) -> bool {
        let Some((_, key)) = self
            .trusted
            .iter()
            .find(|(key_id, _)| key_id == &signature.key_id)
        else {
            tracing::warn!(key_id = %signature.key_id, "Manifest signed with untrusted key");
            return false;
        };

        match verify_signature(payload, signature, key) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key_id = %signature.key_id, error = %e, "Manifest signature rejected");
                false
            }
        }
    }
}
