//! Manifest signing for Updraft.
//!
//! This crate provides:
//! - Ed25519 key generation and `keyid:base64` key strings
//! - The `updraft-signature` header format
//! - Detached manifest signing and verification against trusted keys

pub mod error;
pub mod header;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use header::SignatureHeader;
pub use key::{KeyPair, PublicKey, SecretKey};
pub use signer::{Ed25519Verifier, ManifestSigner, SignatureVerifier, verify_signature};
