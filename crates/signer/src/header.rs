//! The `updraft-signature` response header.
//!
//! A comma-separated list of `name="value"` pairs:
//! `keyid="main", sig="<base64>", alg="ed25519"`. Only `sig` is required;
//! `alg` defaults to `ed25519` and `keyid` to [`DEFAULT_KEY_ID`].

use crate::error::{SignerError, SignerResult};
use std::fmt;
use std::str::FromStr;

pub const ALG_ED25519: &str = "ed25519";
pub const DEFAULT_KEY_ID: &str = "main";

/// A parsed detached signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureHeader {
    pub key_id: String,
    /// Base64-encoded signature bytes.
    pub sig: String,
    pub alg: String,
}

impl SignatureHeader {
    pub fn new(key_id: impl Into<String>, sig: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            sig: sig.into(),
            alg: ALG_ED25519.to_string(),
        }
    }

    pub fn parse(s: &str) -> SignerResult<Self> {
        let mut key_id = None;
        let mut sig = None;
        let mut alg = None;

        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = part.split_once('=').ok_or_else(|| {
                SignerError::InvalidSignature(format!("expected name=\"value\", got {part}"))
            })?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value)
                .to_string();
            match name.trim() {
                "keyid" => key_id = Some(value),
                "sig" => sig = Some(value),
                "alg" => alg = Some(value),
                // Unknown parameters are ignored for forward compatibility.
                _ => {}
            }
        }

        let sig = sig
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SignerError::InvalidSignature("missing sig".to_string()))?;
        let alg = alg.unwrap_or_else(|| ALG_ED25519.to_string());
        if alg != ALG_ED25519 {
            return Err(SignerError::UnsupportedAlgorithm(alg));
        }

        Ok(Self {
            key_id: key_id.unwrap_or_else(|| DEFAULT_KEY_ID.to_string()),
            sig,
            alg,
        })
    }
}

impl fmt::Display for SignatureHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "keyid=\"{}\", sig=\"{}\", alg=\"{}\"",
            self.key_id, self.sig, self.alg
        )
    }
}

impl FromStr for SignatureHeader {
    type Err = SignerError;

    fn from_str(s: &str) -> SignerResult<Self> {
        Self::parse(s)
    }
}
