//! Runtime version compatibility.

use serde::{Deserialize, Serialize};

/// How an update's runtime version is compared with the host's.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeCompatibility {
    /// Strings must be identical.
    #[default]
    Exact,
    /// The update declares a semver requirement (`^1.2`, `>=1.0, <2`)
    /// matched against the host's version. Identical strings always match.
    Semver,
}

impl RuntimeCompatibility {
    /// The single compatibility predicate used by every selection policy.
    pub fn is_compatible(&self, host: &str, update: &str) -> bool {
        if host == update {
            return true;
        }
        match self {
            Self::Exact => false,
            Self::Semver => {
                let Ok(version) = semver::Version::parse(host) else {
                    return false;
                };
                semver::VersionReq::parse(update)
                    .map(|req| req.matches(&version))
                    .unwrap_or(false)
            }
        }
    }

    /// Reject host versions the mode cannot interpret.
    pub fn validate_host(&self, host: &str) -> crate::Result<()> {
        if host.trim().is_empty() {
            return Err(crate::Error::InvalidRuntimeVersion(
                "runtime version must not be empty".to_string(),
            ));
        }
        if *self == Self::Semver {
            semver::Version::parse(host)
                .map_err(|e| crate::Error::InvalidRuntimeVersion(format!("{host}: {e}")))?;
        }
        Ok(())
    }
}
