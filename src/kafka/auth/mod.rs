//! SASL/SCRAM authentication provider
//!
//! The session asks this module for a mechanism matching the configured
//! algorithm name. Selection is permissive: an unset or unknown name falls
//! back to SCRAM-SHA-512 instead of failing, so a typo in a config file
//! degrades to the strongest supported hash rather than a startup error.
//!
//! ## Supported mechanisms
//!
//! - SCRAM-SHA-256 (`algorithm = "sha256"`)
//! - SCRAM-SHA-512 (`algorithm = "sha512"`, default)

pub mod scram;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::kafka::constants::{
    ALGORITHM_SHA256, ALGORITHM_SHA512, SASL_SCRAM_SHA256, SASL_SCRAM_SHA512,
};

pub use scram::{ScramClient, ScramCredential, ScramServer};

/// Hash function backing a SCRAM exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScramAlgorithm {
    /// SCRAM-SHA-256
    Sha256,
    /// SCRAM-SHA-512 (strongest supported, used as fallback)
    #[default]
    Sha512,
}

impl ScramAlgorithm {
    /// Parse an algorithm name, returning `None` for unknown names
    ///
    /// Accepts the short config names (`sha256`, `sha512`) and the SASL
    /// mechanism names (`SCRAM-SHA-256`, `SCRAM-SHA-512`), case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        let lowered = name.trim().to_lowercase();
        match lowered.as_str() {
            ALGORITHM_SHA256 | "scram-sha-256" => Some(ScramAlgorithm::Sha256),
            ALGORITHM_SHA512 | "scram-sha-512" => Some(ScramAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Select the algorithm for a configured name
    ///
    /// Unset, empty or unrecognized names select SHA-512.
    pub fn from_config(name: Option<&str>) -> Self {
        match name {
            Some(n) if !n.trim().is_empty() => Self::parse(n).unwrap_or_else(|| {
                debug!(algorithm = n, "unknown SCRAM algorithm, falling back to sha512");
                ScramAlgorithm::Sha512
            }),
            _ => ScramAlgorithm::Sha512,
        }
    }

    /// SASL mechanism name sent during the handshake
    pub fn mechanism(&self) -> &'static str {
        match self {
            ScramAlgorithm::Sha256 => SASL_SCRAM_SHA256,
            ScramAlgorithm::Sha512 => SASL_SCRAM_SHA512,
        }
    }

    /// Short config name
    pub fn as_str(&self) -> &'static str {
        match self {
            ScramAlgorithm::Sha256 => ALGORITHM_SHA256,
            ScramAlgorithm::Sha512 => ALGORITHM_SHA512,
        }
    }

    /// Digest output length in bytes
    pub fn output_len(&self) -> usize {
        match self {
            ScramAlgorithm::Sha256 => 32,
            ScramAlgorithm::Sha512 => 64,
        }
    }

    /// Build a fresh client-side mechanism for this algorithm
    pub fn client(&self) -> ScramClient {
        ScramClient::new(*self)
    }
}

impl std::fmt::Display for ScramAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mechanism())
    }
}
