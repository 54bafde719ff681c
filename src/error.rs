//! Error types for the certificate exchange.
//!
//! Every public operation returns [`Result`]. Variants carry the relation and
//! the stage that failed so callers can log them without extra wrapping.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertExchangeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error during {stage}: {reason}")]
    Transport { stage: String, reason: String },

    #[error("could not decode {what}: {reason}")]
    Decode { what: String, reason: String },

    #[error("no PEM block found in {what}")]
    PemDecode { what: String },

    #[error("could not parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("CSR construction failed: {0}")]
    CsrBuild(String),

    #[error("invalid OID {oid:?}: {reason}")]
    InvalidOid { oid: String, reason: String },

    #[error("invalid certificate signing request: {0}")]
    InvalidCsr(String),

    #[error("certificate signing failed: {0}")]
    Signing(String),

    #[error("unit is not the leader, refusing to write application data for {relation_id}")]
    NotLeader { relation_id: String },

    #[error("not found: {0}")]
    NotFound(String),
}

impl CertExchangeError {
    pub fn transport(stage: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decode(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    /// True for key, CSR, OID, signature and issuance failures.
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            Self::KeyGeneration(_)
                | Self::CsrBuild(_)
                | Self::InvalidOid { .. }
                | Self::InvalidCsr(_)
                | Self::Signing(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CertExchangeError>;
