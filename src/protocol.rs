//! Protocol Module
//!
//! Wire records exchanged over the relation and their JSON encoding.
//!
//! Requirer → provider, unit scope, key `certificate_signing_requests`:
//! ```json
//! [{"certificate_signing_request": "<PEM CSR>", "ca": "false"}]
//! ```
//! Provider → requirer, application scope, key `certificates`:
//! ```json
//! [{"ca": "<PEM>", "chain": ["<PEM>"], "certificate_signing_request": "<PEM CSR>", "certificate": "<PEM>"}]
//! ```
//!
//! Decoding is all-or-nothing: one malformed element fails the whole list.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{CertExchangeError, Result};

/// Unit data key carrying the requirer's signing requests.
pub const CSR_KEY: &str = "certificate_signing_requests";
/// Application data key carrying the provider's issued certificates.
pub const CERTIFICATES_KEY: &str = "certificates";

/// One signing request as published by a requirer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub certificate_signing_request: String,
    /// Written as `"true"`/`"false"`; read from a string, a boolean, or absence.
    #[serde(
        default,
        serialize_with = "serialize_ca_flag",
        deserialize_with = "deserialize_ca_flag"
    )]
    pub ca: bool,
}

impl RequestRecord {
    pub fn new(certificate_signing_request: String, ca: bool) -> Self {
        Self {
            certificate_signing_request,
            ca,
        }
    }
}

/// One issued certificate as published by a provider.
///
/// `certificate_signing_request` is a verbatim copy of the request's PEM and is
/// the only link between the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub ca: String,
    #[serde(default, deserialize_with = "deserialize_chain")]
    pub chain: Vec<String>,
    pub certificate_signing_request: String,
    pub certificate: String,
}

fn serialize_ca_flag<S: Serializer>(ca: &bool, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(if *ca { "true" } else { "false" })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CaFlag {
    Bool(bool),
    Text(String),
}

fn deserialize_ca_flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    match CaFlag::deserialize(deserializer)? {
        CaFlag::Bool(flag) => Ok(flag),
        CaFlag::Text(text) => match text.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" | "" => Ok(false),
            other => Err(de::Error::custom(format!("invalid ca flag {:?}", other))),
        },
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChainField {
    List(Vec<String>),
    Encoded(String),
}

fn deserialize_chain<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    match ChainField::deserialize(deserializer)? {
        ChainField::List(chain) => Ok(chain),
        ChainField::Encoded(text) => serde_json::from_str(&text)
            .map_err(|e| de::Error::custom(format!("chain is not a JSON array: {}", e))),
    }
}

/// Serialize signing requests for the `certificate_signing_requests` key.
///
/// # Example
/// ```no_run
/// use cert_exchange::protocol::{serialize_requests, RequestRecord};
///
/// let json = serialize_requests(&[RequestRecord::new("<PEM>".to_string(), false)])?;
/// assert_eq!(json, r#"[{"certificate_signing_request":"<PEM>","ca":"false"}]"#);
/// # Ok::<(), cert_exchange::error::CertExchangeError>(())
/// ```
pub fn serialize_requests(requests: &[RequestRecord]) -> Result<String> {
    serde_json::to_string(requests)
        .map_err(|e| CertExchangeError::decode(format!("{} (encoding)", CSR_KEY), e))
}

/// Deserialize the `certificate_signing_requests` value.
pub fn deserialize_requests(json: &str) -> Result<Vec<RequestRecord>> {
    serde_json::from_str(json).map_err(|e| CertExchangeError::decode(CSR_KEY, e))
}

/// Serialize issued certificates for the `certificates` key.
pub fn serialize_certificates(certificates: &[IssuedCertificate]) -> Result<String> {
    serde_json::to_string(certificates)
        .map_err(|e| CertExchangeError::decode(format!("{} (encoding)", CERTIFICATES_KEY), e))
}

/// Deserialize the `certificates` value.
pub fn deserialize_certificates(json: &str) -> Result<Vec<IssuedCertificate>> {
    serde_json::from_str(json).map_err(|e| CertExchangeError::decode(CERTIFICATES_KEY, e))
}
