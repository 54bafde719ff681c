//! Certificate Signing Request construction.
//!
//! Builds a PEM-encoded PKCS#10 request from [`IdentityAttributes`] and the
//! requirer's private key. The request is self-signed with SHA-256; the
//! signature only proves possession of the key.
//!
//! # SAN handling
//! - DNS names are copied as given.
//! - IP addresses that fail to parse are silently dropped.
//! - OIDs must be dotted-decimal; a single malformed OID aborts the build and
//!   nothing is returned.
//! - The email address is emitted as an rfc822Name SAN.
//!
//! # Example
//! ```rust,no_run
//! use cert_exchange::attributes::IdentityAttributes;
//! use cert_exchange::csr::CsrBuilder;
//! use cert_exchange::keygen::generate_key;
//! # fn example() -> cert_exchange::error::Result<()> {
//! let key = generate_key(2048)?;
//! let attrs = IdentityAttributes::new("example.com".to_string())
//!     .sans_dns(vec!["example.com".to_string(), "www.example.com".to_string()]);
//! let csr_pem = CsrBuilder::new(&attrs).build(&key)?;
//! assert!(csr_pem.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
//! # Ok(())
//! # }
//! ```

use std::net::IpAddr;

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Name, X509Req};

use crate::attributes::IdentityAttributes;
use crate::error::{CertExchangeError, Result};
use crate::keygen::KeyMaterial;

const X509_REQ_VERSION_1: i32 = 0; // PKCS#10 v1 is represented by 0

/// Parse one IP SAN entry. `None` means the entry is dropped.
///
/// Entries are taken verbatim; surrounding whitespace makes them invalid.
pub fn parse_ip_san(value: &str) -> Option<IpAddr> {
    value.parse::<IpAddr>().ok()
}

/// Validate one OID SAN entry and return it in canonical dotted form.
pub fn parse_oid_san(value: &str) -> Result<String> {
    let invalid = |reason: &str| CertExchangeError::InvalidOid {
        oid: value.to_string(),
        reason: reason.to_string(),
    };

    let arcs = value
        .split('.')
        .map(|arc| arc.parse::<u64>().map_err(|_| invalid("arcs must be decimal integers")))
        .collect::<Result<Vec<u64>>>()?;

    if arcs.len() < 2 {
        return Err(invalid("at least two arcs are required"));
    }
    if arcs[0] > 2 {
        return Err(invalid("first arc must be 0, 1 or 2"));
    }
    if arcs[0] < 2 && arcs[1] >= 40 {
        return Err(invalid("second arc must be below 40 under arcs 0 and 1"));
    }

    Ok(arcs
        .iter()
        .map(|arc| arc.to_string())
        .collect::<Vec<_>>()
        .join("."))
}

/// Builder for a self-signed CSR from a set of identity attributes.
pub struct CsrBuilder<'a> {
    attributes: &'a IdentityAttributes,
    digest: MessageDigest,
}

impl<'a> CsrBuilder<'a> {
    pub fn new(attributes: &'a IdentityAttributes) -> Self {
        Self {
            attributes,
            digest: MessageDigest::sha256(),
        }
    }

    /// Build the CSR and return it PEM-encoded.
    ///
    /// # Errors
    /// - [`CertExchangeError::InvalidOid`] if any OID SAN is malformed
    /// - [`CertExchangeError::CsrBuild`] on any openssl failure
    pub fn build(self, key: &KeyMaterial) -> Result<String> {
        let private_key = key
            .private_key()
            .map_err(|e| CertExchangeError::CsrBuild(e.to_string()))?;
        self.build_with_key(&private_key)
    }

    pub fn build_with_key(self, private_key: &PKey<Private>) -> Result<String> {
        // Validate every OID before touching openssl so a bad entry leaves no output.
        let oids = self
            .attributes
            .sans_oid
            .iter()
            .map(|oid| parse_oid_san(oid))
            .collect::<Result<Vec<String>>>()?;

        let ips: Vec<IpAddr> = self
            .attributes
            .sans_ip
            .iter()
            .filter_map(|ip| parse_ip_san(ip))
            .collect();

        let mut builder = X509Req::builder()
            .map_err(|e| csr_error("Failed to create X509Req builder", e))?;
        builder
            .set_version(X509_REQ_VERSION_1)
            .map_err(|e| csr_error("Failed to set version", e))?;

        let subject_name = self.subject_name()?;
        builder
            .set_subject_name(&subject_name)
            .map_err(|e| csr_error("Failed to set subject", e))?;
        builder
            .set_pubkey(private_key)
            .map_err(|e| csr_error("Failed to set public key", e))?;

        let has_sans = !self.attributes.sans_dns.is_empty()
            || !ips.is_empty()
            || !oids.is_empty()
            || !self.attributes.email_address.is_empty();

        if has_sans {
            let mut san = SubjectAlternativeName::new();
            for dns in &self.attributes.sans_dns {
                san.dns(dns);
            }
            for ip in &ips {
                san.ip(&ip.to_string());
            }
            for oid in &oids {
                san.rid(oid);
            }
            if !self.attributes.email_address.is_empty() {
                san.email(&self.attributes.email_address);
            }

            let extension = {
                let context = builder.x509v3_context(None);
                san.build(&context)
                    .map_err(|e| csr_error("Failed to build SubjectAlternativeName", e))?
            };
            let mut extensions =
                Stack::new().map_err(|e| csr_error("Failed to create extension stack", e))?;
            extensions
                .push(extension)
                .map_err(|e| csr_error("Failed to push extension", e))?;
            builder
                .add_extensions(&extensions)
                .map_err(|e| csr_error("Failed to add extensions", e))?;
        }

        builder
            .sign(private_key, self.digest)
            .map_err(|e| csr_error("Failed to sign CSR", e))?;

        let pem = builder
            .build()
            .to_pem()
            .map_err(|e| csr_error("Failed to PEM-encode CSR", e))?;
        String::from_utf8(pem).map_err(|e| csr_error("CSR PEM is not UTF-8", e))
    }

    fn subject_name(&self) -> Result<X509Name> {
        let attrs = self.attributes;
        let mut name_builder =
            X509Name::builder().map_err(|e| csr_error("Failed to create name builder", e))?;

        let entries = [
            (Nid::COMMONNAME, &attrs.common_name, "CN"),
            (Nid::ORGANIZATIONNAME, &attrs.organization, "organization"),
            (
                Nid::ORGANIZATIONALUNITNAME,
                &attrs.organizational_unit,
                "organizational unit",
            ),
            (Nid::COUNTRYNAME, &attrs.country_name, "country"),
            (
                Nid::STATEORPROVINCENAME,
                &attrs.state_or_province_name,
                "state/province",
            ),
            (Nid::LOCALITYNAME, &attrs.locality_name, "locality"),
        ];

        for (nid, value, label) in entries {
            if value.is_empty() {
                continue;
            }
            name_builder
                .append_entry_by_nid(nid, value)
                .map_err(|e| csr_error(&format!("Failed to set {}", label), e))?;
        }

        Ok(name_builder.build())
    }
}

/// Build a CSR for `attributes` signed with `key`.
pub fn build_csr(key: &KeyMaterial, attributes: &IdentityAttributes) -> Result<String> {
    CsrBuilder::new(attributes).build(key)
}

fn csr_error(stage: &str, e: impl std::fmt::Display) -> CertExchangeError {
    CertExchangeError::CsrBuild(format!("{}: {}", stage, e))
}
