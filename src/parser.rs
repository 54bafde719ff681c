//! Certificate and CSR parsing.
//!
//! Decodes PEM-encoded requests and certificates into the normalized
//! [`IdentityAttributes`] shape. Only the first value of a multi-valued
//! subject field is kept. IP SANs are rendered in canonical string form.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509Req;
use x509_parser::certificate::X509Certificate;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;
use x509_parser::x509::{AttributeTypeAndValue, X509Name};

use crate::attributes::IdentityAttributes;
use crate::error::{CertExchangeError, Result};

/// A CSR as read from relation data: the raw PEM plus what it asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    /// PEM exactly as published. This is the correlation key.
    pub raw: String,
    pub attributes: IdentityAttributes,
    pub is_ca: bool,
}

/// Parsed view of a CSR, before any signature check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCsr {
    pub raw: String,
    pub attributes: IdentityAttributes,
}

/// Parsed view of an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub raw: String,
    pub attributes: IdentityAttributes,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
}

impl CertificateInfo {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}

fn decode_pem(pem_str: &str, what: &str) -> Result<pem::Pem> {
    pem::parse(pem_str).map_err(|_| CertExchangeError::PemDecode {
        what: what.to_string(),
    })
}

/// Parse a PEM CSR without checking its signature.
pub fn parse_csr(pem_str: &str) -> Result<ParsedCsr> {
    let block = decode_pem(pem_str, "certificate signing request")?;
    let (_, csr) = X509CertificationRequest::from_der(block.contents())
        .map_err(|e| CertExchangeError::parse("certificate signing request", e))?;

    let mut attributes = subject_attributes(&csr.certification_request_info.subject);
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                apply_general_names(&mut attributes, &san.general_names);
            }
        }
    }

    Ok(ParsedCsr {
        raw: pem_str.to_string(),
        attributes,
    })
}

/// Check the CSR's self-signature against the public key it carries.
pub fn verify_csr_signature(pem_str: &str) -> Result<()> {
    let req = X509Req::from_pem(pem_str.as_bytes())
        .map_err(|e| CertExchangeError::InvalidCsr(format!("unreadable request: {}", e)))?;
    let public_key = req
        .public_key()
        .map_err(|e| CertExchangeError::InvalidCsr(format!("unreadable public key: {}", e)))?;

    match req.verify(&public_key) {
        Ok(true) => Ok(()),
        Ok(false) => Err(CertExchangeError::InvalidCsr(
            "signature does not match the request's public key".to_string(),
        )),
        Err(e) => Err(CertExchangeError::InvalidCsr(format!(
            "signature verification failed: {}",
            e
        ))),
    }
}

/// True if the CSR was signed by `private_key`.
pub fn csr_signed_by(pem_str: &str, private_key: &PKey<Private>) -> Result<bool> {
    let req = X509Req::from_pem(pem_str.as_bytes())
        .map_err(|e| CertExchangeError::parse("certificate signing request", e))?;
    Ok(req.verify(private_key).unwrap_or(false))
}

/// Parse and verify a CSR published by a requirer.
pub fn load_signing_request(pem_str: &str, is_ca: bool) -> Result<SigningRequest> {
    let parsed = parse_csr(pem_str)?;
    verify_csr_signature(pem_str)?;
    Ok(SigningRequest {
        raw: parsed.raw,
        attributes: parsed.attributes,
        is_ca,
    })
}

/// Parse a PEM certificate.
pub fn parse_certificate(pem_str: &str) -> Result<CertificateInfo> {
    let block = decode_pem(pem_str, "certificate")?;
    let (_, cert) = X509Certificate::from_der(block.contents())
        .map_err(|e| CertExchangeError::parse("certificate", e))?;

    let mut attributes = subject_attributes(cert.subject());
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        apply_general_names(&mut attributes, &san.value.general_names);
    }

    let validity = cert.validity();
    let not_before = timestamp(validity.not_before.timestamp())?;
    let not_after = timestamp(validity.not_after.timestamp())?;

    let is_ca = cert
        .basic_constraints()
        .ok()
        .flatten()
        .map(|bc| bc.value.ca)
        .unwrap_or(false);

    Ok(CertificateInfo {
        raw: pem_str.to_string(),
        attributes,
        issuer: cert.issuer().to_string(),
        not_before,
        not_after,
        is_ca,
    })
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| CertExchangeError::parse("certificate validity", "timestamp out of range"))
}

fn first_value<'a, 'b: 'a, I>(mut values: I) -> String
where
    I: Iterator<Item = &'a AttributeTypeAndValue<'b>>,
{
    values
        .next()
        .and_then(|v| v.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn subject_attributes(subject: &X509Name) -> IdentityAttributes {
    IdentityAttributes {
        common_name: first_value(subject.iter_common_name()),
        organization: first_value(subject.iter_organization()),
        organizational_unit: first_value(subject.iter_organizational_unit()),
        country_name: first_value(subject.iter_country()),
        state_or_province_name: first_value(subject.iter_state_or_province()),
        locality_name: first_value(subject.iter_locality()),
        email_address: first_value(subject.iter_email()),
        ..Default::default()
    }
}

fn apply_general_names(attributes: &mut IdentityAttributes, names: &[GeneralName]) {
    let mut emails = Vec::new();
    for name in names {
        match name {
            GeneralName::DNSName(dns) => attributes.sans_dns.push(dns.to_string()),
            GeneralName::IPAddress(bytes) => {
                if let Some(ip) = ip_from_bytes(bytes) {
                    attributes.sans_ip.push(ip.to_string());
                }
            }
            GeneralName::RegisteredID(oid) => attributes.sans_oid.push(oid.to_id_string()),
            GeneralName::RFC822Name(email) => emails.push(email.to_string()),
            _ => {}
        }
    }
    // An rfc822Name SAN takes precedence over the subject emailAddress.
    if let Some(email) = emails.into_iter().next() {
        attributes.email_address = email;
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|o| IpAddr::V4(Ipv4Addr::from(o))),
        16 => <[u8; 16]>::try_from(bytes).ok().map(|o| IpAddr::V6(Ipv6Addr::from(o))),
        _ => None,
    }
}
