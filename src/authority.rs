//! Local Signing Authority
//!
//! A minimal openssl-backed CA that turns verified [`SigningRequest`]s into
//! [`IssuedCertificate`]s. Providers that delegate signing elsewhere never
//! need it; the demo binary and the exchange tests use it to close the loop.
//!
//! # Certificate Properties
//! - **CA certificate**: self-signed, BasicConstraints CA (pathlen 0),
//!   keyCertSign + cRLSign
//! - **Issued leaf**: CA=false, digitalSignature + keyEncipherment,
//!   serverAuth + clientAuth
//! - **Issued CA** (request flagged `ca`): CA=true, pathlen 0
//! - **Serial**: random 128-bit
//! - **Digest**: SHA-256
//!
//! The subject and public key of an issued certificate come from the CSR.
//! SANs are rebuilt from the parsed attributes, so unknown SAN types in the
//! request are not carried over.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509Builder, X509Name, X509NameRef, X509Req, X509};
use serde::Deserialize;
use tracing::info;

use crate::attributes::IdentityAttributes;
use crate::csr::{parse_ip_san, parse_oid_san};
use crate::error::{CertExchangeError, Result};
use crate::keygen::{KeyMaterial, RSA_KEY_SIZE_DEFAULT};
use crate::parser::SigningRequest;
use crate::protocol::IssuedCertificate;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const CA_PATH_LENGTH: u32 = 0;

/// Distinguished name of the local CA.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CaSubject {
    pub common_name: String,
    pub organization: String,
    pub organizational_unit: String,
    pub country: String,
    pub state: String,
    pub locality: String,
}

impl Default for CaSubject {
    fn default() -> Self {
        Self {
            common_name: "cert-exchange local CA".to_string(),
            organization: "cert-exchange".to_string(),
            organizational_unit: String::new(),
            country: String::new(),
            state: String::new(),
            locality: String::new(),
        }
    }
}

impl CaSubject {
    fn to_attributes(&self) -> IdentityAttributes {
        IdentityAttributes::new(self.common_name.clone())
            .organization(self.organization.clone())
            .organizational_unit(self.organizational_unit.clone())
            .country(self.country.clone())
            .state(self.state.clone())
            .locality(self.locality.clone())
    }
}

pub struct CertificateAuthority {
    private_key: PKey<Private>,
    certificate: X509,
}

impl CertificateAuthority {
    /// Generate a fresh self-signed CA.
    pub fn generate(subject: &CaSubject, validity_days: u32) -> Result<Self> {
        let rsa = Rsa::generate(RSA_KEY_SIZE_DEFAULT).map_err(|e| {
            CertExchangeError::KeyGeneration(format!("failed to generate RSA keypair: {}", e))
        })?;
        let private_key = PKey::from_rsa(rsa).map_err(|e| {
            CertExchangeError::KeyGeneration(format!("failed to create private key: {}", e))
        })?;

        let name = subject_name(&subject.to_attributes())?;
        let mut builder = new_builder(&name, &name, &private_key, validity_days)?;

        append_ca_extensions(&mut builder)?;

        builder
            .sign(&private_key, MessageDigest::sha256())
            .map_err(|e| signing_error("Failed to sign certificate", e))?;

        info!(common_name = %subject.common_name, validity_days, "generated local CA");
        Ok(Self {
            private_key,
            certificate: builder.build(),
        })
    }

    /// Load an existing CA from its PEM certificate and key.
    pub fn from_pem(certificate_pem: &str, key: &KeyMaterial) -> Result<Self> {
        let certificate = X509::from_pem(certificate_pem.as_bytes())
            .map_err(|e| CertExchangeError::parse("CA certificate", e))?;
        Ok(Self {
            private_key: key.private_key()?,
            certificate,
        })
    }

    pub fn certificate_pem(&self) -> Result<String> {
        let pem = self
            .certificate
            .to_pem()
            .map_err(|e| signing_error("Failed to PEM-encode CA certificate", e))?;
        String::from_utf8(pem).map_err(|e| signing_error("CA PEM is not UTF-8", e))
    }

    /// Issue a certificate for a verified request.
    ///
    /// The returned record carries the request PEM verbatim so requirers can
    /// correlate it.
    pub fn sign(&self, request: &SigningRequest, validity_days: u32) -> Result<IssuedCertificate> {
        let req = X509Req::from_pem(request.raw.as_bytes())
            .map_err(|e| CertExchangeError::InvalidCsr(format!("unreadable request: {}", e)))?;
        let public_key = req
            .public_key()
            .map_err(|e| CertExchangeError::InvalidCsr(format!("unreadable public key: {}", e)))?;

        let mut builder = new_builder(
            req.subject_name(),
            self.certificate.subject_name(),
            &public_key,
            validity_days,
        )?;

        if request.is_ca {
            append_ca_extensions(&mut builder)?;
        } else {
            append_leaf_extensions(&mut builder)?;
        }

        append_sans(&mut builder, &request.attributes, Some(&self.certificate))?;

        builder
            .sign(&self.private_key, MessageDigest::sha256())
            .map_err(|e| signing_error("Failed to sign certificate", e))?;
        let certificate = to_pem_string(&builder.build())?;
        let ca = self.certificate_pem()?;

        info!(
            common_name = %request.attributes.common_name,
            ca = request.is_ca,
            validity_days,
            "issued certificate"
        );
        Ok(IssuedCertificate {
            ca: ca.clone(),
            chain: vec![ca],
            certificate_signing_request: request.raw.clone(),
            certificate,
        })
    }
}

/// Options for [`generate_self_signed`].
#[derive(Debug, Clone)]
pub struct SelfSignedOptions {
    pub attributes: IdentityAttributes,
    pub validity_days: u32,
}

/// Self-signed leaf for serverAuth and clientAuth, with a fresh 2048-bit key.
///
/// Only the subject fields and IP SANs of `attributes` are used.
pub fn generate_self_signed(opts: &SelfSignedOptions) -> Result<(String, KeyMaterial)> {
    let key = crate::keygen::generate_key(RSA_KEY_SIZE_DEFAULT)?;
    let private_key = key.private_key()?;

    let name = subject_name(&opts.attributes)?;
    let mut builder = new_builder(&name, &name, &private_key, opts.validity_days)?;
    append_leaf_extensions(&mut builder)?;

    let ip_only = IdentityAttributes {
        sans_ip: opts.attributes.sans_ip.clone(),
        ..Default::default()
    };
    append_sans(&mut builder, &ip_only, None)?;

    builder
        .sign(&private_key, MessageDigest::sha256())
        .map_err(|e| signing_error("Failed to sign certificate", e))?;
    Ok((to_pem_string(&builder.build())?, key))
}

fn new_builder<K: openssl::pkey::HasPublic>(
    subject: &X509NameRef,
    issuer: &X509NameRef,
    public_key: &PKey<K>,
    validity_days: u32,
) -> Result<X509Builder> {
    let mut builder = X509::builder().map_err(|e| signing_error("Failed to create X509 builder", e))?;
    builder
        .set_version(X509_VERSION_3)
        .map_err(|e| signing_error("Failed to set version", e))?;

    // Random 128-bit serial number
    let mut serial = BigNum::new().map_err(|e| signing_error("Failed to allocate serial", e))?;
    serial
        .rand(128, MsbOption::MAYBE_ZERO, false)
        .map_err(|e| signing_error("Failed to generate serial", e))?;
    let serial = serial
        .to_asn1_integer()
        .map_err(|e| signing_error("Failed to encode serial", e))?;
    builder
        .set_serial_number(&serial)
        .map_err(|e| signing_error("Failed to set serial", e))?;

    builder
        .set_subject_name(subject)
        .map_err(|e| signing_error("Failed to set subject", e))?;
    builder
        .set_issuer_name(issuer)
        .map_err(|e| signing_error("Failed to set issuer", e))?;

    let not_before =
        Asn1Time::days_from_now(0).map_err(|e| signing_error("Failed to create not_before", e))?;
    builder
        .set_not_before(&not_before)
        .map_err(|e| signing_error("Failed to set not_before", e))?;
    let not_after = Asn1Time::days_from_now(validity_days)
        .map_err(|e| signing_error("Failed to create not_after", e))?;
    builder
        .set_not_after(&not_after)
        .map_err(|e| signing_error("Failed to set not_after", e))?;

    builder
        .set_pubkey(public_key)
        .map_err(|e| signing_error("Failed to set public key", e))?;
    Ok(builder)
}

fn append_ca_extensions(builder: &mut X509Builder) -> Result<()> {
    let bc = BasicConstraints::new()
        .critical()
        .ca()
        .pathlen(CA_PATH_LENGTH)
        .build()
        .map_err(|e| signing_error("Failed to build BasicConstraints", e))?;
    builder
        .append_extension(bc)
        .map_err(|e| signing_error("Failed to add BasicConstraints", e))?;
    let ku = KeyUsage::new()
        .critical()
        .key_cert_sign()
        .crl_sign()
        .digital_signature()
        .build()
        .map_err(|e| signing_error("Failed to build KeyUsage", e))?;
    builder
        .append_extension(ku)
        .map_err(|e| signing_error("Failed to add KeyUsage", e))
}

fn append_leaf_extensions(builder: &mut X509Builder) -> Result<()> {
    let bc = BasicConstraints::new()
        .critical()
        .build()
        .map_err(|e| signing_error("Failed to build BasicConstraints", e))?;
    builder
        .append_extension(bc)
        .map_err(|e| signing_error("Failed to add BasicConstraints", e))?;
    let ku = KeyUsage::new()
        .critical()
        .digital_signature()
        .key_encipherment()
        .build()
        .map_err(|e| signing_error("Failed to build KeyUsage", e))?;
    builder
        .append_extension(ku)
        .map_err(|e| signing_error("Failed to add KeyUsage", e))?;
    let eku = ExtendedKeyUsage::new()
        .server_auth()
        .client_auth()
        .build()
        .map_err(|e| signing_error("Failed to build ExtendedKeyUsage", e))?;
    builder
        .append_extension(eku)
        .map_err(|e| signing_error("Failed to add ExtendedKeyUsage", e))
}

fn append_sans(
    builder: &mut X509Builder,
    attributes: &IdentityAttributes,
    issuer: Option<&X509>,
) -> Result<()> {
    let ips: Vec<String> = attributes
        .sans_ip
        .iter()
        .filter_map(|ip| parse_ip_san(ip))
        .map(|ip| ip.to_string())
        .collect();
    let oids = attributes
        .sans_oid
        .iter()
        .map(|oid| parse_oid_san(oid))
        .collect::<Result<Vec<String>>>()?;

    if attributes.sans_dns.is_empty()
        && ips.is_empty()
        && oids.is_empty()
        && attributes.email_address.is_empty()
    {
        return Ok(());
    }

    let mut san = SubjectAlternativeName::new();
    for dns in &attributes.sans_dns {
        san.dns(dns);
    }
    for ip in &ips {
        san.ip(ip);
    }
    for oid in &oids {
        san.rid(oid);
    }
    if !attributes.email_address.is_empty() {
        san.email(&attributes.email_address);
    }

    let extension = {
        let context = builder.x509v3_context(issuer.map(|c| &**c), None);
        san.build(&context)
            .map_err(|e| signing_error("Failed to build SubjectAlternativeName", e))?
    };
    builder
        .append_extension(extension)
        .map_err(|e| signing_error("Failed to add SubjectAlternativeName", e))
}

fn subject_name(attrs: &IdentityAttributes) -> Result<X509Name> {
    let mut name_builder =
        X509Name::builder().map_err(|e| signing_error("Failed to create name builder", e))?;
    let entries = [
        (Nid::COMMONNAME, &attrs.common_name, "CN"),
        (Nid::ORGANIZATIONNAME, &attrs.organization, "organization"),
        (Nid::ORGANIZATIONALUNITNAME, &attrs.organizational_unit, "organizational unit"),
        (Nid::COUNTRYNAME, &attrs.country_name, "country"),
        (Nid::STATEORPROVINCENAME, &attrs.state_or_province_name, "state/province"),
        (Nid::LOCALITYNAME, &attrs.locality_name, "locality"),
    ];
    for (nid, value, label) in entries {
        if value.is_empty() {
            continue;
        }
        name_builder
            .append_entry_by_nid(nid, value)
            .map_err(|e| signing_error(&format!("Failed to set {}", label), e))?;
    }
    Ok(name_builder.build())
}

fn to_pem_string(certificate: &X509) -> Result<String> {
    let pem = certificate
        .to_pem()
        .map_err(|e| signing_error("Failed to PEM-encode certificate", e))?;
    String::from_utf8(pem).map_err(|e| signing_error("Certificate PEM is not UTF-8", e))
}

fn signing_error(stage: &str, e: impl std::fmt::Display) -> CertExchangeError {
    CertExchangeError::Signing(format!("{}: {}", stage, e))
}
