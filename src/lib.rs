//! Cert Exchange - X.509 certificate request/issue exchange over relations
//!
//! Two parties share string-keyed data bags over a *relation*. A **requirer**
//! keeps one signing request published for its desired identity; a
//! **provider** reads, verifies and answers those requests. An issued
//! certificate is tied back to its request by the exact CSR text.
//!
//! # Overview
//!
//! ```text
//! requirer unit bag                        provider application bag
//! certificate_signing_requests  ───────▶   (read + verify)
//!                               ◀───────   certificates
//! ```
//!
//! Relation transport, secret storage and leadership are external. They are
//! reached through the traits in [`relation`]; [`memory`] has in-process
//! implementations used by the tests and the demo binary.
//!
//! # Quick Start
//!
//! ```no_run
//! use cert_exchange::attributes::IdentityAttributes;
//! use cert_exchange::memory::{MemorySecretStore, RelationNetwork};
//! use cert_exchange::relation::UnitContext;
//! use cert_exchange::requirer::CertificateRequirer;
//!
//! # fn main() -> cert_exchange::error::Result<()> {
//! let network = RelationNetwork::new();
//! network.add_relation("certificates:0", "certificates", ["app", "ca"])?;
//! network.join("certificates:0", "app/0")?;
//! network.join("certificates:0", "ca/0")?;
//!
//! let store = network.handle("app/0");
//! let secrets = MemorySecretStore::new();
//! let context = UnitContext::new("app/0".into(), "dev".into(), "uuid".into());
//! let attrs = IdentityAttributes::new("app.example.com".to_string())
//!     .sans_dns(vec!["app.example.com".to_string()]);
//!
//! let requirer = CertificateRequirer::new("certificates".into(), attrs, &store, &secrets, context);
//! requirer.reconcile()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Module Overview
//!
//! - [`attributes`]: desired certificate identity
//! - [`keygen`]: RSA key generation and secret-store persistence
//! - [`csr`]: signing request construction
//! - [`parser`]: CSR and certificate parsing and verification
//! - [`protocol`]: JSON wire records
//! - [`requirer`] / [`provider`]: the two reconcilers
//! - [`authority`]: local CA used to answer requests in tests and the demo
//! - [`configs`]: TOML configuration
//!
//! # Error Handling
//!
//! Library APIs return [`error::Result`]; the binary wraps them in
//! `anyhow::Result`.

pub mod attributes;
pub mod authority;
pub mod configs;
pub mod csr;
pub mod error;
pub mod keygen;
pub mod memory;
pub mod parser;
pub mod protocol;
pub mod provider;
pub mod relation;
pub mod requirer;
