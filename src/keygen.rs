//! Private key generation and storage for requirers.
//!
//! The requirer's RSA key lives in exactly one place: the scoped secret store,
//! under a fixed label. In memory it is kept inside a [`SecretString`] so it
//! never shows up in debug output or logs.

use std::collections::HashMap;
use std::fmt;

use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::error::{CertExchangeError, Result};
use crate::relation::{DataBag, SecretStore};

/// Label of the secret holding the requirer's private key.
pub const PRIVATE_KEY_SECRET_LABEL: &str = "PRIVATE_KEY";
/// Field of the secret content holding the PEM-encoded key.
pub const PRIVATE_KEY_FIELD: &str = "private-key";
/// Smallest (and default) RSA modulus size in bits.
pub const RSA_KEY_SIZE_DEFAULT: u32 = 2048;

/// PEM-encoded RSA private key held by a requirer.
pub struct KeyMaterial {
    pem: SecretString,
}

impl KeyMaterial {
    pub fn from_pem(pem: String) -> Self {
        Self {
            pem: SecretString::from(pem),
        }
    }

    /// The PEM text. Only call this to hand the key to the secret store.
    pub fn expose_pem(&self) -> &str {
        self.pem.expose_secret()
    }

    /// Decode into an openssl key for signing.
    pub fn private_key(&self) -> Result<PKey<Private>> {
        PKey::private_key_from_pem(self.expose_pem().as_bytes())
            .map_err(|e| CertExchangeError::parse("private key", e))
    }

    /// Secret store content for this key.
    pub fn to_secret_content(&self) -> DataBag {
        HashMap::from([(PRIVATE_KEY_FIELD.to_string(), self.expose_pem().to_string())])
    }

    /// Read the key back out of secret store content, if the field is set.
    pub fn from_secret_content(content: &DataBag) -> Option<Self> {
        content
            .get(PRIVATE_KEY_FIELD)
            .filter(|pem| !pem.is_empty())
            .map(|pem| Self::from_pem(pem.clone()))
    }
}

impl Clone for KeyMaterial {
    fn clone(&self) -> Self {
        Self::from_pem(self.expose_pem().to_string())
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.expose_pem().as_bytes() == other.expose_pem().as_bytes()
    }
}

impl Eq for KeyMaterial {}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("pem", &"<redacted>")
            .finish()
    }
}

/// Generate a fresh RSA key of at least [`RSA_KEY_SIZE_DEFAULT`] bits.
///
/// The key is encoded as a PKCS#1 `RSA PRIVATE KEY` PEM block.
pub fn generate_key(bits: u32) -> Result<KeyMaterial> {
    let bits = bits.max(RSA_KEY_SIZE_DEFAULT);
    let rsa = Rsa::generate(bits).map_err(|e| {
        CertExchangeError::KeyGeneration(format!("failed to generate RSA keypair: {}", e))
    })?;
    let pem = rsa.private_key_to_pem().map_err(|e| {
        CertExchangeError::KeyGeneration(format!("failed to PEM-encode private key: {}", e))
    })?;
    let pem = String::from_utf8(pem).map_err(|e| {
        CertExchangeError::KeyGeneration(format!("PEM output is not UTF-8: {}", e))
    })?;
    Ok(KeyMaterial::from_pem(pem))
}

/// Return `existing` unchanged, or generate a new key when there is none.
pub fn ensure_key(existing: Option<KeyMaterial>, bits: u32) -> Result<KeyMaterial> {
    match existing {
        Some(key) => Ok(key),
        None => generate_key(bits),
    }
}

/// Read the key stored under `label`, generating and storing one if absent.
///
/// A failing or empty secret read counts as "no key yet". Nothing is written
/// when generation fails.
pub fn ensure_stored_key(secrets: &dyn SecretStore, label: &str, bits: u32) -> Result<KeyMaterial> {
    let existing = match secrets.get_secret(label) {
        Ok(Some(content)) => KeyMaterial::from_secret_content(&content),
        Ok(None) => None,
        Err(e) => {
            debug!(label, error = %e, "could not read private key secret, treating as absent");
            None
        }
    };

    if let Some(key) = existing {
        return Ok(key);
    }

    warn!(label, "private key secret is empty, generating a new key");
    let key = ensure_key(None, bits)?;
    secrets.put_secret(label, key.to_secret_content())?;
    warn!(label, "generated new private key");
    Ok(key)
}

/// Read the key stored under `label` without generating one.
pub fn load_stored_key(secrets: &dyn SecretStore, label: &str) -> Result<KeyMaterial> {
    secrets
        .get_secret(label)?
        .as_ref()
        .and_then(KeyMaterial::from_secret_content)
        .ok_or_else(|| CertExchangeError::NotFound(format!("private key secret {}", label)))
}
