use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::attributes::IdentityAttributes;
use crate::authority::CaSubject;
use crate::error::{CertExchangeError, Result};
use crate::keygen::{PRIVATE_KEY_SECRET_LABEL, RSA_KEY_SIZE_DEFAULT};

pub const DEFAULT_CONFIG_PATH: &str = "cert-exchange.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub requirer: RequirerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub unit: UnitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RequirerConfig {
    #[serde(default = "default_relation_name")]
    pub relation_name: String,
    #[serde(default = "default_secret_label")]
    pub secret_label: String,
    #[serde(default = "default_key_size")]
    pub key_size: u32,
    #[serde(default)]
    pub ca: bool,
    #[serde(default = "default_identity")]
    pub identity: IdentityAttributes,
}

impl Default for RequirerConfig {
    fn default() -> Self {
        Self {
            relation_name: default_relation_name(),
            secret_label: default_secret_label(),
            key_size: default_key_size(),
            ca: false,
            identity: default_identity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_relation_name")]
    pub relation_name: String,
    #[serde(default = "default_certificate_validity")]
    pub validity_days: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            relation_name: default_relation_name(),
            validity_days: default_certificate_validity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthorityConfig {
    #[serde(default)]
    pub subject: CaSubject,
    #[serde(default = "default_ca_validity")]
    pub validity_days: u32,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            subject: CaSubject::default(),
            validity_days: default_ca_validity(),
        }
    }
}

/// Unit names used when running the in-memory exchange.
#[derive(Debug, Deserialize, Clone)]
pub struct UnitConfig {
    #[serde(default = "default_requirer_unit")]
    pub requirer_unit: String,
    #[serde(default = "default_provider_unit")]
    pub provider_unit: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_model_uuid")]
    pub model_uuid: String,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            requirer_unit: default_requirer_unit(),
            provider_unit: default_provider_unit(),
            model_name: default_model_name(),
            model_uuid: default_model_uuid(),
        }
    }
}

fn default_relation_name() -> String {
    "certificates".to_string()
}

fn default_secret_label() -> String {
    PRIVATE_KEY_SECRET_LABEL.to_string()
}

fn default_key_size() -> u32 {
    RSA_KEY_SIZE_DEFAULT
}

fn default_identity() -> IdentityAttributes {
    IdentityAttributes::new("example.com".to_string())
        .sans_dns(vec!["example.com".to_string()])
}

fn default_certificate_validity() -> u32 {
    90
}

fn default_ca_validity() -> u32 {
    3650 // 10 years
}

fn default_requirer_unit() -> String {
    "requirer/0".to_string()
}

fn default_provider_unit() -> String {
    "provider/0".to_string()
}

fn default_model_name() -> String {
    "local".to_string()
}

fn default_model_uuid() -> String {
    "00000000-0000-4000-8000-000000000000".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path).map_err(|e| {
            CertExchangeError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: AppConfig = toml::from_str(&config_str).map_err(|e| {
            CertExchangeError::Configuration(format!("Failed to parse config file: {}", e))
        })?;

        Ok(config)
    }

    /// Load configuration with default path (cert-exchange.toml)
    pub fn load() -> Result<Self> {
        Self::from_file(DEFAULT_CONFIG_PATH)
    }
}
