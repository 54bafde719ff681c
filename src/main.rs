//! Cert Exchange - local certificate exchange run
//!
//! Wires a requirer and a provider together over the in-memory relation
//! network and runs the full exchange once:
//!
//! 1. the requirer generates its key and publishes a signing request
//! 2. the provider collects and verifies outstanding requests
//! 3. the local CA signs them and the provider publishes the certificates
//! 4. the requirer picks up the certificate matching its request
//!
//! Settings come from `cert-exchange.toml` (or `--config`). Missing sections
//! fall back to defaults.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use cert_exchange::authority::CertificateAuthority;
use cert_exchange::configs::{AppConfig, DEFAULT_CONFIG_PATH};
use cert_exchange::memory::{MemorySecretStore, RelationNetwork};
use cert_exchange::parser::parse_certificate;
use cert_exchange::provider::CertificateProvider;
use cert_exchange::relation::{app_of_unit, UnitContext};
use cert_exchange::requirer::{CertificateRequirer, RequestState};

const RELATION_ID: &str = "certificates:0";

#[derive(Parser, Debug)]
#[command(name = "cert-exchange")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = load_config(args.config.as_deref())?;
    println!("=== Cert Exchange ===\n");

    let units = &config.unit;
    let network = RelationNetwork::new();
    network
        .add_relation(
            RELATION_ID,
            &config.requirer.relation_name,
            [
                app_of_unit(&units.requirer_unit),
                app_of_unit(&units.provider_unit),
            ],
        )
        .context("Failed to create relation")?;
    network.join(RELATION_ID, &units.requirer_unit)?;
    network.join(RELATION_ID, &units.provider_unit)?;
    network.set_leader(&units.provider_unit, true)?;

    // Requirer side
    let requirer_store = network.handle(&units.requirer_unit);
    let secrets = MemorySecretStore::new();
    let requirer = CertificateRequirer::new(
        config.requirer.relation_name.clone(),
        config.requirer.identity.clone(),
        &requirer_store,
        &secrets,
        UnitContext::new(
            units.requirer_unit.clone(),
            units.model_name.clone(),
            units.model_uuid.clone(),
        ),
    )
    .secret_label(config.requirer.secret_label.clone())
    .key_size(config.requirer.key_size)
    .ca(config.requirer.ca);

    requirer
        .reconcile()
        .context("Failed to publish certificate signing request")?;
    println!("✓ Signing request published by {}", units.requirer_unit);

    // Provider side
    let authority =
        CertificateAuthority::generate(&config.authority.subject, config.authority.validity_days)
            .context("Failed to generate local CA")?;
    println!("✓ Local CA generated");

    let provider_store = network.handle(&units.provider_unit);
    let provider = CertificateProvider::new(
        config.provider.relation_name.clone(),
        &provider_store,
        &provider_store,
        UnitContext::new(
            units.provider_unit.clone(),
            units.model_name.clone(),
            units.model_uuid.clone(),
        ),
    );

    let pending = provider
        .outstanding_unissued()
        .context("Failed to collect signing requests")?;
    for request in &pending {
        let issued = authority
            .sign(&request.request, config.provider.validity_days)
            .with_context(|| format!("Failed to sign request from {}", request.unit))?;
        provider
            .publish_certificate(&request.relation_id, issued)
            .context("Failed to publish certificate")?;
        println!("✓ Certificate issued for {}", request.unit);
    }

    // Back on the requirer
    match requirer.state()? {
        RequestState::Fulfilled(issued) => {
            let info = parse_certificate(&issued.certificate)
                .context("Failed to parse issued certificate")?;
            println!("✓ Certificate received");
            println!("  Subject CN: {}", info.attributes.common_name);
            println!("  DNS SANs:   {}", info.attributes.sans_dns.join(", "));
            println!("  Issuer:     {}", info.issuer);
            println!("  Not after:  {}", info.not_after);
        }
        RequestState::Requested { .. } => {
            println!("✗ Request published but no certificate was issued");
        }
        RequestState::NoRequest => {
            return Err(anyhow::anyhow!("No signing request is published"));
        }
    }

    // A second pass must not publish anything new.
    let writes = network.write_count();
    requirer.reconcile()?;
    if network.write_count() == writes {
        println!("✓ Reconcile is idempotent");
    } else {
        return Err(anyhow::anyhow!("Second reconcile wrote relation data"));
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
            AppConfig::load().context("Failed to load config")
        }
        None => {
            tracing::info!("no {} found, using defaults", DEFAULT_CONFIG_PATH);
            Ok(AppConfig::default())
        }
    }
}
