//! Requirer side of the certificate exchange.
//!
//! A requirer keeps exactly one signing request published per relation. The
//! request only changes when the desired identity or the stored key changes,
//! so `reconcile` can run on every event without writing anything.
//!
//! ```text
//! NoRequest --reconcile--> Requested --provider publishes--> Fulfilled
//!     ^                                                          |
//!     +--------- attributes, ca flag or key changed -------------+
//! ```

use std::collections::HashMap;

use tracing::{debug, info};

use crate::attributes::IdentityAttributes;
use crate::csr::build_csr;
use crate::error::{CertExchangeError, Result};
use crate::keygen::{
    ensure_stored_key, load_stored_key, KeyMaterial, PRIVATE_KEY_SECRET_LABEL, RSA_KEY_SIZE_DEFAULT,
};
use crate::parser::{csr_signed_by, parse_csr};
use crate::protocol::{
    deserialize_certificates, deserialize_requests, serialize_requests, IssuedCertificate,
    RequestRecord, CERTIFICATES_KEY, CSR_KEY,
};
use crate::relation::{app_of_unit, RelationStore, SecretStore, UnitContext};

/// Result of a [`CertificateRequirer::reconcile`] pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A matching request was already published; nothing was written.
    AlreadyRequested,
    /// A new request was published with this CSR.
    Requested { csr: String },
}

/// Where the requirer stands for its relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    NoRequest,
    Requested { csr: String },
    Fulfilled(IssuedCertificate),
}

pub struct CertificateRequirer<'a> {
    relation_name: String,
    attributes: IdentityAttributes,
    store: &'a dyn RelationStore,
    secrets: &'a dyn SecretStore,
    context: UnitContext,
    secret_label: String,
    key_size: u32,
    ca: bool,
}

impl<'a> CertificateRequirer<'a> {
    pub fn new(
        relation_name: String,
        attributes: IdentityAttributes,
        store: &'a dyn RelationStore,
        secrets: &'a dyn SecretStore,
        context: UnitContext,
    ) -> Self {
        Self {
            relation_name,
            attributes,
            store,
            secrets,
            context,
            secret_label: PRIVATE_KEY_SECRET_LABEL.to_string(),
            key_size: RSA_KEY_SIZE_DEFAULT,
            ca: false,
        }
    }

    pub fn secret_label(mut self, label: String) -> Self {
        self.secret_label = label;
        self
    }

    pub fn key_size(mut self, bits: u32) -> Self {
        self.key_size = bits;
        self
    }

    /// Ask for a CA certificate instead of a leaf.
    pub fn ca(mut self, ca: bool) -> Self {
        self.ca = ca;
        self
    }

    pub fn attributes(&self) -> &IdentityAttributes {
        &self.attributes
    }

    /// First relation established on the configured endpoint.
    pub fn relation_id(&self) -> Result<String> {
        if self.relation_name.is_empty() {
            return Err(CertExchangeError::Configuration(
                "relation name is empty".to_string(),
            ));
        }
        self.store
            .relation_ids(&self.relation_name)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                CertExchangeError::NotFound(format!("no relation found for {}", self.relation_name))
            })
    }

    /// Make sure a request matching the desired attributes is published.
    ///
    /// Writes only when no request is published, when the published one asks
    /// for different attributes or a different `ca` flag, or when it was not
    /// signed by the stored key. Transport errors are returned unchanged.
    pub fn reconcile(&self) -> Result<ReconcileOutcome> {
        let relation_id = self.relation_id()?;

        if self.certificate_requested(&relation_id)? {
            info!(relation_id = %relation_id, "certificate already requested");
            return Ok(ReconcileOutcome::AlreadyRequested);
        }

        let key = ensure_stored_key(self.secrets, &self.secret_label, self.key_size)?;
        let csr = build_csr(&key, &self.attributes)?;

        let payload = serialize_requests(&[RequestRecord::new(csr.clone(), self.ca)])?;
        self.store
            .write_unit_data(&relation_id, HashMap::from([(CSR_KEY.to_string(), payload)]))?;

        info!(
            relation_id = %relation_id,
            unit = %self.context.unit_name,
            common_name = %self.attributes.common_name,
            "published certificate signing request"
        );
        Ok(ReconcileOutcome::Requested { csr })
    }

    /// The CSR currently published by this unit, if any.
    pub fn published_csr(&self) -> Result<Option<String>> {
        let relation_id = self.relation_id()?;
        self.published_csr_on(&relation_id)
    }

    fn published_csr_on(&self, relation_id: &str) -> Result<Option<String>> {
        Ok(self
            .published_record_on(relation_id)?
            .map(|record| record.certificate_signing_request))
    }

    fn published_record_on(&self, relation_id: &str) -> Result<Option<RequestRecord>> {
        let data = self
            .store
            .read_unit_data(relation_id, &self.context.unit_name)?;
        let Some(json) = data.get(CSR_KEY).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        Ok(deserialize_requests(json)?
            .into_iter()
            .next()
            .filter(|record| !record.certificate_signing_request.is_empty()))
    }

    fn certificate_requested(&self, relation_id: &str) -> Result<bool> {
        let record = match self.published_record_on(relation_id) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(false),
            Err(e) if is_unreadable_request(&e) => {
                debug!(relation_id, error = %e, "published request unreadable, requesting again");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if record.ca != self.ca {
            debug!(relation_id, published = record.ca, wanted = self.ca, "ca flag changed");
            return Ok(false);
        }

        let csr = record.certificate_signing_request;
        let parsed = match parse_csr(&csr) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(relation_id, error = %e, "published CSR does not parse");
                return Ok(false);
            }
        };

        if parsed.attributes.common_name != self.attributes.common_name
            || parsed.attributes.sans_dns.len() != self.attributes.sans_dns.len()
        {
            return Ok(false);
        }
        if parsed.attributes != self.attributes.normalized() {
            debug!(relation_id, "published CSR asks for different attributes");
            return Ok(false);
        }

        // An unreadable or missing key is regenerated by reconcile.
        let key = match self.private_key() {
            Ok(key) => key,
            Err(e) => {
                debug!(relation_id, error = %e, "private key unavailable");
                return Ok(false);
            }
        };
        match key.private_key() {
            Ok(pkey) => Ok(csr_signed_by(&csr, &pkey).unwrap_or(false)),
            Err(_) => Ok(false),
        }
    }

    /// The stored private key. Never generates one.
    pub fn private_key(&self) -> Result<KeyMaterial> {
        load_stored_key(self.secrets, &self.secret_label)
    }

    /// Every certificate the provider has published on the relation.
    ///
    /// Callers sharing one relation between several identities filter the
    /// result by CSR, or use [`Self::matching_certificate`].
    pub fn fetch_certificates(&self) -> Result<Vec<IssuedCertificate>> {
        let relation_id = self.relation_id()?;
        let units = self.store.units(&relation_id)?;
        let Some(remote_unit) = units.first() else {
            return Err(CertExchangeError::NotFound(format!(
                "no remote units on relation {}",
                relation_id
            )));
        };

        let data = self
            .store
            .read_app_data(&relation_id, app_of_unit(remote_unit))?;
        let json = data
            .get(CERTIFICATES_KEY)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                CertExchangeError::NotFound(format!(
                    "no certificates published on relation {}",
                    relation_id
                ))
            })?;
        deserialize_certificates(json)
    }

    /// The issued certificate answering this unit's published CSR.
    pub fn matching_certificate(&self) -> Result<Option<IssuedCertificate>> {
        let Some(csr) = self.published_csr()? else {
            return Ok(None);
        };
        let certificates = match self.fetch_certificates() {
            Ok(certificates) => certificates,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(certificates
            .into_iter()
            .find(|c| c.certificate_signing_request == csr))
    }

    pub fn state(&self) -> Result<RequestState> {
        let Some(csr) = self.published_csr()? else {
            return Ok(RequestState::NoRequest);
        };
        match self.matching_certificate()? {
            Some(certificate) => Ok(RequestState::Fulfilled(certificate)),
            None => Ok(RequestState::Requested { csr }),
        }
    }
}

/// Decode and parse failures of the unit's own published data.
fn is_unreadable_request(e: &CertExchangeError) -> bool {
    matches!(
        e,
        CertExchangeError::Decode { .. }
            | CertExchangeError::PemDecode { .. }
            | CertExchangeError::Parse { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySecretStore, RelationNetwork};
    use crate::memory::UnitHandle;
    use crate::protocol::serialize_certificates;
    use crate::relation::DataBag;

    const RELATION: &str = "certificates:0";

    fn network() -> RelationNetwork {
        let network = RelationNetwork::new();
        network
            .add_relation(RELATION, "certificates", ["requirer", "provider"])
            .unwrap();
        network.join(RELATION, "requirer/0").unwrap();
        network.join(RELATION, "provider/0").unwrap();
        network
    }

    fn context() -> UnitContext {
        UnitContext::new(
            "requirer/0".to_string(),
            "test-model".to_string(),
            "1b7f5c2e-0000-4000-8000-000000000000".to_string(),
        )
    }

    fn attrs() -> IdentityAttributes {
        IdentityAttributes::new("example.com".to_string())
            .sans_dns(vec!["example.com".to_string(), "www.example.com".to_string()])
    }

    #[test]
    fn test_reconcile_publishes_single_request() {
        let network = network();
        let handle = network.handle("requirer/0");
        let secrets = MemorySecretStore::new();
        let requirer = CertificateRequirer::new(
            "certificates".to_string(),
            attrs(),
            &handle,
            &secrets,
            context(),
        );

        let outcome = requirer.reconcile().unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Requested { .. }));

        let data = network.unit_data(RELATION, "requirer/0").unwrap();
        let records = deserialize_requests(&data[CSR_KEY]).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].ca);
        assert!(data[CSR_KEY].contains(r#""ca":"false""#));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let network = network();
        let handle = network.handle("requirer/0");
        let secrets = MemorySecretStore::new();
        let requirer = CertificateRequirer::new(
            "certificates".to_string(),
            attrs(),
            &handle,
            &secrets,
            context(),
        );

        requirer.reconcile().unwrap();
        let writes = network.write_count();
        assert_eq!(
            requirer.reconcile().unwrap(),
            ReconcileOutcome::AlreadyRequested
        );
        assert_eq!(network.write_count(), writes);
        assert_eq!(secrets.write_count(), 1);
    }

    #[test]
    fn test_changed_attributes_trigger_new_request() {
        let network = network();
        let handle = network.handle("requirer/0");
        let secrets = MemorySecretStore::new();
        let first = CertificateRequirer::new(
            "certificates".to_string(),
            attrs(),
            &handle,
            &secrets,
            context(),
        );
        first.reconcile().unwrap();

        let changed = attrs().organization("Example Corp".to_string());
        let second = CertificateRequirer::new(
            "certificates".to_string(),
            changed,
            &handle,
            &secrets,
            context(),
        );
        assert!(matches!(
            second.reconcile().unwrap(),
            ReconcileOutcome::Requested { .. }
        ));
        assert_eq!(network.write_count(), 2);
        // Same key reused for the new request.
        assert_eq!(secrets.write_count(), 1);
    }

    #[test]
    fn test_replaced_key_triggers_new_request() {
        let network = network();
        let handle = network.handle("requirer/0");
        let secrets = MemorySecretStore::new();
        let requirer = CertificateRequirer::new(
            "certificates".to_string(),
            attrs(),
            &handle,
            &secrets,
            context(),
        );
        requirer.reconcile().unwrap();

        let other = crate::keygen::generate_key(2048).unwrap();
        secrets
            .put_secret(PRIVATE_KEY_SECRET_LABEL, other.to_secret_content())
            .unwrap();

        assert!(matches!(
            requirer.reconcile().unwrap(),
            ReconcileOutcome::Requested { .. }
        ));
    }

    #[test]
    fn test_non_canonical_oid_is_idempotent() {
        let network = network();
        let handle = network.handle("requirer/0");
        let secrets = MemorySecretStore::new();
        let requirer = CertificateRequirer::new(
            "certificates".to_string(),
            attrs().sans_oid(vec!["1.3.06.1".to_string()]),
            &handle,
            &secrets,
            context(),
        );

        assert!(matches!(
            requirer.reconcile().unwrap(),
            ReconcileOutcome::Requested { .. }
        ));
        let writes = network.write_count();
        assert_eq!(
            requirer.reconcile().unwrap(),
            ReconcileOutcome::AlreadyRequested
        );
        assert_eq!(network.write_count(), writes);
    }

    #[test]
    fn test_changed_ca_flag_triggers_new_request() {
        let network = network();
        let handle = network.handle("requirer/0");
        let secrets = MemorySecretStore::new();
        CertificateRequirer::new(
            "certificates".to_string(),
            attrs(),
            &handle,
            &secrets,
            context(),
        )
        .reconcile()
        .unwrap();

        let ca_requirer = CertificateRequirer::new(
            "certificates".to_string(),
            attrs(),
            &handle,
            &secrets,
            context(),
        )
        .ca(true);
        assert!(matches!(
            ca_requirer.reconcile().unwrap(),
            ReconcileOutcome::Requested { .. }
        ));

        let data = network.unit_data(RELATION, "requirer/0").unwrap();
        let records = deserialize_requests(&data[CSR_KEY]).unwrap();
        assert!(records[0].ca);
        assert_eq!(
            ca_requirer.reconcile().unwrap(),
            ReconcileOutcome::AlreadyRequested
        );
    }

    /// Unit reads fail, everything else goes through.
    struct UnreadableUnitData(UnitHandle);

    impl RelationStore for UnreadableUnitData {
        fn relation_ids(&self, relation_name: &str) -> Result<Vec<String>> {
            self.0.relation_ids(relation_name)
        }
        fn units(&self, relation_id: &str) -> Result<Vec<String>> {
            self.0.units(relation_id)
        }
        fn read_unit_data(&self, _relation_id: &str, _unit: &str) -> Result<DataBag> {
            Err(CertExchangeError::transport("read unit data", "connection reset"))
        }
        fn read_app_data(&self, relation_id: &str, app: &str) -> Result<DataBag> {
            self.0.read_app_data(relation_id, app)
        }
        fn write_unit_data(&self, relation_id: &str, data: DataBag) -> Result<()> {
            self.0.write_unit_data(relation_id, data)
        }
        fn write_app_data(&self, relation_id: &str, data: DataBag) -> Result<()> {
            self.0.write_app_data(relation_id, data)
        }
    }

    #[test]
    fn test_transport_error_on_read_is_propagated() {
        let network = network();
        let secrets = MemorySecretStore::new();
        let handle = network.handle("requirer/0");
        CertificateRequirer::new(
            "certificates".to_string(),
            attrs(),
            &handle,
            &secrets,
            context(),
        )
        .reconcile()
        .unwrap();
        let writes = network.write_count();

        let failing = UnreadableUnitData(network.handle("requirer/0"));
        let requirer = CertificateRequirer::new(
            "certificates".to_string(),
            attrs(),
            &failing,
            &secrets,
            context(),
        );
        let err = requirer.reconcile().unwrap_err();
        assert!(matches!(err, CertExchangeError::Transport { .. }));
        assert_eq!(network.write_count(), writes);
        assert_eq!(secrets.write_count(), 1);
    }

    #[test]
    fn test_garbled_published_request_is_replaced() {
        let network = network();
        network
            .seed_unit_data(RELATION, "requirer/0", CSR_KEY, "[{not json")
            .unwrap();
        let handle = network.handle("requirer/0");
        let secrets = MemorySecretStore::new();
        let requirer = CertificateRequirer::new(
            "certificates".to_string(),
            attrs(),
            &handle,
            &secrets,
            context(),
        );

        assert!(matches!(
            requirer.reconcile().unwrap(),
            ReconcileOutcome::Requested { .. }
        ));
        assert_eq!(network.write_count(), 1);
    }

    #[test]
    fn test_no_relation_is_not_found() {
        let network = RelationNetwork::new();
        let handle = network.handle("requirer/0");
        let secrets = MemorySecretStore::new();
        let requirer = CertificateRequirer::new(
            "certificates".to_string(),
            attrs(),
            &handle,
            &secrets,
            context(),
        );

        let err = requirer.reconcile().unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("certificates"));
        assert_eq!(secrets.write_count(), 0);
    }

    #[test]
    fn test_empty_relation_name_is_configuration_error() {
        let network = network();
        let handle = network.handle("requirer/0");
        let secrets = MemorySecretStore::new();
        let requirer =
            CertificateRequirer::new(String::new(), attrs(), &handle, &secrets, context());
        assert!(matches!(
            requirer.relation_id().unwrap_err(),
            CertExchangeError::Configuration(_)
        ));
    }

    #[test]
    fn test_invalid_oid_writes_nothing() {
        let network = network();
        let handle = network.handle("requirer/0");
        let secrets = MemorySecretStore::new();
        let requirer = CertificateRequirer::new(
            "certificates".to_string(),
            attrs().sans_oid(vec!["1.2.x".to_string()]),
            &handle,
            &secrets,
            context(),
        );

        let err = requirer.reconcile().unwrap_err();
        assert!(matches!(err, CertExchangeError::InvalidOid { .. }));
        assert_eq!(network.write_count(), 0);
    }

    #[test]
    fn test_fetch_certificates_and_state() {
        let network = network();
        let handle = network.handle("requirer/0");
        let secrets = MemorySecretStore::new();
        let requirer = CertificateRequirer::new(
            "certificates".to_string(),
            attrs(),
            &handle,
            &secrets,
            context(),
        );

        assert_eq!(requirer.state().unwrap(), RequestState::NoRequest);
        assert!(requirer.fetch_certificates().unwrap_err().is_not_found());

        let ReconcileOutcome::Requested { csr } = requirer.reconcile().unwrap() else {
            panic!("expected a new request");
        };
        assert_eq!(
            requirer.state().unwrap(),
            RequestState::Requested { csr: csr.clone() }
        );

        let issued = IssuedCertificate {
            ca: "CA".to_string(),
            chain: vec!["CA".to_string()],
            certificate_signing_request: csr,
            certificate: "LEAF".to_string(),
        };
        let other = IssuedCertificate {
            certificate_signing_request: "someone else".to_string(),
            ..issued.clone()
        };
        network
            .seed_app_data(
                RELATION,
                "provider",
                CERTIFICATES_KEY,
                &serialize_certificates(&[other, issued.clone()]).unwrap(),
            )
            .unwrap();

        assert_eq!(requirer.fetch_certificates().unwrap().len(), 2);
        assert_eq!(requirer.state().unwrap(), RequestState::Fulfilled(issued));
    }

    #[test]
    fn test_malformed_certificates_are_reported() {
        let network = network();
        network
            .seed_app_data(RELATION, "provider", CERTIFICATES_KEY, "{not json")
            .unwrap();
        let handle = network.handle("requirer/0");
        let secrets = MemorySecretStore::new();
        let requirer = CertificateRequirer::new(
            "certificates".to_string(),
            attrs(),
            &handle,
            &secrets,
            context(),
        );

        assert!(matches!(
            requirer.fetch_certificates().unwrap_err(),
            CertExchangeError::Decode { .. }
        ));
    }
}
