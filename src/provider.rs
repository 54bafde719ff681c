//! Provider side of the certificate exchange.
//!
//! The provider scans every relation on its endpoint for signing requests
//! published by remote units, verifies them, and answers on its application
//! bag. Only the leader may publish.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::error::{CertExchangeError, Result};
use crate::parser::{load_signing_request, SigningRequest};
use crate::protocol::{
    deserialize_certificates, deserialize_requests, serialize_certificates, IssuedCertificate,
    CERTIFICATES_KEY, CSR_KEY,
};
use crate::relation::{Leadership, RelationStore, UnitContext};

/// A verified signing request and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirerCertificateRequest {
    pub relation_id: String,
    pub unit: String,
    pub request: SigningRequest,
}

/// A request that could not be decoded, parsed or verified.
#[derive(Debug)]
pub struct RejectedRequest {
    pub relation_id: String,
    pub unit: String,
    pub error: CertExchangeError,
}

#[derive(Debug, Default)]
pub struct OutstandingRequests {
    pub requests: Vec<RequirerCertificateRequest>,
    pub rejected: Vec<RejectedRequest>,
}

pub struct CertificateProvider<'a> {
    relation_name: String,
    store: &'a dyn RelationStore,
    leadership: &'a dyn Leadership,
    context: UnitContext,
}

impl<'a> CertificateProvider<'a> {
    pub fn new(
        relation_name: String,
        store: &'a dyn RelationStore,
        leadership: &'a dyn Leadership,
        context: UnitContext,
    ) -> Self {
        Self {
            relation_name,
            store,
            leadership,
            context,
        }
    }

    /// Every valid signing request published by remote units.
    ///
    /// A malformed or badly signed request from one unit is recorded in
    /// `rejected` and does not stop the scan. Transport errors do.
    pub fn collect_outstanding_requests(&self) -> Result<OutstandingRequests> {
        if self.relation_name.is_empty() {
            return Err(CertExchangeError::Configuration(
                "relation name is empty".to_string(),
            ));
        }

        let mut outstanding = OutstandingRequests::default();
        for relation_id in self.store.relation_ids(&self.relation_name)? {
            for unit in self.store.units(&relation_id)? {
                let data = self.store.read_unit_data(&relation_id, &unit)?;
                let Some(json) = data.get(CSR_KEY).filter(|v| !v.is_empty()) else {
                    debug!(relation_id = %relation_id, unit = %unit, "no signing requests published");
                    continue;
                };

                let records = match deserialize_requests(json) {
                    Ok(records) => records,
                    Err(error) => {
                        warn!(relation_id = %relation_id, unit = %unit, error = %error, "rejecting signing requests");
                        outstanding.rejected.push(RejectedRequest {
                            relation_id: relation_id.clone(),
                            unit: unit.clone(),
                            error,
                        });
                        continue;
                    }
                };

                for record in records {
                    match load_signing_request(&record.certificate_signing_request, record.ca) {
                        Ok(request) => outstanding.requests.push(RequirerCertificateRequest {
                            relation_id: relation_id.clone(),
                            unit: unit.clone(),
                            request,
                        }),
                        Err(error) => {
                            warn!(relation_id = %relation_id, unit = %unit, error = %error, "rejecting signing request");
                            outstanding.rejected.push(RejectedRequest {
                                relation_id: relation_id.clone(),
                                unit: unit.clone(),
                                error,
                            });
                        }
                    }
                }
            }
        }

        info!(
            requests = outstanding.requests.len(),
            rejected = outstanding.rejected.len(),
            "collected signing requests"
        );
        Ok(outstanding)
    }

    /// Certificates this application has published on a relation.
    pub fn issued_certificates(&self, relation_id: &str) -> Result<Vec<IssuedCertificate>> {
        let data = self
            .store
            .read_app_data(relation_id, self.context.app_name())?;
        match data.get(CERTIFICATES_KEY).filter(|v| !v.is_empty()) {
            Some(json) => deserialize_certificates(json),
            None => Ok(Vec::new()),
        }
    }

    /// True if a certificate answering exactly this CSR is already published.
    pub fn already_issued(&self, relation_id: &str, csr: &str) -> Result<bool> {
        Ok(self
            .issued_certificates(relation_id)?
            .iter()
            .any(|c| c.certificate_signing_request == csr))
    }

    /// Requests that no published certificate answers yet.
    pub fn outstanding_unissued(&self) -> Result<Vec<RequirerCertificateRequest>> {
        let mut issued: HashMap<String, Vec<IssuedCertificate>> = HashMap::new();
        let mut pending = Vec::new();
        for request in self.collect_outstanding_requests()?.requests {
            if !issued.contains_key(&request.relation_id) {
                let certificates = self.issued_certificates(&request.relation_id)?;
                issued.insert(request.relation_id.clone(), certificates);
            }
            let answered = issued
                .get(&request.relation_id)
                .map(|certs| {
                    certs
                        .iter()
                        .any(|c| c.certificate_signing_request == request.request.raw)
                })
                .unwrap_or(false);
            if !answered {
                pending.push(request);
            }
        }
        Ok(pending)
    }

    /// Publish one certificate, replacing any entry for the same CSR.
    ///
    /// The certificate must answer a request currently published by a remote
    /// unit on `relation_id`, otherwise nothing is written and `NotFound` is
    /// returned.
    pub fn publish_certificate(
        &self,
        relation_id: &str,
        certificate: IssuedCertificate,
    ) -> Result<()> {
        self.require_leader(relation_id)?;

        if !self
            .published_csrs(relation_id)?
            .contains(&certificate.certificate_signing_request)
        {
            warn!(relation_id, "certificate does not answer any published request");
            return Err(CertExchangeError::NotFound(format!(
                "no signing request on {} matches the certificate",
                relation_id
            )));
        }

        let mut certificates = self.issued_certificates(relation_id)?;
        match certificates
            .iter_mut()
            .find(|c| c.certificate_signing_request == certificate.certificate_signing_request)
        {
            Some(existing) => *existing = certificate,
            None => certificates.push(certificate),
        }
        self.write_certificates(relation_id, &certificates)
    }

    /// Replace the published set. Later duplicates of a CSR win.
    ///
    /// Certificates whose CSR is no longer published on the relation are
    /// left out.
    pub fn publish_certificates(
        &self,
        relation_id: &str,
        certificates: Vec<IssuedCertificate>,
    ) -> Result<()> {
        self.require_leader(relation_id)?;

        let published = self.published_csrs(relation_id)?;
        let mut deduped: Vec<IssuedCertificate> = Vec::with_capacity(certificates.len());
        for certificate in certificates {
            if !published.contains(&certificate.certificate_signing_request) {
                warn!(relation_id, "dropping certificate without a published request");
                continue;
            }
            match deduped
                .iter_mut()
                .find(|c| c.certificate_signing_request == certificate.certificate_signing_request)
            {
                Some(existing) => *existing = certificate,
                None => deduped.push(certificate),
            }
        }
        self.write_certificates(relation_id, &deduped)
    }

    /// Raw CSRs the remote units currently publish on `relation_id`.
    ///
    /// Units whose request list does not decode contribute nothing.
    fn published_csrs(&self, relation_id: &str) -> Result<HashSet<String>> {
        let mut csrs = HashSet::new();
        for unit in self.store.units(relation_id)? {
            let data = self.store.read_unit_data(relation_id, &unit)?;
            let Some(json) = data.get(CSR_KEY).filter(|v| !v.is_empty()) else {
                continue;
            };
            match deserialize_requests(json) {
                Ok(records) => csrs.extend(
                    records
                        .into_iter()
                        .map(|record| record.certificate_signing_request),
                ),
                Err(e) => debug!(relation_id, unit = %unit, error = %e, "skipping undecodable requests"),
            }
        }
        Ok(csrs)
    }

    fn require_leader(&self, relation_id: &str) -> Result<()> {
        if self.leadership.is_leader()? {
            return Ok(());
        }
        warn!(relation_id, unit = %self.context.unit_name, "not the leader, skipping publish");
        Err(CertExchangeError::NotLeader {
            relation_id: relation_id.to_string(),
        })
    }

    fn write_certificates(&self, relation_id: &str, certificates: &[IssuedCertificate]) -> Result<()> {
        let json = serialize_certificates(certificates)?;
        self.store.write_app_data(
            relation_id,
            HashMap::from([(CERTIFICATES_KEY.to_string(), json)]),
        )?;
        info!(
            relation_id,
            count = certificates.len(),
            "published certificates"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::IdentityAttributes;
    use crate::csr::build_csr;
    use crate::keygen::generate_key;
    use crate::memory::RelationNetwork;
    use crate::protocol::{serialize_requests, RequestRecord};

    const RELATION: &str = "certificates:0";

    fn network() -> RelationNetwork {
        let network = RelationNetwork::new();
        network
            .add_relation(RELATION, "certificates", ["requirer", "provider"])
            .unwrap();
        network.join(RELATION, "requirer/0").unwrap();
        network.join(RELATION, "requirer/1").unwrap();
        network.join(RELATION, "provider/0").unwrap();
        network.set_leader("provider/0", true).unwrap();
        network
    }

    fn context() -> UnitContext {
        UnitContext::new(
            "provider/0".to_string(),
            "test-model".to_string(),
            "8d4a3c1e-0000-4000-8000-000000000000".to_string(),
        )
    }

    fn csr(cn: &str) -> String {
        let key = generate_key(2048).unwrap();
        build_csr(&key, &IdentityAttributes::new(cn.to_string())).unwrap()
    }

    fn publish_request(network: &RelationNetwork, unit: &str, csr: &str) {
        let json = serialize_requests(&[RequestRecord::new(csr.to_string(), false)]).unwrap();
        network.seed_unit_data(RELATION, unit, CSR_KEY, &json).unwrap();
    }

    fn issued(csr: &str, certificate: &str) -> IssuedCertificate {
        IssuedCertificate {
            ca: "CA".to_string(),
            chain: vec!["CA".to_string()],
            certificate_signing_request: csr.to_string(),
            certificate: certificate.to_string(),
        }
    }

    #[test]
    fn test_collects_requests_from_all_units() {
        let network = network();
        publish_request(&network, "requirer/0", &csr("a.example.com"));
        publish_request(&network, "requirer/1", &csr("b.example.com"));
        let handle = network.handle("provider/0");
        let provider = CertificateProvider::new("certificates".to_string(), &handle, &handle, context());

        let outstanding = provider.collect_outstanding_requests().unwrap();
        assert_eq!(outstanding.requests.len(), 2);
        assert!(outstanding.rejected.is_empty());
        let units: Vec<&str> = outstanding.requests.iter().map(|r| r.unit.as_str()).collect();
        assert_eq!(units, vec!["requirer/0", "requirer/1"]);
        assert_eq!(outstanding.requests[0].request.attributes.common_name, "a.example.com");
    }

    #[test]
    fn test_malformed_unit_is_isolated() {
        let network = network();
        publish_request(&network, "requirer/0", &csr("a.example.com"));
        network
            .seed_unit_data(RELATION, "requirer/1", CSR_KEY, "[{broken")
            .unwrap();
        let handle = network.handle("provider/0");
        let provider = CertificateProvider::new("certificates".to_string(), &handle, &handle, context());

        let outstanding = provider.collect_outstanding_requests().unwrap();
        assert_eq!(outstanding.requests.len(), 1);
        assert_eq!(outstanding.rejected.len(), 1);
        assert_eq!(outstanding.rejected[0].unit, "requirer/1");
        assert!(matches!(
            outstanding.rejected[0].error,
            CertExchangeError::Decode { .. }
        ));
    }

    #[test]
    fn test_units_without_requests_are_skipped() {
        let network = network();
        let handle = network.handle("provider/0");
        let provider = CertificateProvider::new("certificates".to_string(), &handle, &handle, context());

        let outstanding = provider.collect_outstanding_requests().unwrap();
        assert!(outstanding.requests.is_empty());
        assert!(outstanding.rejected.is_empty());
    }

    #[test]
    fn test_transport_error_aborts_scan() {
        let network = network();
        network.fail_transport(true).unwrap();
        let handle = network.handle("provider/0");
        let provider = CertificateProvider::new("certificates".to_string(), &handle, &handle, context());

        assert!(matches!(
            provider.collect_outstanding_requests().unwrap_err(),
            CertExchangeError::Transport { .. }
        ));
    }

    #[test]
    fn test_empty_relation_name() {
        let network = network();
        let handle = network.handle("provider/0");
        let provider = CertificateProvider::new(String::new(), &handle, &handle, context());
        assert!(matches!(
            provider.collect_outstanding_requests().unwrap_err(),
            CertExchangeError::Configuration(_)
        ));
    }

    #[test]
    fn test_publish_replaces_same_csr() {
        let network = network();
        let (csr_a, csr_b) = (csr("a.example.com"), csr("b.example.com"));
        publish_request(&network, "requirer/0", &csr_a);
        publish_request(&network, "requirer/1", &csr_b);
        let handle = network.handle("provider/0");
        let provider = CertificateProvider::new("certificates".to_string(), &handle, &handle, context());

        assert!(!provider.already_issued(RELATION, &csr_a).unwrap());
        provider.publish_certificate(RELATION, issued(&csr_a, "OLD")).unwrap();
        provider.publish_certificate(RELATION, issued(&csr_b, "B")).unwrap();
        provider.publish_certificate(RELATION, issued(&csr_a, "NEW")).unwrap();

        let certificates = provider.issued_certificates(RELATION).unwrap();
        assert_eq!(certificates.len(), 2);
        assert_eq!(certificates[0].certificate, "NEW");
        assert!(provider.already_issued(RELATION, &csr_a).unwrap());
        assert!(!provider.already_issued(RELATION, &format!("{}\n", csr_a)).unwrap());
    }

    #[test]
    fn test_publish_requires_published_request() {
        let network = network();
        publish_request(&network, "requirer/0", &csr("a.example.com"));
        let handle = network.handle("provider/0");
        let provider = CertificateProvider::new("certificates".to_string(), &handle, &handle, context());

        let err = provider
            .publish_certificate(RELATION, issued("NOT A REQUEST", "CERT"))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(provider.issued_certificates(RELATION).unwrap().is_empty());
        assert_eq!(network.write_count(), 0);
    }

    #[test]
    fn test_publish_certificates_dedupes() {
        let network = network();
        let (x, y) = (csr("x.example.com"), csr("y.example.com"));
        publish_request(&network, "requirer/0", &x);
        publish_request(&network, "requirer/1", &y);
        let handle = network.handle("provider/0");
        let provider = CertificateProvider::new("certificates".to_string(), &handle, &handle, context());

        provider
            .publish_certificates(
                RELATION,
                vec![
                    issued(&x, "1"),
                    issued(&y, "2"),
                    issued(&x, "3"),
                    issued("WITHDRAWN", "4"),
                ],
            )
            .unwrap();
        let certificates = provider.issued_certificates(RELATION).unwrap();
        assert_eq!(certificates.len(), 2);
        assert_eq!(certificates[0].certificate, "3");
        assert!(!provider.already_issued(RELATION, "WITHDRAWN").unwrap());
    }

    #[test]
    fn test_non_leader_writes_nothing() {
        let network = network();
        network.set_leader("provider/0", false).unwrap();
        let handle = network.handle("provider/0");
        let provider = CertificateProvider::new("certificates".to_string(), &handle, &handle, context());

        let err = provider
            .publish_certificate(RELATION, issued("CSR", "CERT"))
            .unwrap_err();
        assert!(matches!(err, CertExchangeError::NotLeader { .. }));
        assert!(provider
            .publish_certificates(RELATION, vec![issued("CSR", "CERT")])
            .is_err());
        assert_eq!(network.write_count(), 0);
    }

    #[test]
    fn test_outstanding_unissued_skips_answered() {
        let network = network();
        let first = csr("a.example.com");
        publish_request(&network, "requirer/0", &first);
        publish_request(&network, "requirer/1", &csr("b.example.com"));
        let handle = network.handle("provider/0");
        let provider = CertificateProvider::new("certificates".to_string(), &handle, &handle, context());

        provider.publish_certificate(RELATION, issued(&first, "CERT")).unwrap();
        let pending = provider.outstanding_unissued().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].unit, "requirer/1");
    }
}
