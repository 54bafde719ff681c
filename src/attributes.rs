//! Identity attributes describing the certificate subject a requirer wants.

use serde::{Deserialize, Serialize};

use crate::csr::{parse_ip_san, parse_oid_san};

/// Requested subject and SAN entries for one certificate.
///
/// Every subject field is single-valued. An empty string means the field is
/// not set and is left out of the CSR. Equality compares every field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityAttributes {
    pub common_name: String,
    pub sans_dns: Vec<String>,
    pub sans_ip: Vec<String>,
    pub sans_oid: Vec<String>,
    pub email_address: String,
    pub organization: String,
    pub organizational_unit: String,
    pub country_name: String,
    pub state_or_province_name: String,
    pub locality_name: String,
}

impl IdentityAttributes {
    pub fn new(common_name: String) -> Self {
        Self {
            common_name,
            ..Default::default()
        }
    }

    pub fn sans_dns(mut self, names: Vec<String>) -> Self {
        self.sans_dns = names;
        self
    }

    pub fn sans_ip(mut self, addresses: Vec<String>) -> Self {
        self.sans_ip = addresses;
        self
    }

    pub fn sans_oid(mut self, oids: Vec<String>) -> Self {
        self.sans_oid = oids;
        self
    }

    pub fn email_address(mut self, email: String) -> Self {
        self.email_address = email;
        self
    }

    pub fn organization(mut self, org: String) -> Self {
        self.organization = org;
        self
    }

    pub fn organizational_unit(mut self, ou: String) -> Self {
        self.organizational_unit = ou;
        self
    }

    /// Two-letter ISO 3166-1 country code.
    pub fn country(mut self, country: String) -> Self {
        self.country_name = country;
        self
    }

    pub fn state(mut self, state: String) -> Self {
        self.state_or_province_name = state;
        self
    }

    pub fn locality(mut self, locality: String) -> Self {
        self.locality_name = locality;
        self
    }

    /// The attributes as a parsed CSR built from them would report them.
    ///
    /// IP SANs that do not parse are dropped and the rest are rendered in
    /// canonical form (`::1`, not `0:0:0:0:0:0:0:1`). OIDs are rewritten in
    /// canonical dotted form; a malformed OID is kept as given.
    pub fn normalized(&self) -> Self {
        let sans_ip = self
            .sans_ip
            .iter()
            .filter_map(|ip| parse_ip_san(ip))
            .map(|ip| ip.to_string())
            .collect();
        let sans_oid = self
            .sans_oid
            .iter()
            .map(|oid| parse_oid_san(oid).unwrap_or_else(|_| oid.clone()))
            .collect();
        Self {
            sans_ip,
            sans_oid,
            ..self.clone()
        }
    }
}
