//! Collaborator interfaces consumed by the reconcilers.
//!
//! Relation transport, leadership and secret storage are external. The
//! reconcilers receive them as trait objects at construction, so tests can
//! substitute the in-memory implementations from [`crate::memory`].

use std::collections::HashMap;

use crate::error::Result;

/// String-keyed mapping stored per unit or per application on a relation.
pub type DataBag = HashMap<String, String>;

/// Read/write access to relation data as seen from the local unit.
pub trait RelationStore {
    /// Ids of the relations established on the named endpoint.
    fn relation_ids(&self, relation_name: &str) -> Result<Vec<String>>;

    /// Remote units joined to a relation.
    fn units(&self, relation_id: &str) -> Result<Vec<String>>;

    /// Data bag of a unit (local or remote) on a relation.
    fn read_unit_data(&self, relation_id: &str, unit: &str) -> Result<DataBag>;

    /// Data bag of an application (local or remote) on a relation.
    fn read_app_data(&self, relation_id: &str, app: &str) -> Result<DataBag>;

    /// Replace keys in the local unit's bag.
    fn write_unit_data(&self, relation_id: &str, data: DataBag) -> Result<()>;

    /// Replace keys in the local application's bag. Leader only.
    fn write_app_data(&self, relation_id: &str, data: DataBag) -> Result<()>;
}

pub trait Leadership {
    fn is_leader(&self) -> Result<bool>;
}

/// Labeled secret storage scoped to the local unit.
pub trait SecretStore {
    fn get_secret(&self, label: &str) -> Result<Option<DataBag>>;
    fn put_secret(&self, label: &str, content: DataBag) -> Result<()>;
}

/// Read-only environment of the running unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitContext {
    pub unit_name: String,
    pub model_name: String,
    pub model_uuid: String,
}

impl UnitContext {
    pub fn new(unit_name: String, model_name: String, model_uuid: String) -> Self {
        Self {
            unit_name,
            model_name,
            model_uuid,
        }
    }

    /// Application name, the unit name without its `/N` suffix.
    pub fn app_name(&self) -> &str {
        app_of_unit(&self.unit_name)
    }
}

/// `"requirer/0"` -> `"requirer"`.
pub fn app_of_unit(unit: &str) -> &str {
    unit.split('/').next().unwrap_or(unit)
}
