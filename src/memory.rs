//! In-memory collaborators.
//!
//! [`RelationNetwork`] models a set of relations between applications, with
//! per-unit and per-application data bags and a leader per application. Each
//! unit gets a [`UnitHandle`] view that implements [`RelationStore`] and
//! [`Leadership`] with the same scope rules as the real transport: a unit
//! only writes its own bag, and only the leader writes its application's bag.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::error::{CertExchangeError, Result};
use crate::relation::{app_of_unit, DataBag, Leadership, RelationStore, SecretStore};

#[derive(Debug, Default)]
struct RelationState {
    endpoint: String,
    apps: BTreeSet<String>,
    units: BTreeSet<String>,
    unit_data: HashMap<String, DataBag>,
    app_data: HashMap<String, DataBag>,
}

#[derive(Debug, Default)]
struct NetworkState {
    relations: BTreeMap<String, RelationState>,
    leaders: HashSet<String>,
    writes: usize,
    fail_transport: bool,
}

/// Shared model of relations. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct RelationNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl RelationNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Establish a relation on `endpoint` between two applications.
    pub fn add_relation(&self, relation_id: &str, endpoint: &str, apps: [&str; 2]) -> Result<()> {
        let mut state = self.write()?;
        let relation = state.relations.entry(relation_id.to_string()).or_default();
        relation.endpoint = endpoint.to_string();
        relation.apps.extend(apps.iter().map(|app| app.to_string()));
        Ok(())
    }

    /// Join a unit to a relation. Its application must be part of it.
    pub fn join(&self, relation_id: &str, unit: &str) -> Result<()> {
        let mut state = self.write()?;
        let relation = relation_mut(&mut state, relation_id)?;
        if !relation.apps.contains(app_of_unit(unit)) {
            return Err(CertExchangeError::Configuration(format!(
                "application of {} is not part of relation {}",
                unit, relation_id
            )));
        }
        relation.units.insert(unit.to_string());
        Ok(())
    }

    pub fn set_leader(&self, unit: &str, leader: bool) -> Result<()> {
        let mut state = self.write()?;
        if leader {
            state.leaders.insert(unit.to_string());
        } else {
            state.leaders.remove(unit);
        }
        Ok(())
    }

    /// Seed a unit bag without counting it as a write.
    pub fn seed_unit_data(&self, relation_id: &str, unit: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.write()?;
        relation_mut(&mut state, relation_id)?
            .unit_data
            .entry(unit.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Seed an application bag without counting it as a write.
    pub fn seed_app_data(&self, relation_id: &str, app: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.write()?;
        relation_mut(&mut state, relation_id)?
            .app_data
            .entry(app.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn unit_data(&self, relation_id: &str, unit: &str) -> Result<DataBag> {
        let state = self.read()?;
        Ok(relation_ref(&state, relation_id)?
            .unit_data
            .get(unit)
            .cloned()
            .unwrap_or_default())
    }

    pub fn app_data(&self, relation_id: &str, app: &str) -> Result<DataBag> {
        let state = self.read()?;
        Ok(relation_ref(&state, relation_id)?
            .app_data
            .get(app)
            .cloned()
            .unwrap_or_default())
    }

    /// Number of unit and application writes performed through handles.
    pub fn write_count(&self) -> usize {
        self.state.read().map(|s| s.writes).unwrap_or_default()
    }

    /// Make every handle operation fail with a transport error.
    pub fn fail_transport(&self, fail: bool) -> Result<()> {
        self.write()?.fail_transport = fail;
        Ok(())
    }

    /// View of the network from `unit`.
    pub fn handle(&self, unit: &str) -> UnitHandle {
        UnitHandle {
            network: self.clone(),
            unit: unit.to_string(),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, NetworkState>> {
        self.state
            .read()
            .map_err(|e| CertExchangeError::transport("relation read", format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, NetworkState>> {
        self.state
            .write()
            .map_err(|e| CertExchangeError::transport("relation write", format!("lock poisoned: {}", e)))
    }
}

fn relation_ref<'a>(state: &'a NetworkState, relation_id: &str) -> Result<&'a RelationState> {
    state
        .relations
        .get(relation_id)
        .ok_or_else(|| CertExchangeError::NotFound(format!("relation {}", relation_id)))
}

fn relation_mut<'a>(state: &'a mut NetworkState, relation_id: &str) -> Result<&'a mut RelationState> {
    state
        .relations
        .get_mut(relation_id)
        .ok_or_else(|| CertExchangeError::NotFound(format!("relation {}", relation_id)))
}

/// A unit's view of a [`RelationNetwork`].
#[derive(Debug, Clone)]
pub struct UnitHandle {
    network: RelationNetwork,
    unit: String,
}

impl UnitHandle {
    pub fn unit(&self) -> &str {
        &self.unit
    }

    fn app(&self) -> &str {
        app_of_unit(&self.unit)
    }

    fn check_transport(&self, state: &NetworkState, stage: &str) -> Result<()> {
        if state.fail_transport {
            return Err(CertExchangeError::transport(stage, "relation store unreachable"));
        }
        Ok(())
    }
}

impl RelationStore for UnitHandle {
    fn relation_ids(&self, relation_name: &str) -> Result<Vec<String>> {
        let state = self.network.read()?;
        self.check_transport(&state, "list relation ids")?;
        Ok(state
            .relations
            .iter()
            .filter(|(_, r)| r.endpoint == relation_name && r.apps.contains(self.app()))
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn units(&self, relation_id: &str) -> Result<Vec<String>> {
        let state = self.network.read()?;
        self.check_transport(&state, "list relation units")?;
        Ok(relation_ref(&state, relation_id)?
            .units
            .iter()
            .filter(|unit| app_of_unit(unit) != self.app())
            .cloned()
            .collect())
    }

    fn read_unit_data(&self, relation_id: &str, unit: &str) -> Result<DataBag> {
        let state = self.network.read()?;
        self.check_transport(&state, "read unit data")?;
        Ok(relation_ref(&state, relation_id)?
            .unit_data
            .get(unit)
            .cloned()
            .unwrap_or_default())
    }

    fn read_app_data(&self, relation_id: &str, app: &str) -> Result<DataBag> {
        let state = self.network.read()?;
        self.check_transport(&state, "read application data")?;
        Ok(relation_ref(&state, relation_id)?
            .app_data
            .get(app)
            .cloned()
            .unwrap_or_default())
    }

    fn write_unit_data(&self, relation_id: &str, data: DataBag) -> Result<()> {
        let mut state = self.network.write()?;
        self.check_transport(&state, "write unit data")?;
        relation_mut(&mut state, relation_id)?
            .unit_data
            .entry(self.unit.clone())
            .or_default()
            .extend(data);
        state.writes += 1;
        Ok(())
    }

    fn write_app_data(&self, relation_id: &str, data: DataBag) -> Result<()> {
        let mut state = self.network.write()?;
        self.check_transport(&state, "write application data")?;
        if !state.leaders.contains(&self.unit) {
            return Err(CertExchangeError::transport(
                "write application data",
                format!("{} is not allowed to write application data", self.unit),
            ));
        }
        let app = self.app().to_string();
        relation_mut(&mut state, relation_id)?
            .app_data
            .entry(app)
            .or_default()
            .extend(data);
        state.writes += 1;
        Ok(())
    }
}

impl Leadership for UnitHandle {
    fn is_leader(&self) -> Result<bool> {
        let state = self.network.read()?;
        self.check_transport(&state, "leader check")?;
        Ok(state.leaders.contains(&self.unit))
    }
}

/// Label-keyed secret store.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, DataBag>>,
    writes: RwLock<usize>,
    fail_reads: RwLock<bool>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.read().map(|w| *w).unwrap_or_default()
    }

    /// Make `get_secret` fail, as when the secret backend is unavailable.
    pub fn fail_reads(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_reads.write() {
            *flag = fail;
        }
    }
}

impl SecretStore for MemorySecretStore {
    fn get_secret(&self, label: &str) -> Result<Option<DataBag>> {
        if self.fail_reads.read().map(|f| *f).unwrap_or(false) {
            return Err(CertExchangeError::transport("get secret", "secret backend unavailable"));
        }
        let secrets = self
            .secrets
            .read()
            .map_err(|e| CertExchangeError::transport("get secret", format!("lock poisoned: {}", e)))?;
        Ok(secrets.get(label).cloned())
    }

    fn put_secret(&self, label: &str, content: DataBag) -> Result<()> {
        let mut secrets = self
            .secrets
            .write()
            .map_err(|e| CertExchangeError::transport("put secret", format!("lock poisoned: {}", e)))?;
        secrets.insert(label.to_string(), content);
        if let Ok(mut writes) = self.writes.write() {
            *writes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> RelationNetwork {
        let network = RelationNetwork::new();
        network
            .add_relation("certificates:0", "certificates", ["requirer", "provider"])
            .unwrap();
        network.join("certificates:0", "requirer/0").unwrap();
        network.join("certificates:0", "provider/0").unwrap();
        network
    }

    #[test]
    fn test_units_lists_remote_side_only() {
        let network = network();
        let requirer = network.handle("requirer/0");
        assert_eq!(requirer.units("certificates:0").unwrap(), vec!["provider/0"]);
        assert_eq!(
            requirer.relation_ids("certificates").unwrap(),
            vec!["certificates:0"]
        );
        assert!(requirer.relation_ids("metrics").unwrap().is_empty());
    }

    #[test]
    fn test_unit_write_lands_in_own_bag() {
        let network = network();
        let requirer = network.handle("requirer/0");
        requirer
            .write_unit_data(
                "certificates:0",
                DataBag::from([("k".to_string(), "v".to_string())]),
            )
            .unwrap();

        let provider = network.handle("provider/0");
        let bag = provider.read_unit_data("certificates:0", "requirer/0").unwrap();
        assert_eq!(bag.get("k").map(String::as_str), Some("v"));
        assert_eq!(network.write_count(), 1);
    }

    #[test]
    fn test_app_write_requires_leadership() {
        let network = network();
        let provider = network.handle("provider/0");
        let data = DataBag::from([("k".to_string(), "v".to_string())]);

        assert!(provider.write_app_data("certificates:0", data.clone()).is_err());
        network.set_leader("provider/0", true).unwrap();
        assert!(provider.is_leader().unwrap());
        provider.write_app_data("certificates:0", data).unwrap();
        assert_eq!(
            network.app_data("certificates:0", "provider").unwrap().get("k"),
            Some(&"v".to_string())
        );
    }

    #[test]
    fn test_join_rejects_foreign_app() {
        let network = network();
        assert!(network.join("certificates:0", "stranger/0").is_err());
    }

    #[test]
    fn test_transport_failure() {
        let network = network();
        network.fail_transport(true).unwrap();
        let err = network.handle("requirer/0").units("certificates:0").unwrap_err();
        assert!(matches!(err, CertExchangeError::Transport { .. }));
    }
}
