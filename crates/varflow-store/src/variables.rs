use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use varflow_core::error::Result;
use varflow_core::types::{VarValue, VariableMap};

use crate::snapshot::{Snapshot, SqliteSnapshot};

/// Live variable values plus which script last wrote each one.
///
/// Values and provenance are always updated together; there is never a
/// value without a producer. A later write for the same name replaces both.
#[derive(Default)]
pub struct VariableStore {
    values: VariableMap,
    provenance: BTreeMap<String, String>,
    snapshot: Option<Arc<SqliteSnapshot>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that persists to and loads from `snapshot`.
    pub fn with_snapshot(snapshot: Arc<SqliteSnapshot>) -> Self {
        Self {
            snapshot: Some(snapshot),
            ..Self::default()
        }
    }

    pub fn get(&self, name: &str) -> Option<&VarValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// The script that last produced `name`.
    pub fn provenance(&self, name: &str) -> Option<&str> {
        self.provenance.get(name).map(String::as_str)
    }

    pub fn values(&self) -> &VariableMap {
        &self.values
    }

    pub fn provenance_map(&self) -> &BTreeMap<String, String> {
        &self.provenance
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merge a batch produced by `producer`.
    pub fn set_many(&mut self, producer: &str, batch: VariableMap) {
        for (name, value) in batch {
            if let Some(previous) = self.provenance.get(&name) {
                if previous != producer {
                    debug!(variable = %name, previous = %previous, producer = %producer, "Variable superseded");
                }
            }
            self.provenance.insert(name.clone(), producer.to_string());
            self.values.insert(name, value);
        }
    }

    /// Names from `required` that have no value, in the given order.
    pub fn missing<'a, I>(&self, required: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        required
            .into_iter()
            .filter(|name| !self.values.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    /// The values for whichever of `names` are present.
    pub fn subset<'a, I>(&self, names: I) -> VariableMap
    where
        I: IntoIterator<Item = &'a String>,
    {
        names
            .into_iter()
            .filter_map(|n| self.values.get(n).map(|v| (n.clone(), v.clone())))
            .collect()
    }

    /// Clear all values and provenance.
    pub fn reset(&mut self) {
        self.values.clear();
        self.provenance.clear();
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            values: self.values.clone(),
            provenance: self.provenance.clone(),
        }
    }

    /// Write the full contents to the attached snapshot, if any.
    pub fn persist(&self) -> Result<()> {
        match self.snapshot {
            Some(ref db) => db.write(&self.snapshot()),
            None => Ok(()),
        }
    }

    /// Replace the contents with the attached snapshot, if any.
    ///
    /// On failure the in-memory contents are left untouched.
    pub fn load(&mut self) -> Result<()> {
        let Some(ref db) = self.snapshot else {
            return Ok(());
        };
        let Snapshot { values, provenance } = db.read()?;
        let orphaned = values
            .keys()
            .filter(|k| !provenance.contains_key(*k))
            .count();
        if orphaned > 0 {
            warn!(count = orphaned, "Snapshot values without provenance dropped");
        }
        self.values = values
            .into_iter()
            .filter(|(k, _)| provenance.contains_key(k))
            .collect();
        self.provenance = provenance;
        debug!(count = self.values.len(), "Variable store loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(pairs: &[(&str, serde_json::Value)]) -> VariableMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), VarValue::json(v.clone())))
            .collect()
    }

    #[test]
    fn test_set_many_records_provenance() {
        let mut store = VariableStore::new();
        store.set_many("a.py", batch(&[("x", json!(1)), ("y", json!("two"))]));

        assert_eq!(store.get("x"), Some(&VarValue::json(json!(1))));
        assert_eq!(store.provenance("x"), Some("a.py"));
        assert_eq!(store.provenance("y"), Some("a.py"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_last_writer_wins() {
        let mut store = VariableStore::new();
        store.set_many("a.py", batch(&[("x", json!(1))]));
        store.set_many("b.py", batch(&[("x", json!(2))]));

        assert_eq!(store.get("x"), Some(&VarValue::json(json!(2))));
        assert_eq!(store.provenance("x"), Some("b.py"));
    }

    #[test]
    fn test_missing_keeps_order() {
        let mut store = VariableStore::new();
        store.set_many("a.py", batch(&[("b", json!(null))]));
        let required = vec!["c".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(store.missing(&required), vec!["c", "a"]);
    }

    #[test]
    fn test_subset_only_present() {
        let mut store = VariableStore::new();
        store.set_many("a.py", batch(&[("x", json!(1)), ("y", json!(2))]));
        let wanted = vec!["x".to_string(), "z".to_string()];
        assert_eq!(store.subset(&wanted), batch(&[("x", json!(1))]));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut store = VariableStore::new();
        store.set_many("a.py", batch(&[("x", json!(1))]));
        store.reset();
        assert!(store.is_empty());
        assert!(store.provenance_map().is_empty());
    }

    #[test]
    fn test_persist_then_load_into_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(SqliteSnapshot::open(&dir.path().join("vars.db")).unwrap());

        let mut store = VariableStore::with_snapshot(db.clone());
        store.set_many("a.py", batch(&[("x", json!(1))]));
        store.persist().unwrap();

        let mut fresh = VariableStore::with_snapshot(db);
        fresh.load().unwrap();
        assert_eq!(fresh.values(), store.values());
        assert_eq!(fresh.provenance_map(), store.provenance_map());
    }

    #[test]
    fn test_persist_without_snapshot_is_noop() {
        let mut store = VariableStore::new();
        store.set_many("a.py", batch(&[("x", json!(1))]));
        assert!(store.persist().is_ok());
        assert!(store.load().is_ok());
        assert_eq!(store.len(), 1);
    }
}
