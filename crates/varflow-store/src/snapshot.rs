use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::debug;

use varflow_core::error::{Result, VarflowError};
use varflow_core::types::{VarValue, VariableMap};

// `value` holds JSON text for `json` rows and base64 pickle bytes for
// `pickle` rows. `preview` is JSON text or NULL.
const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS variables (
        name TEXT PRIMARY KEY,
        encoding TEXT NOT NULL,
        value TEXT NOT NULL,
        preview TEXT,
        producer TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );";

/// Full contents of the variable store at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub values: VariableMap,
    pub provenance: BTreeMap<String, String>,
}

/// Durable snapshot of the variable store backed by SQLite.
///
/// Each write replaces the whole table inside one transaction, so a reader
/// never sees half of a batch.
pub struct SqliteSnapshot {
    conn: Mutex<Connection>,
}

impl SqliteSnapshot {
    /// Open or create a snapshot database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    VarflowError::Persistence(format!("Failed to create snapshot directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Variable snapshot opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Replace the stored snapshot with `snapshot`.
    pub fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| VarflowError::Persistence(e.to_string()))?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM variables", []).map_err(db_err)?;
        let now = Utc::now().to_rfc3339();
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO variables (name, encoding, value, preview, producer, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(db_err)?;
            for (name, value) in &snapshot.values {
                let producer = snapshot.provenance.get(name).ok_or_else(|| {
                    VarflowError::Persistence(format!("Variable '{}' has no provenance", name))
                })?;
                let (payload, preview) = match value {
                    VarValue::Json { value } => (serde_json::to_string(value)?, None),
                    VarValue::Pickle { data, preview } => (
                        data.clone(),
                        preview.as_ref().map(serde_json::to_string).transpose()?,
                    ),
                };
                stmt.execute(params![
                    name,
                    value.encoding(),
                    payload,
                    preview,
                    producer,
                    now
                ])
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        debug!(count = snapshot.values.len(), "Variable snapshot written");
        Ok(())
    }

    /// Read the stored snapshot.
    pub fn read(&self) -> Result<Snapshot> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| VarflowError::Persistence(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT name, encoding, value, preview, producer FROM variables ORDER BY name",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(db_err)?;

        let mut snapshot = Snapshot::default();
        for row in rows {
            let (name, encoding, payload, preview, producer) = row.map_err(db_err)?;
            let value = decode_value(&encoding, payload, preview).map_err(|e| {
                VarflowError::Persistence(format!("Corrupt value for '{}': {}", name, e))
            })?;
            snapshot.values.insert(name.clone(), value);
            snapshot.provenance.insert(name, producer);
        }
        Ok(snapshot)
    }
}

fn decode_value(
    encoding: &str,
    payload: String,
    preview: Option<String>,
) -> std::result::Result<VarValue, String> {
    match encoding {
        "json" => serde_json::from_str(&payload)
            .map(VarValue::json)
            .map_err(|e| e.to_string()),
        "pickle" => {
            let preview = preview
                .map(|p| serde_json::from_str(&p))
                .transpose()
                .map_err(|e| e.to_string())?;
            Ok(VarValue::pickle(payload, preview))
        }
        other => Err(format!("unknown encoding '{}'", other)),
    }
}

fn db_err(e: rusqlite::Error) -> VarflowError {
    VarflowError::Persistence(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.values.insert("x".into(), VarValue::json(json!(1)));
        snapshot
            .values
            .insert("rows".into(), VarValue::json(json!([{"id": 1}, {"id": 2}])));
        snapshot.values.insert(
            "day".into(),
            VarValue::pickle("gASVDgAAAAAAAACMCGRhdGV0aW1llC4=", None),
        );
        snapshot.values.insert(
            "pair".into(),
            VarValue::pickle("gARLAUsChpQu", Some(json!([1, 2]))),
        );
        for name in ["x", "day", "pair"] {
            snapshot.provenance.insert(name.into(), "/s/a.py".into());
        }
        snapshot.provenance.insert("rows".into(), "/s/b.py".into());
        snapshot
    }

    #[test]
    fn test_write_then_read() {
        let db = SqliteSnapshot::in_memory().unwrap();
        db.write(&sample()).unwrap();
        assert_eq!(db.read().unwrap(), sample());
    }

    #[test]
    fn test_write_replaces_previous_contents() {
        let db = SqliteSnapshot::in_memory().unwrap();
        db.write(&sample()).unwrap();
        db.write(&Snapshot::default()).unwrap();
        assert!(db.read().unwrap().values.is_empty());
    }

    #[test]
    fn test_write_rejects_value_without_provenance() {
        let db = SqliteSnapshot::in_memory().unwrap();
        let mut snapshot = sample();
        snapshot.provenance.remove("x");
        let err = db.write(&snapshot).unwrap_err();
        assert!(matches!(err, VarflowError::Persistence(_)));
        // The failed batch left nothing behind.
        assert!(db.read().unwrap().values.is_empty());
    }

    #[test]
    fn test_unknown_encoding_is_corrupt() {
        let db = SqliteSnapshot::in_memory().unwrap();
        db.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO variables (name, encoding, value, preview, producer, updated_at)
                 VALUES ('x', 'marshal', 'AAAA', NULL, 'a.py', '')",
                [],
            )
            .unwrap();
        let err = db.read().unwrap_err();
        assert!(err.to_string().contains("unknown encoding"));
    }

    #[test]
    fn test_reopen_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("variables.db");
        {
            let db = SqliteSnapshot::open(&path).unwrap();
            db.write(&sample()).unwrap();
        }
        let db = SqliteSnapshot::open(&path).unwrap();
        assert_eq!(db.read().unwrap(), sample());
    }
}
