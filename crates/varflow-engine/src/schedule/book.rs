use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use varflow_core::error::{Result, VarflowError};
use varflow_core::types::ScheduleEntry;

/// One record of the schedule file.
#[derive(Debug, Clone)]
enum Slot {
    Valid(ScheduleEntry),
    /// Kept verbatim so saving never loses a record the user can still fix.
    Invalid {
        raw: serde_json::Value,
        reason: String,
    },
}

/// The ordered list of schedule entries, backed by a JSON array file.
#[derive(Debug, Clone, Default)]
pub struct ScheduleBook {
    path: Option<PathBuf>,
    slots: Vec<Slot>,
}

impl ScheduleBook {
    /// A book that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the book at `path`. A missing file is an empty book.
    ///
    /// Malformed entries are kept and reported through [`Self::invalid`];
    /// a file that is not a JSON array is a persistence error.
    pub fn load(path: &Path) -> Result<Self> {
        let mut book = Self {
            path: Some(path.to_path_buf()),
            slots: Vec::new(),
        };
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(book),
            Err(e) => {
                return Err(VarflowError::Persistence(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        };
        if content.trim().is_empty() {
            return Ok(book);
        }

        let records: Vec<serde_json::Value> = serde_json::from_str(&content)
            .map_err(|e| VarflowError::Persistence(format!("{}: {}", path.display(), e)))?;
        for raw in records {
            book.slots.push(parse_slot(raw));
        }

        for err in book.invalid() {
            warn!(error = %err, "Skipping schedule entry");
        }
        debug!(path = %path.display(), entries = book.slots.len(), "Schedule loaded");
        Ok(book)
    }

    /// Write the book back to its file. In-memory books are a no-op.
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let records = self
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Valid(entry) => serde_json::to_value(entry),
                Slot::Invalid { raw, .. } => Ok(raw.clone()),
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let json = serde_json::to_string_pretty(&records)?;

        let persist = || -> std::io::Result<()> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, path)
        };
        persist().map_err(|e| VarflowError::Persistence(format!("{}: {}", path.display(), e)))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a validated entry.
    pub fn add(&mut self, entry: ScheduleEntry) -> Result<()> {
        entry.validate().map_err(VarflowError::ScheduleConfig)?;
        self.slots.push(Slot::Valid(entry));
        Ok(())
    }

    /// Remove every record for `script`, valid or not. Returns how many.
    pub fn remove(&mut self, script: &str) -> usize {
        let before = self.slots.len();
        self.slots.retain(|slot| match slot {
            Slot::Valid(entry) => entry.script != script,
            Slot::Invalid { raw, .. } => raw.get("script").and_then(|s| s.as_str()) != Some(script),
        });
        before - self.slots.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Valid(entry) => Some(entry),
            Slot::Invalid { .. } => None,
        })
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut ScheduleEntry> {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Valid(entry) => Some(entry),
            Slot::Invalid { .. } => None,
        })
    }

    /// One error per record that could not be used.
    pub fn invalid(&self) -> Vec<VarflowError> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Invalid { reason, .. } => Some(VarflowError::ScheduleConfig(reason.clone())),
                Slot::Valid(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn parse_slot(raw: serde_json::Value) -> Slot {
    match serde_json::from_value::<ScheduleEntry>(raw.clone()) {
        Ok(entry) => match entry.validate() {
            Ok(()) => Slot::Valid(entry),
            Err(reason) => Slot::Invalid { raw, reason },
        },
        Err(e) => Slot::Invalid {
            reason: format!("{}: {}", raw, e),
            raw,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let book = ScheduleBook::load(&dir.path().join("schedule.json")).unwrap();
        assert!(book.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("schedule.json");
        let mut book = ScheduleBook::load(&path).unwrap();
        book.add(ScheduleEntry::every_n_hours("etl.py", 4).with_retry(10))
            .unwrap();
        book.add(ScheduleEntry::daily(
            "report.py",
            NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        ))
        .unwrap();
        book.save().unwrap();

        let reloaded = ScheduleBook::load(&path).unwrap();
        let entries: Vec<&ScheduleEntry> = reloaded.entries().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].script, "etl.py");
        assert_eq!(entries[0].retry_interval_minutes, 10);
        assert_eq!(entries[1].time_of_day, NaiveTime::from_hms_opt(6, 0, 0));
    }

    #[test]
    fn test_invalid_entries_are_kept_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        std::fs::write(
            &path,
            r#"[
  {"script": "ok.py", "frequency": "every_n_hours", "interval_hours": 2},
  {"script": "bad.py", "frequency": "monthly"},
  {"script": "weekly.py", "frequency": "weekly", "time_of_day": "09:00"}
]"#,
        )
        .unwrap();

        let book = ScheduleBook::load(&path).unwrap();
        assert_eq!(book.len(), 3);
        assert_eq!(book.entries().count(), 1);
        let invalid = book.invalid();
        assert_eq!(invalid.len(), 2);
        assert!(invalid
            .iter()
            .all(|e| matches!(e, VarflowError::ScheduleConfig(_))));

        book.save().unwrap();
        let raw: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw[1]["frequency"], "monthly");
    }

    #[test]
    fn test_not_an_array_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            ScheduleBook::load(&path),
            Err(VarflowError::Persistence(_))
        ));
    }

    #[test]
    fn test_add_rejects_invalid_and_remove_matches_all() {
        let mut book = ScheduleBook::in_memory();
        assert!(book.add(ScheduleEntry::every_n_hours("x.py", 0)).is_err());
        book.add(ScheduleEntry::every_n_hours("x.py", 1)).unwrap();
        book.add(ScheduleEntry::every_n_hours("x.py", 2)).unwrap();
        book.add(ScheduleEntry::every_n_hours("y.py", 2)).unwrap();
        assert_eq!(book.remove("x.py"), 2);
        assert_eq!(book.len(), 1);
        assert!(book.save().is_ok());
    }
}
