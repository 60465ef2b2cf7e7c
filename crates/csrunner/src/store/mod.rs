use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::domain::{AppSpec, Configuration};
use crate::error::{Error, Result};

/// CRUD over configuration documents at `configurations/<id>.json`.
/// Writes are atomic: sibling tmp file, fsync, rename over the target.
pub struct ConfigStore {
    dir: PathBuf,
    // Single writer per store; readers go straight to the filesystem.
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    fn doc_path(&self, config_id: &str) -> PathBuf {
        self.dir.join(format!("{config_id}.json"))
    }

    pub fn create(
        &self,
        name: &str,
        description: Option<String>,
        applications: Vec<AppSpec>,
    ) -> Result<Configuration> {
        if name.trim().is_empty() {
            return Err(Error::config_invalid("name cannot be empty"));
        }
        let now = OffsetDateTime::now_utc();
        let config = Configuration {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description,
            applications,
            created_at: now,
            updated_at: now,
        };
        config.validate()?;
        self.save(&config)?;
        info!(config_id = %config.id, name, "created configuration");
        Ok(config)
    }

    pub fn get(&self, config_id: &str) -> Result<Configuration> {
        let path = self.doc_path(config_id);
        if !path.exists() {
            return Err(Error::NotFound(format!("configuration '{config_id}'")));
        }
        read_document(&path)
    }

    /// All stored configurations, most recently updated first. Documents
    /// that fail to parse are skipped with a warning rather than failing
    /// the listing.
    pub fn list(&self) -> Vec<Configuration> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut configs: Vec<Configuration> = entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| match read_document(&e.path()) {
                Ok(config) => Some(config),
                Err(err) => {
                    warn!(path = %e.path().display(), error = %err, "skipping unreadable configuration");
                    None
                }
            })
            .collect();
        configs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        configs
    }

    /// Merge a partial document over the stored one. `id` and `created_at`
    /// are immutable; the merged result must still validate.
    pub fn update(&self, config_id: &str, updates: &Value) -> Result<Configuration> {
        let current = self.get(config_id)?;

        let Some(updates) = updates.as_object() else {
            return Err(Error::config_invalid("updates must be an object"));
        };
        let mut doc = serde_json::to_value(&current).map_err(Error::internal)?;
        let obj = doc.as_object_mut().expect("configuration serializes to an object");
        for (key, value) in updates {
            if key == "id" || key == "created_at" || key == "updated_at" {
                continue;
            }
            obj.insert(key.clone(), value.clone());
        }

        let mut updated: Configuration = serde_json::from_value(doc)
            .map_err(|e| Error::config_invalid(format!("invalid update: {e}")))?;
        updated.updated_at = OffsetDateTime::now_utc();
        updated.validate()?;
        self.save(&updated)?;
        info!(config_id, "updated configuration");
        Ok(updated)
    }

    pub fn delete(&self, config_id: &str) -> Result<()> {
        let path = self.doc_path(config_id);
        if !path.exists() {
            return Err(Error::NotFound(format!("configuration '{config_id}'")));
        }
        let _guard = self.write_lock.lock();
        fs::remove_file(&path).map_err(Error::internal)?;
        info!(config_id, "deleted configuration");
        Ok(())
    }

    fn save(&self, config: &Configuration) -> Result<()> {
        let _guard = self.write_lock.lock();
        let target = self.doc_path(&config.id);
        let tmp = self.dir.join(format!("{}.json.tmp", config.id));

        let raw = serde_json::to_vec_pretty(config).map_err(Error::internal)?;
        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            use std::io::Write;
            file.write_all(&raw)?;
            file.sync_all()?;
            fs::rename(&tmp, &target)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(Error::internal(format!(
                "failed to save configuration {}: {e}",
                config.id
            )));
        }
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<Configuration> {
    let raw = fs::read_to_string(path).map_err(Error::internal)?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::internal(format!("corrupt document {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_store(label: &str) -> (ConfigStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("csrunner-test-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        (ConfigStore::new(dir.clone()), dir)
    }

    fn app(id: &str, deps: &[&str]) -> AppSpec {
        AppSpec {
            id: id.to_string(),
            name: id.to_string(),
            app_type: "python".to_string(),
            working_dir: PathBuf::from("/tmp"),
            command: "true".to_string(),
            env: HashMap::new(),
            build_command: None,
            health_check: None,
            auto_restart: false,
            startup_timeout: 30,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            port: None,
            port_env_var: None,
        }
    }

    #[test]
    fn create_get_roundtrip() {
        let (store, dir) = temp_store("store-roundtrip");
        let created = store
            .create("webapp", Some("desc".into()), vec![app("a", &[])])
            .expect("create");
        let loaded = store.get(&created.id).expect("get");
        assert_eq!(loaded.name, "webapp");
        assert_eq!(loaded.description.as_deref(), Some("desc"));
        assert_eq!(loaded.applications.len(), 1);
        assert!(dir.join(format!("{}.json", created.id)).exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn create_rejects_cycle_and_persists_nothing() {
        let (store, dir) = temp_store("store-cycle");
        let err = store
            .create(
                "cyclic",
                None,
                vec![app("a", &["b"]), app("b", &["c"]), app("c", &["a"])],
            )
            .expect_err("must fail");
        assert_eq!(err.code(), "config_invalid");
        let remaining: Vec<_> = fs::read_dir(&dir).unwrap().flatten().collect();
        assert!(remaining.is_empty(), "nothing may be persisted");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn get_unknown_is_not_found() {
        let (store, dir) = temp_store("store-missing");
        let err = store.get("nope").expect_err("must fail");
        assert_eq!(err.code(), "not_found");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn list_sorts_by_updated_at_desc() {
        let (store, dir) = temp_store("store-list");
        let first = store.create("first", None, vec![app("a", &[])]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _second = store.create("second", None, vec![app("a", &[])]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .update(&first.id, &serde_json::json!({"description": "bumped"}))
            .unwrap();

        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "first");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn update_merges_and_protects_identity() {
        let (store, dir) = temp_store("store-update");
        let created = store.create("webapp", None, vec![app("a", &[])]).unwrap();
        let updated = store
            .update(
                &created.id,
                &serde_json::json!({"id": "hijack", "name": "renamed"}),
            )
            .expect("update");
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn update_validates_merged_document() {
        let (store, dir) = temp_store("store-update-invalid");
        let created = store.create("webapp", None, vec![app("a", &[])]).unwrap();
        let err = store
            .update(
                &created.id,
                &serde_json::json!({"applications": [
                    {"id": "x", "name": "x", "app_type": "python",
                     "working_dir": "/tmp", "command": "true", "depends_on": ["ghost"]}
                ]}),
            )
            .expect_err("must fail");
        assert_eq!(err.code(), "config_invalid");
        // The stored document is untouched.
        let loaded = store.get(&created.id).unwrap();
        assert_eq!(loaded.applications[0].id, "a");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn delete_removes_document() {
        let (store, dir) = temp_store("store-delete");
        let created = store.create("webapp", None, vec![app("a", &[])]).unwrap();
        store.delete(&created.id).expect("delete");
        assert!(!dir.join(format!("{}.json", created.id)).exists());
        assert_eq!(store.delete(&created.id).expect_err("gone").code(), "not_found");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn saved_document_is_never_partial() {
        let (store, dir) = temp_store("store-atomic");
        let created = store.create("webapp", None, vec![app("a", &[])]).unwrap();
        for i in 0..20 {
            store
                .update(&created.id, &serde_json::json!({"description": format!("rev {i}")}))
                .unwrap();
            // Every read between writes yields a complete, valid document.
            let loaded = store.get(&created.id).unwrap();
            assert_eq!(loaded.name, "webapp");
        }
        // No tmp residue.
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        fs::remove_dir_all(&dir).ok();
    }
}
