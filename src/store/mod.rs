//! JSON-file persistence for rules, chains and preferences
//!
//! The [`Store`] keeps the whole [`AppData`] document in memory behind a
//! read/write lock and rewrites `data.json` after every mutation. Reads hand
//! out clones so callers never hold the lock.
//!
//! The store checks identity only (duplicate ids, missing ids, chains still
//! referenced by a rule). Structural validation of rules and chains belongs
//! to the engine and the controller.

mod file;

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{AppConfig, AppData, Chain, Rule, RuleStatus};

/// Name of the data document inside the data directory
pub const DATA_FILE: &str = "data.json";

/// Persistence collaborator backed by `<dir>/data.json`
#[derive(Debug)]
pub struct Store {
    dir: PathBuf,
    data_file: PathBuf,
    data: RwLock<AppData>,
}

impl Store {
    /// Open (creating if needed) the store in `dir`
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the directory cannot be created or an
    /// existing data file cannot be parsed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let data_file = dir.join(DATA_FILE);
        let data = file::load(&data_file)?.unwrap_or_default();

        info!(
            "Store opened at {:?}: {} rules, {} chains",
            data_file,
            data.rules.len(),
            data.chains.len()
        );

        Ok(Self {
            dir,
            data_file,
            data: RwLock::new(data),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    /// Apply `op` to a copy of the document and swap the copy in once it is
    /// on disk. A failed write leaves memory and disk unchanged.
    fn commit<T>(
        &self,
        op: impl FnOnce(&mut AppData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut data = self.data.write();
        let mut next = data.clone();
        let out = op(&mut next)?;
        file::save(&self.data_file, &next)?;
        debug!("Store saved to {:?}", self.data_file);
        *data = next;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> AppConfig {
        self.data.read().config.clone()
    }

    pub fn update_config(&self, config: AppConfig) -> Result<(), StoreError> {
        self.commit(|data| {
            data.config = config;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    #[must_use]
    pub fn rules(&self) -> Vec<Rule> {
        self.data.read().rules.clone()
    }

    pub fn rule(&self, id: &str) -> Result<Rule, StoreError> {
        self.data
            .read()
            .rules
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::RuleNotFound { id: id.into() })
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.data.read().rules.len()
    }

    /// Add a rule. An empty id gets a fresh one. Returns the stored record.
    pub fn create_rule(&self, mut rule: Rule) -> Result<Rule, StoreError> {
        self.commit(|data| {
            if rule.id.is_empty() {
                rule.id = Uuid::new_v4().to_string();
            } else if data.rules.iter().any(|r| r.id == rule.id) {
                return Err(StoreError::RuleExists { id: rule.id.clone() });
            }

            let now = Utc::now();
            rule.created_at = now;
            rule.updated_at = now;
            data.rules.push(rule.clone());
            Ok(rule)
        })
    }

    /// Replace a rule in place, preserving its creation time
    pub fn update_rule(&self, mut rule: Rule) -> Result<Rule, StoreError> {
        self.commit(|data| {
            let slot = find_rule(data, &rule.id)?;
            rule.created_at = slot.created_at;
            rule.updated_at = Utc::now();
            *slot = rule.clone();
            Ok(rule)
        })
    }

    pub fn delete_rule(&self, id: &str) -> Result<(), StoreError> {
        self.commit(|data| {
            let pos = data
                .rules
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| StoreError::RuleNotFound { id: id.into() })?;
            data.rules.remove(pos);
            Ok(())
        })
    }

    pub fn update_rule_status(
        &self,
        id: &str,
        status: RuleStatus,
        error_msg: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.commit(|data| {
            let rule = find_rule(data, id)?;
            rule.status = status;
            rule.error_msg = error_msg.into();
            rule.touch();
            Ok(())
        })
    }

    /// Update status and the persisted auto-start flag together
    pub fn update_rule_state(
        &self,
        id: &str,
        enabled: bool,
        status: RuleStatus,
        error_msg: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.commit(|data| {
            let rule = find_rule(data, id)?;
            rule.enabled = enabled;
            rule.status = status;
            rule.error_msg = error_msg.into();
            rule.touch();
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Chains
    // ------------------------------------------------------------------

    #[must_use]
    pub fn chains(&self) -> Vec<Chain> {
        self.data.read().chains.clone()
    }

    pub fn chain(&self, id: &str) -> Result<Chain, StoreError> {
        self.data
            .read()
            .chains
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| StoreError::ChainNotFound { id: id.into() })
    }

    pub fn create_chain(&self, mut chain: Chain) -> Result<Chain, StoreError> {
        self.commit(|data| {
            if chain.id.is_empty() {
                chain.id = Uuid::new_v4().to_string();
            } else if data.chains.iter().any(|c| c.id == chain.id) {
                return Err(StoreError::ChainExists {
                    id: chain.id.clone(),
                });
            }

            let now = Utc::now();
            chain.created_at = now;
            chain.updated_at = now;
            data.chains.push(chain.clone());
            Ok(chain)
        })
    }

    pub fn update_chain(&self, mut chain: Chain) -> Result<Chain, StoreError> {
        self.commit(|data| {
            let slot = data
                .chains
                .iter_mut()
                .find(|c| c.id == chain.id)
                .ok_or_else(|| StoreError::ChainNotFound {
                    id: chain.id.clone(),
                })?;
            chain.created_at = slot.created_at;
            chain.updated_at = Utc::now();
            *slot = chain.clone();
            Ok(chain)
        })
    }

    /// Remove a chain; refused while any rule references it
    pub fn delete_chain(&self, id: &str) -> Result<(), StoreError> {
        self.commit(|data| {
            if data.rules.iter().any(|r| r.chain_ref() == Some(id)) {
                return Err(StoreError::ChainInUse { id: id.into() });
            }

            let pos = data
                .chains
                .iter()
                .position(|c| c.id == id)
                .ok_or_else(|| StoreError::ChainNotFound { id: id.into() })?;
            data.chains.remove(pos);
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Bulk
    // ------------------------------------------------------------------

    /// Deep copy of the whole document
    #[must_use]
    pub fn all_data(&self) -> AppData {
        self.data.read().clone()
    }

    /// Pretty JSON of the whole document
    pub fn export_data(&self) -> Result<String, StoreError> {
        let data = self.data.read();
        Ok(serde_json::to_string_pretty(&*data)?)
    }

    /// Import a document
    ///
    /// `merge` upserts rules and chains by id and keeps the current
    /// preferences. Otherwise the whole document is replaced. Duplicate ids
    /// inside `incoming` collapse onto the first position, last value wins.
    pub fn import_data(&self, incoming: AppData, merge: bool) -> Result<(), StoreError> {
        self.commit(|data| {
            if merge {
                upsert_all(&mut data.rules, incoming.rules, |r| &r.id);
                upsert_all(&mut data.chains, incoming.chains, |c| &c.id);
            } else {
                let mut replacement = AppData::with_config(incoming.config);
                upsert_all(&mut replacement.rules, incoming.rules, |r| &r.id);
                upsert_all(&mut replacement.chains, incoming.chains, |c| &c.id);
                *data = replacement;
            }

            info!(
                "Imported data (merge={}): {} rules, {} chains",
                merge,
                data.rules.len(),
                data.chains.len()
            );
            Ok(())
        })
    }
}

fn find_rule<'a>(data: &'a mut AppData, id: &str) -> Result<&'a mut Rule, StoreError> {
    data.rules
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or_else(|| StoreError::RuleNotFound { id: id.into() })
}

fn upsert_all<T, F>(existing: &mut Vec<T>, incoming: Vec<T>, key: F)
where
    F: Fn(&T) -> &String,
{
    for item in incoming {
        match existing.iter().position(|e| key(e) == key(&item)) {
            Some(pos) => existing[pos] = item,
            None => existing.push(item),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Hop, Protocol, RuleType};

    fn rule(name: &str) -> Rule {
        let mut rule = Rule::new(name, RuleType::Forward);
        rule.local_port = 9000;
        rule.target_host = "127.0.0.1".into();
        rule.target_port = 80;
        rule
    }

    fn chain(name: &str) -> Chain {
        let mut chain = Chain::new(name);
        chain.add_hop(Hop::new("127.0.0.1:1080", Protocol::Socks5));
        chain
    }

    #[test]
    fn test_rule_crud_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let created = store.create_rule(rule("a")).unwrap();
        assert!(matches!(
            store.create_rule(created.clone()),
            Err(StoreError::RuleExists { .. })
        ));

        let mut updated = created.clone();
        updated.name = "renamed".into();
        let updated = store.update_rule(updated).unwrap();
        assert_eq!(updated.created_at, created.created_at);

        store
            .update_rule_status(&created.id, RuleStatus::Error, "boom")
            .unwrap();

        let reopened = Store::open(dir.path()).unwrap();
        let loaded = reopened.rule(&created.id).unwrap();
        assert_eq!(loaded.name, "renamed");
        assert_eq!(loaded.status, RuleStatus::Error);
        assert_eq!(loaded.error_msg, "boom");

        reopened.delete_rule(&created.id).unwrap();
        assert!(matches!(
            reopened.delete_rule(&created.id),
            Err(StoreError::RuleNotFound { .. })
        ));
    }

    #[test]
    fn test_create_rule_assigns_missing_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut r = rule("x");
        r.id.clear();
        let created = store.create_rule(r).unwrap();
        assert!(!created.id.is_empty());
    }

    #[test]
    fn test_chain_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let c = store.create_chain(chain("egress")).unwrap();
        let mut r = rule("via-chain");
        r.chain_id = Some(c.id.clone());
        let r = store.create_rule(r).unwrap();

        assert!(matches!(
            store.delete_chain(&c.id),
            Err(StoreError::ChainInUse { .. })
        ));

        store.delete_rule(&r.id).unwrap();
        store.delete_chain(&c.id).unwrap();
        assert!(store.chains().is_empty());
    }

    #[test]
    fn test_export_import_replace_roundtrip() {
        let src_dir = tempfile::tempdir().unwrap();
        let src = Store::open(src_dir.path()).unwrap();
        src.create_rule(rule("a")).unwrap();
        src.create_rule(rule("b")).unwrap();
        src.create_chain(chain("c")).unwrap();

        let exported: AppData = serde_json::from_str(&src.export_data().unwrap()).unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let dst = Store::open(dst_dir.path()).unwrap();
        dst.import_data(exported, false).unwrap();

        assert_eq!(dst.all_data(), src.all_data());
    }

    #[test]
    fn test_import_merge_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let existing = store.create_rule(rule("old")).unwrap();

        let mut overwrite = existing.clone();
        overwrite.name = "new-name".into();
        let fresh = rule("fresh");

        let incoming = AppData {
            config: AppConfig {
                log_level: "debug".into(),
                ..AppConfig::default()
            },
            rules: vec![overwrite, fresh.clone()],
            chains: vec![],
        };
        store.import_data(incoming, true).unwrap();

        let rules = store.rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, existing.id);
        assert_eq!(rules[0].name, "new-name");
        assert_eq!(rules[1].id, fresh.id);
        // merge keeps current preferences
        assert_eq!(store.config().log_level, "info");
    }

    #[test]
    fn test_import_replace_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let a = rule("a");
        let mut a2 = a.clone();
        a2.name = "a-second".into();

        let incoming = AppData {
            rules: vec![a, a2],
            ..AppData::default()
        };
        store.import_data(incoming, false).unwrap();

        let rules = store.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "a-second");
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("data");
        let store = Store::open(&dir).unwrap();
        let kept = store.create_rule(rule("kept")).unwrap();

        std::fs::remove_dir_all(&dir).unwrap();

        assert!(matches!(
            store.create_rule(rule("lost")),
            Err(StoreError::Io(_))
        ));
        assert!(store
            .update_rule_status(&kept.id, RuleStatus::Error, "boom")
            .is_err());
        assert!(store.import_data(AppData::default(), false).is_err());

        let rules = store.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, kept.id);
        assert_eq!(rules[0].status, RuleStatus::Stopped);
    }

    #[test]
    fn test_corrupt_data_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DATA_FILE), "{ not json").unwrap();
        assert!(matches!(
            Store::open(dir.path()),
            Err(StoreError::Serialization(_))
        ));
    }
}
