//! In-process coordination store.
//!
//! The whole keyspace sits behind one mutex, so every procedure invocation is
//! serialized against every other: the same guarantee a scripting-capable
//! key-value server gives.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{CoordinationStore, Keyspace, ProcedureHandle, ProcedureSource, Reply};
use crate::error::{StoreError, fault};

#[derive(Debug)]
struct Expiring {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryKeyspace {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, Expiring>,
    indexes: HashMap<String, BTreeSet<(i64, String)>>,
}

impl Keyspace for MemoryKeyspace {
    fn hash_exists(&self, key: &str) -> bool {
        self.hashes.contains_key(key)
    }

    fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        self.hashes.get(key).and_then(|h| h.get(field).cloned())
    }

    fn hash_get_all(&self, key: &str) -> HashMap<String, String> {
        self.hashes.get(key).cloned().unwrap_or_default()
    }

    fn hash_set(&mut self, key: &str, field: &str, value: String) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    fn list_position(&self, key: &str, member: &str) -> Option<usize> {
        self.lists.get(key)?.iter().position(|m| m == member)
    }

    fn list_remove(&mut self, key: &str, member: &str) -> bool {
        let Some(list) = self.lists.get_mut(key) else {
            return false;
        };
        let Some(pos) = list.iter().position(|m| m == member) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            self.lists.remove(key);
        }
        true
    }

    fn list_push(&mut self, key: &str, member: String) {
        self.lists.entry(key.to_string()).or_default().push_back(member);
    }

    fn list_len(&self, key: &str) -> usize {
        self.lists.get(key).map_or(0, VecDeque::len)
    }

    fn put_expiring(&mut self, key: &str, value: String, expires_at: DateTime<Utc>) {
        self.values
            .insert(key.to_string(), Expiring { value, expires_at });
    }

    fn get_live(&mut self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let expired = self.values.get(key)?.expires_at <= now;
        if expired {
            self.values.remove(key);
            return None;
        }
        self.values.get(key).map(|e| e.value.clone())
    }

    fn index_add(&mut self, key: &str, score: i64, member: String) {
        self.indexes
            .entry(key.to_string())
            .or_default()
            .insert((score, member));
    }

    fn index_desc(&self, key: &str) -> Vec<String> {
        self.indexes
            .get(key)
            .map(|index| index.iter().rev().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    fn index_remove(&mut self, key: &str, member: &str) {
        if let Some(index) = self.indexes.get_mut(key) {
            index.retain(|(_, m)| m != member);
            if index.is_empty() {
                self.indexes.remove(key);
            }
        }
    }
}

/// Coordination store living in the current process.
pub struct MemoryStore {
    keyspace: Mutex<MemoryKeyspace>,
    procedures: DashMap<ProcedureHandle, ProcedureSource>,
    online: AtomicBool,
    accept_registrations: AtomicBool,
    latency: Option<Duration>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(MemoryKeyspace::default()),
            procedures: DashMap::new(),
            online: AtomicBool::new(true),
            accept_registrations: AtomicBool::new(true),
            latency: None,
        }
    }

    /// Delay every invocation, to exercise caller timeouts.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::new()
        }
    }

    /// Forget every registered procedure, as a store restart would.
    pub fn flush_procedures(&self) {
        debug!(count = self.procedures.len(), "flushing registered procedures");
        self.procedures.clear();
    }

    pub fn procedure_count(&self) -> usize {
        self.procedures.len()
    }

    /// Take the store offline (or back online).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Make subsequent registrations fail, as a store rejecting the source would.
    pub fn set_accept_registrations(&self, accept: bool) {
        self.accept_registrations.store(accept, Ordering::SeqCst);
    }

    /// Eagerly drop every value that expired at or before `now`, along with
    /// index entries pointing at values that no longer exist.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut keyspace = self.keyspace.lock().await;
        let MemoryKeyspace {
            values, indexes, ..
        } = &mut *keyspace;

        let before = values.len();
        values.retain(|_, v| v.expires_at > now);
        let purged = before - values.len();
        indexes.retain(|_, index| {
            index.retain(|(_, member)| values.contains_key(member));
            !index.is_empty()
        });
        debug!(purged, indexes = indexes.len(), "purged expired values");
        purged
    }

    /// Snapshot of a list, front first.
    pub async fn list(&self, key: &str) -> Vec<String> {
        let keyspace = self.keyspace.lock().await;
        keyspace
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every list currently holding `member`.
    pub async fn lists_containing(&self, member: &str) -> Vec<String> {
        let keyspace = self.keyspace.lock().await;
        let mut keys: Vec<String> = keyspace
            .lists
            .iter()
            .filter(|(_, l)| l.iter().any(|m| m == member))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub async fn value_count(&self) -> usize {
        self.keyspace.lock().await.values.len()
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".into()))
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn register(&self, source: &ProcedureSource) -> Result<ProcedureHandle, StoreError> {
        self.ensure_online()?;
        if !self.accept_registrations.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected(format!(
                "registration of `{}` refused",
                source.name
            )));
        }
        if source.name.is_empty() {
            return Err(StoreError::Rejected("procedure name is empty".into()));
        }

        let handle = source.handle();
        self.procedures.insert(handle.clone(), *source);
        debug!(procedure = source.name, %handle, "registered procedure");
        Ok(handle)
    }

    async fn invoke(
        &self,
        handle: &ProcedureHandle,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply, StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.ensure_online()?;

        let source = self
            .procedures
            .get(handle)
            .map(|entry| *entry.value())
            .ok_or_else(|| StoreError::ProcedureMissing(handle.clone()))?;

        if !source.keys.admits(keys.len()) || !source.args.admits(args.len()) {
            return Err(StoreError::fault(
                fault::UNKNOWN_COMMAND,
                format!(
                    "`{}` takes {} keys and {} args, got {} and {}",
                    source.name,
                    source.keys,
                    source.args,
                    keys.len(),
                    args.len()
                ),
            ));
        }

        trace!(procedure = source.name, keys = keys.len(), "invoking");
        let mut keyspace = self.keyspace.lock().await;
        (source.body)(&mut *keyspace, keys, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Arity;

    fn push(ks: &mut dyn Keyspace, keys: &[String], args: &[String]) -> Result<Reply, StoreError> {
        ks.list_push(&keys[0], args[0].clone());
        Ok(Reply::Int(ks.list_len(&keys[0]) as i64))
    }

    const PUSH: ProcedureSource = ProcedureSource {
        name: "push",
        version: 1,
        keys: Arity::exactly(1),
        args: Arity::exactly(1),
        body: push,
    };

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn registered_procedure_runs() {
        let store = MemoryStore::new();
        let handle = store.register(&PUSH).await.unwrap();
        assert_eq!(handle, PUSH.handle());

        let reply = store
            .invoke(&handle, &strings(&["queue:a"]), &strings(&["x"]))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Int(1));
        assert_eq!(store.list("queue:a").await, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn flushed_handle_reports_missing() {
        let store = MemoryStore::new();
        let handle = store.register(&PUSH).await.unwrap();
        store.flush_procedures();
        assert_eq!(store.procedure_count(), 0);

        let err = store
            .invoke(&handle, &strings(&["queue:a"]), &strings(&["x"]))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::ProcedureMissing(handle));
    }

    #[tokio::test]
    async fn wrong_arity_is_unknown_command() {
        let store = MemoryStore::new();
        let handle = store.register(&PUSH).await.unwrap();
        let err = store
            .invoke(&handle, &strings(&["queue:a", "queue:b"]), &strings(&["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Fault { code, .. } if code == fault::UNKNOWN_COMMAND));
        assert!(store.list("queue:a").await.is_empty());
    }

    #[tokio::test]
    async fn offline_and_refusing_stores() {
        let store = MemoryStore::new();
        store.set_accept_registrations(false);
        assert!(matches!(store.register(&PUSH).await, Err(StoreError::Rejected(_))));

        store.set_accept_registrations(true);
        let handle = store.register(&PUSH).await.unwrap();
        store.set_online(false);
        assert!(matches!(
            store.invoke(&handle, &strings(&["k"]), &strings(&["v"])).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn expiring_values_are_reclaimed_on_read() {
        let mut ks = MemoryKeyspace::default();
        let now = Utc::now();
        ks.put_expiring("evidence:a", "{}".into(), now + chrono::Duration::seconds(10));
        assert_eq!(ks.get_live("evidence:a", now), Some("{}".to_string()));
        assert_eq!(ks.get_live("evidence:a", now + chrono::Duration::seconds(10)), None);
        assert!(ks.values.is_empty());
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        {
            let mut ks = store.keyspace.lock().await;
            ks.put_expiring("old", "1".into(), now - chrono::Duration::seconds(1));
            ks.put_expiring("new", "2".into(), now + chrono::Duration::seconds(1));
        }
        assert_eq!(store.purge_expired(now).await, 1);
        assert_eq!(store.value_count().await, 1);
    }

    #[tokio::test]
    async fn purge_prunes_evidence_indexes() {
        let store = MemoryStore::new();
        let now = Utc::now();
        {
            let mut ks = store.keyspace.lock().await;
            for n in 0..100 {
                let key = format!("evidence:A:{n}");
                ks.put_expiring(&key, "{}".into(), now + chrono::Duration::days(30));
                ks.index_add("evidence_index:A", n, key);
            }
            ks.put_expiring("evidence:B:0", "{}".into(), now + chrono::Duration::days(60));
            ks.index_add("evidence_index:B", 0, "evidence:B:0".into());
        }

        assert_eq!(store.purge_expired(now + chrono::Duration::days(31)).await, 100);
        {
            let ks = store.keyspace.lock().await;
            assert!(!ks.indexes.contains_key("evidence_index:A"));
            assert_eq!(ks.index_desc("evidence_index:B"), vec!["evidence:B:0"]);
        }

        assert_eq!(store.purge_expired(now + chrono::Duration::days(61)).await, 1);
        assert!(store.keyspace.lock().await.indexes.is_empty());
    }

    #[test]
    fn list_and_index_operations() {
        let mut ks = MemoryKeyspace::default();
        ks.list_push("q", "a".into());
        ks.list_push("q", "b".into());
        assert_eq!(ks.list_position("q", "b"), Some(1));
        assert!(ks.list_remove("q", "a"));
        assert!(!ks.list_remove("q", "a"));
        assert_eq!(ks.list_position("q", "b"), Some(0));

        ks.index_add("i", 2, "second".into());
        ks.index_add("i", 1, "first".into());
        ks.index_add("i", 3, "third".into());
        assert_eq!(ks.index_desc("i"), vec!["third", "second", "first"]);
        ks.index_remove("i", "second");
        assert_eq!(ks.index_desc("i"), vec!["third", "first"]);
    }
}
