//! Procedure cache.
//!
//! Keeps the handle of every registered procedure so invocations only send
//! the handle. If the store has forgotten a handle, the source is registered
//! again and the call retried exactly once; callers only see extra latency.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{StoreError, fault};
use crate::store::{CoordinationStore, ProcedureHandle, ProcedureSource, Reply};

/// Counters describing how invocations were served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Calls answered using an already-cached handle.
    pub fast_path: u64,
    /// Registrations sent to the store, including reloads.
    pub registrations: u64,
    /// Times a missing handle forced re-registration.
    pub reloads: u64,
}

pub struct ProcedureCache<S> {
    store: Arc<S>,
    sources: HashMap<&'static str, ProcedureSource>,
    handles: DashMap<&'static str, ProcedureHandle>,
    call_timeout: Duration,
    fast_path: AtomicU64,
    registrations: AtomicU64,
    reloads: AtomicU64,
}

impl<S: CoordinationStore> ProcedureCache<S> {
    pub fn new(store: Arc<S>, sources: &[ProcedureSource], call_timeout: Duration) -> Self {
        Self {
            store,
            sources: sources.iter().map(|s| (s.name, *s)).collect(),
            handles: DashMap::new(),
            call_timeout,
            fast_path: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Register `source`, unless identical source is already cached.
    pub async fn register(&self, source: &ProcedureSource) -> Result<ProcedureHandle, StoreError> {
        let expected = source.handle();
        if let Some(cached) = self.handles.get(source.name) {
            if *cached == expected {
                return Ok(expected);
            }
        }
        self.register_with_store(source).await
    }

    /// Register every known procedure up front.
    pub async fn warm_up(&self) -> Result<(), StoreError> {
        for source in self.sources.values() {
            self.register(source).await?;
        }
        Ok(())
    }

    /// Invoke the named procedure, re-registering once if the store lost it.
    pub async fn invoke(
        &self,
        name: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply, StoreError> {
        let Some(source) = self.sources.get(name) else {
            return Err(StoreError::fault(
                fault::UNKNOWN_COMMAND,
                format!("no procedure named `{name}`"),
            ));
        };

        let cached = self.handles.get(source.name).map(|h| h.value().clone());
        let handle = match cached {
            Some(handle) => handle,
            None => self.register_with_store(source).await?,
        };

        match self.call(&handle, keys, args).await {
            Err(StoreError::ProcedureMissing(_)) => {
                warn!(procedure = source.name, %handle, "store lost procedure; re-registering");
                self.reloads.fetch_add(1, Ordering::Relaxed);
                let handle = self.register_with_store(source).await?;
                self.call(&handle, keys, args).await
            }
            result => {
                self.fast_path.fetch_add(1, Ordering::Relaxed);
                result
            }
        }
    }

    /// Drop every cached handle. The next call per procedure registers again.
    pub fn forget(&self) {
        self.handles.clear();
    }

    pub fn cached_handle(&self, name: &str) -> Option<ProcedureHandle> {
        self.handles.get(name).map(|h| h.value().clone())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            fast_path: self.fast_path.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
        }
    }

    async fn register_with_store(
        &self,
        source: &ProcedureSource,
    ) -> Result<ProcedureHandle, StoreError> {
        let handle = tokio::time::timeout(self.call_timeout, self.store.register(source))
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))??;
        self.registrations.fetch_add(1, Ordering::Relaxed);
        debug!(procedure = source.name, %handle, "cached procedure handle");
        self.handles.insert(source.name, handle.clone());
        Ok(handle)
    }

    async fn call(
        &self,
        handle: &ProcedureHandle,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply, StoreError> {
        tokio::time::timeout(self.call_timeout, self.store.invoke(handle, keys, args))
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Arity, Keyspace, MemoryStore};

    fn echo(_: &mut dyn Keyspace, _: &[String], args: &[String]) -> Result<Reply, StoreError> {
        Ok(Reply::Text(args.join(",")))
    }

    const ECHO: ProcedureSource = ProcedureSource {
        name: "echo",
        version: 1,
        keys: Arity::exactly(0),
        args: Arity::at_least(0),
        body: echo,
    };

    fn cache(store: MemoryStore) -> ProcedureCache<MemoryStore> {
        ProcedureCache::new(Arc::new(store), &[ECHO], Duration::from_millis(200))
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let cache = cache(MemoryStore::new());
        let first = cache.register(&ECHO).await.unwrap();
        let second = cache.register(&ECHO).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.stats().registrations, 1);
    }

    #[tokio::test]
    async fn first_invoke_registers_then_uses_fast_path() {
        let cache = cache(MemoryStore::new());
        let reply = cache.invoke("echo", &[], &args(&["a", "b"])).await.unwrap();
        assert_eq!(reply, Reply::Text("a,b".into()));
        cache.invoke("echo", &[], &args(&["c"])).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.registrations, 1);
        assert_eq!(stats.fast_path, 2);
        assert_eq!(stats.reloads, 0);
        assert_eq!(cache.cached_handle("echo"), Some(ECHO.handle()));
    }

    #[tokio::test]
    async fn store_restart_is_transparent() {
        let cache = cache(MemoryStore::new());
        cache.warm_up().await.unwrap();
        cache.store().flush_procedures();

        let reply = cache.invoke("echo", &[], &args(&["x"])).await.unwrap();
        assert_eq!(reply, Reply::Text("x".into()));
        assert_eq!(cache.stats().reloads, 1);
        assert_eq!(cache.store().procedure_count(), 1);
    }

    #[tokio::test]
    async fn forgotten_handles_are_rebuilt() {
        let cache = cache(MemoryStore::new());
        cache.warm_up().await.unwrap();
        cache.forget();
        assert_eq!(cache.cached_handle("echo"), None);

        cache.invoke("echo", &[], &args(&["x"])).await.unwrap();
        assert_eq!(cache.stats().registrations, 2);
        assert_eq!(cache.stats().reloads, 0);
    }

    #[tokio::test]
    async fn rejected_reload_surfaces() {
        let cache = cache(MemoryStore::new());
        cache.warm_up().await.unwrap();
        cache.store().flush_procedures();
        cache.store().set_accept_registrations(false);

        let err = cache.invoke("echo", &[], &args(&["x"])).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn other_errors_propagate_unchanged() {
        let cache = cache(MemoryStore::new());
        cache.warm_up().await.unwrap();
        cache.store().set_online(false);

        let err = cache.invoke("echo", &[], &args(&["x"])).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(cache.stats().reloads, 0);
    }

    #[tokio::test]
    async fn unknown_procedure_is_unknown_command() {
        let cache = cache(MemoryStore::new());
        let err = cache.invoke("drop_everything", &[], &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::Fault { code, .. } if code == fault::UNKNOWN_COMMAND));
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let cache = ProcedureCache::new(
            Arc::new(MemoryStore::with_latency(Duration::from_millis(100))),
            &[ECHO],
            Duration::from_millis(10),
        );
        cache.warm_up().await.unwrap();
        let err = cache.invoke("echo", &[], &[]).await.unwrap_err();
        assert_eq!(err, StoreError::Timeout(Duration::from_millis(10)));
    }
}
