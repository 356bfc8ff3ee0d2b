//! Lazy, shared-future memoization for expensive singletons (clients,
//! connection pools, compiled templates).
//!
//! Concurrent callers share one in-flight load; a failed load clears the
//! slot so the next caller retries, but only if the slot still holds the
//! failed attempt — a newer load started in the meantime is left in place.
//! The shared future itself deduplicates callers, so there is no lock map
//! and no busy-wait.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::Error;

type SharedLoad<T> = Shared<BoxFuture<'static, Result<T, Arc<Error>>>>;

/// Memoizes a single resource behind one loader.
pub struct ModuleCache<T: Clone + Send + Sync + 'static> {
    loader: Arc<dyn Fn() -> BoxFuture<'static, Result<T, Error>> + Send + Sync>,
    slot: Mutex<Option<SharedLoad<T>>>,
}

impl<T: Clone + Send + Sync + 'static> ModuleCache<T> {
    pub fn new<F, Fut>(loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self {
            loader: Arc::new(move || loader().boxed()),
            slot: Mutex::new(None),
        }
    }

    /// Get the cached value, loading it if needed. Concurrent callers
    /// await the same load.
    pub async fn get(&self) -> Result<T, Arc<Error>> {
        let load = {
            let mut slot = self.slot.lock().expect("module cache mutex poisoned");
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let loader = self.loader.clone();
                    let fresh = async move { loader().await.map_err(Arc::new) }
                        .boxed()
                        .shared();
                    *slot = Some(fresh.clone());
                    fresh
                }
            }
        };

        let result = load.clone().await;
        if result.is_err() {
            let mut slot = self.slot.lock().expect("module cache mutex poisoned");
            // Snapshot compare: only clear our own failed attempt. If a
            // newer load replaced it, that one stays.
            if slot
                .as_ref()
                .is_some_and(|current| Shared::ptr_eq(current, &load))
            {
                *slot = None;
            }
        }
        result
    }

    #[cfg(test)]
    fn is_loaded(&self) -> bool {
        self.slot
            .lock()
            .expect("module cache mutex poisoned")
            .is_some()
    }
}

/// Keyed variant with the same snapshot-compare semantics per key. Each
/// load runs under a breaker dedicated to this cache, so a flapping
/// upstream stops being hammered by cache misses.
pub struct KeyedModuleCache<T: Clone + Send + Sync + 'static> {
    loader: Arc<dyn Fn(String) -> BoxFuture<'static, Result<T, Error>> + Send + Sync>,
    entries: Mutex<HashMap<String, SharedLoad<T>>>,
    breaker: Arc<CircuitBreaker>,
}

impl<T: Clone + Send + Sync + 'static> KeyedModuleCache<T> {
    pub fn new<F, Fut>(name: &str, loader: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self {
            loader: Arc::new(move |key| loader(key).boxed()),
            entries: Mutex::new(HashMap::new()),
            breaker: CircuitBreaker::named(
                &format!("module-cache:{name}"),
                BreakerConfig::default(),
            ),
        }
    }

    pub async fn get(&self, key: &str) -> Result<T, Arc<Error>> {
        let load = {
            let mut entries = self.entries.lock().expect("module cache mutex poisoned");
            match entries.get(key) {
                Some(existing) => existing.clone(),
                None => {
                    let loader = self.loader.clone();
                    let breaker = self.breaker.clone();
                    let owned_key = key.to_owned();
                    let fresh = async move {
                        breaker
                            .execute(loader(owned_key))
                            .await
                            .map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    entries.insert(key.to_owned(), fresh.clone());
                    fresh
                }
            }
        };

        let result = load.clone().await;
        if result.is_err() {
            let mut entries = self.entries.lock().expect("module cache mutex poisoned");
            if entries
                .get(key)
                .is_some_and(|current| Shared::ptr_eq(current, &load))
            {
                entries.remove(key);
            }
        }
        result
    }
}
