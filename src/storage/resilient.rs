// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! [`StoreAdapter`] decorator that runs every call through a resilience pipeline.
//!
//! Reads (`get`, `query`) and writes (`put`, `delete`) get separate pipelines
//! and therefore separate circuit breakers: a store that rejects writes can
//! keep serving reads.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};

use super::traits::{EntityStream, QuerySpec, StorageError, StoreAdapter};
use crate::clock::SharedClock;
use crate::entity::Entity;
use crate::resilience::cancel::CancelToken;
use crate::resilience::circuit_breaker::CircuitSnapshot;
use crate::resilience::pipeline::{PipelineConfig, ResiliencePipeline};

pub struct ResilientStore {
    name: String,
    inner: Arc<dyn StoreAdapter>,
    read: ResiliencePipeline,
    write: ResiliencePipeline,
}

impl ResilientStore {
    pub fn new(inner: Arc<dyn StoreAdapter>, config: PipelineConfig, clock: SharedClock) -> Self {
        let name = inner.name().to_string();
        Self {
            read: ResiliencePipeline::new(format!("{}.read", name), config.clone(), clock.clone()),
            write: ResiliencePipeline::new(format!("{}.write", name), config, clock),
            name,
            inner,
        }
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<dyn StoreAdapter> {
        &self.inner
    }

    /// Breaker state for the read and write pipelines
    #[must_use]
    pub fn circuits(&self) -> [CircuitSnapshot; 2] {
        [self.read.snapshot(), self.write.snapshot()]
    }
}

#[async_trait]
impl StoreAdapter for ResilientStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str, cancel: &CancelToken) -> Result<Option<Entity>, StorageError> {
        self.read
            .execute("get", cancel, || self.inner.get(id, cancel))
            .await
    }

    async fn put(
        &self,
        entity: &Entity,
        expected: Option<i64>,
        cancel: &CancelToken,
    ) -> Result<i64, StorageError> {
        self.write
            .execute("put", cancel, || self.inner.put(entity, expected, cancel))
            .await
    }

    async fn delete(&self, id: &str, cancel: &CancelToken) -> Result<(), StorageError> {
        self.write
            .execute("delete", cancel, || self.inner.delete(id, cancel))
            .await
    }

    /// The protected unit is the whole query: the matching entities are
    /// collected under the read pipeline on first poll, then replayed. Callers
    /// wanting bounded memory page with [`QuerySpec::page`].
    fn query<'a>(&'a self, spec: QuerySpec, cancel: &'a CancelToken) -> EntityStream<'a> {
        let load = async move {
            self.read
                .execute("query", cancel, || {
                    let spec = spec.clone();
                    async move {
                        self.inner
                            .query(spec, cancel)
                            .try_collect::<Vec<Entity>>()
                            .await
                    }
                })
                .await
        };

        stream::once(load)
            .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resilience::circuit_breaker::{CircuitConfig, CircuitState};
    use crate::resilience::retry::RetryConfig;
    use crate::storage::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` calls of every kind with `Unavailable`
    struct Flaky {
        inner: InMemoryStore,
        failures: usize,
        calls: AtomicUsize,
        down: std::sync::atomic::AtomicBool,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                inner: InMemoryStore::new("flaky"),
                failures,
                calls: AtomicUsize::new(0),
                down: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn gate(&self) -> Result<(), StorageError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures || self.down.load(Ordering::SeqCst) {
                Err(StorageError::Unavailable("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl StoreAdapter for Flaky {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn get(&self, id: &str, cancel: &CancelToken) -> Result<Option<Entity>, StorageError> {
            self.gate()?;
            self.inner.get(id, cancel).await
        }

        async fn put(&self, entity: &Entity, expected: Option<i64>, cancel: &CancelToken) -> Result<i64, StorageError> {
            self.gate()?;
            self.inner.put(entity, expected, cancel).await
        }

        async fn delete(&self, id: &str, cancel: &CancelToken) -> Result<(), StorageError> {
            self.gate()?;
            self.inner.delete(id, cancel).await
        }

        fn query<'a>(&'a self, spec: QuerySpec, cancel: &'a CancelToken) -> EntityStream<'a> {
            match self.gate() {
                Ok(()) => self.inner.query(spec, cancel),
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            }
        }
    }

    fn wrap(inner: Arc<dyn StoreAdapter>) -> ResilientStore {
        let config = PipelineConfig {
            retry: RetryConfig::test(),
            circuit: CircuitConfig::default(),
            timeout: Duration::from_secs(1),
        };
        ResilientStore::new(inner, config, Arc::new(ManualClock::default()))
    }

    #[tokio::test]
    async fn test_transient_failures_are_absorbed() {
        let flaky = Arc::new(Flaky::new(2));
        let store = wrap(flaky.clone());
        let cancel = CancelToken::never();

        let version = store.put(&Entity::new("a", b"1".to_vec()), None, &cancel).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_query_goes_through_read_pipeline() {
        let flaky = Arc::new(Flaky::new(1));
        let cancel = CancelToken::never();
        for id in ["a", "b", "c"] {
            flaky.inner.put(&Entity::new(id, b"x".to_vec()), None, &cancel).await.unwrap();
        }
        let store = wrap(flaky.clone());

        let ids: Vec<String> = store
            .query(QuerySpec::page(Some("a".into()), 10), &cancel)
            .map_ok(|e| e.id)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(store.circuits()[0].successes, 1);
    }

    #[tokio::test]
    async fn test_read_and_write_circuits_are_independent() {
        let flaky = Arc::new(Flaky::new(0));
        let store = wrap(flaky.clone());
        let cancel = CancelToken::never();

        flaky.down.store(true, Ordering::SeqCst);
        for _ in 0..10 {
            let _ = store.put(&Entity::new("a", b"1".to_vec()), None, &cancel).await;
        }
        let [read, write] = store.circuits();
        assert_eq!(write.state, CircuitState::Open);
        assert_eq!(read.state, CircuitState::Closed);
        assert_eq!(write.name, "flaky.write");

        flaky.down.store(false, Ordering::SeqCst);
        assert!(store.get("a", &cancel).await.unwrap().is_none());
        let err = store.delete("a", &cancel).await.unwrap_err();
        assert_eq!(err, StorageError::CircuitOpen { circuit: "flaky.write".into() });
    }
}
