// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-local [`SyncQueue`].

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::types::{
    DeadLetterRetry, EnqueueOutcome, NackOutcome, QueueDepth, QueueError, QueueSettings, SyncItem,
    SyncRequest,
};
use super::SyncQueue;
use crate::clock::{self, SharedClock};

#[derive(Default)]
struct State {
    /// Active item per entity
    active: HashMap<String, SyncItem>,
    /// Dead-lettered item per entity
    dead: HashMap<String, SyncItem>,
    /// keep_until of each applied record, oldest first
    applied: VecDeque<i64>,
}

impl State {
    fn purge_applied(&mut self, now: i64) -> usize {
        let before = self.applied.len();
        while self.applied.front().is_some_and(|keep_until| *keep_until <= now) {
            self.applied.pop_front();
        }
        before - self.applied.len()
    }
}

pub struct InMemorySyncQueue {
    state: Mutex<State>,
    settings: QueueSettings,
    clock: SharedClock,
}

impl InMemorySyncQueue {
    #[must_use]
    pub fn new(settings: QueueSettings, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(State::default()),
            settings,
            clock,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Applied-log records not yet purged
    #[must_use]
    pub fn applied_len(&self) -> usize {
        self.state.lock().applied.len()
    }

    fn leased<'a>(state: &'a mut State, item: &SyncItem) -> Result<&'a mut SyncItem, QueueError> {
        match state.active.get_mut(&item.entity_id) {
            Some(current) if current.id == item.id && current.is_leased_by(item) => Ok(current),
            _ => Err(QueueError::LeaseLost {
                item_id: item.id.clone(),
                entity_id: item.entity_id.clone(),
            }),
        }
    }
}

impl Default for InMemorySyncQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default(), clock::system())
    }
}

#[async_trait]
impl SyncQueue for InMemorySyncQueue {
    async fn enqueue(&self, request: SyncRequest) -> Result<EnqueueOutcome, QueueError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if let Some(current) = state.active.get_mut(&request.entity_id) {
            return Ok(current.coalesce(request));
        }
        let item = SyncItem::new(request, now);
        state.active.insert(item.entity_id.clone(), item);
        Ok(EnqueueOutcome::Inserted)
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<SyncItem>, QueueError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let next = state
            .active
            .values_mut()
            .filter(|item| item.is_claimable(now))
            .min_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.id.cmp(&b.id)));

        Ok(next.map(|item| {
            item.claim(worker_id, now, self.settings.lease_timeout);
            item.clone()
        }))
    }

    async fn ack(&self, item: &SyncItem) -> Result<(), QueueError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let current = Self::leased(&mut state, item)?;
        let follow_up = current.complete(now);
        let version = current.version;

        match follow_up {
            Some(next) => {
                state.active.insert(next.entity_id.clone(), next);
            }
            None => {
                state.active.remove(&item.entity_id);
            }
        }
        // A newer successful apply makes an older dead letter moot
        if state.dead.get(&item.entity_id).is_some_and(|d| d.version <= version) {
            state.dead.remove(&item.entity_id);
        }
        state.purge_applied(now);
        state
            .applied
            .push_back(clock::after(now, self.settings.applied_retention));
        Ok(())
    }

    async fn nack(&self, item: &SyncItem, error: &str) -> Result<NackOutcome, QueueError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let current = Self::leased(&mut state, item)?;
        let outcome = current.fail(error, now, &self.settings);

        if let NackOutcome::DeadLettered { .. } = outcome {
            if let Some(dead) = state.active.remove(&item.entity_id) {
                state.dead.insert(dead.entity_id.clone(), dead);
            }
        }
        Ok(outcome)
    }

    async fn release(&self, item: &SyncItem) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        Self::leased(&mut state, item)?.release();
        Ok(())
    }

    async fn active(&self, entity_id: &str) -> Result<Option<SyncItem>, QueueError> {
        Ok(self.state.lock().active.get(entity_id).cloned())
    }

    async fn dead_lettered(&self) -> Result<Vec<SyncItem>, QueueError> {
        let mut dead: Vec<SyncItem> = self.state.lock().dead.values().cloned().collect();
        dead.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(dead)
    }

    async fn retry_dead_lettered(&self, entity_id: &str) -> Result<DeadLetterRetry, QueueError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let mut dead = state
            .dead
            .remove(entity_id)
            .ok_or_else(|| QueueError::NotFound(entity_id.to_string()))?;

        if state.active.contains_key(entity_id) {
            return Ok(DeadLetterRetry::Superseded);
        }
        dead.revive(now);
        state.active.insert(entity_id.to_string(), dead);
        Ok(DeadLetterRetry::Requeued)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let state = self.state.lock();
        let mut depth = QueueDepth::default();
        for item in state.active.values() {
            depth.count(item.status);
        }
        depth.dead_lettered = state.dead.len();
        Ok(depth)
    }

    async fn purge_applied(&self) -> Result<u64, QueueError> {
        let now = self.clock.now_millis();
        Ok(self.state.lock().purge_applied(now) as u64)
    }
}

impl std::fmt::Debug for InMemorySyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemorySyncQueue")
            .field("active", &state.active.len())
            .field("dead", &state.dead.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::Entity;
    use crate::phase::StoreRole;
    use crate::queue::types::{SyncOperation, SyncStatus};
    use std::sync::Arc;
    use std::time::Duration;

    fn queue() -> (InMemorySyncQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let settings = QueueSettings {
            max_attempts: 3,
            lease_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
            applied_retention: Duration::from_secs(60),
        };
        (InMemorySyncQueue::new(settings, clock.clone()), clock)
    }

    fn upsert(id: &str, payload: &str, version: i64) -> SyncRequest {
        SyncRequest::upsert(
            &Entity::new(id, payload.as_bytes().to_vec()).with_version(version),
            SyncOperation::Update,
            StoreRole::Target,
        )
    }

    #[tokio::test]
    async fn test_enqueue_coalesces_per_entity() {
        let (q, _) = queue();

        assert_eq!(q.enqueue(upsert("a", "1", 1)).await.unwrap(), EnqueueOutcome::Inserted);
        assert_eq!(q.enqueue(upsert("a", "2", 2)).await.unwrap(), EnqueueOutcome::Coalesced);
        assert_eq!(q.enqueue(upsert("b", "1", 1)).await.unwrap(), EnqueueOutcome::Inserted);

        let depth = q.depth().await.unwrap();
        assert_eq!(depth.pending, 2);
        assert_eq!(q.active("a").await.unwrap().unwrap().payload, b"2");
    }

    #[tokio::test]
    async fn test_dequeue_claims_oldest_first() {
        let (q, clock) = queue();
        q.enqueue(upsert("a", "1", 1)).await.unwrap();
        clock.advance(Duration::from_millis(5));
        q.enqueue(upsert("b", "1", 1)).await.unwrap();

        let first = q.dequeue("w1").await.unwrap().unwrap();
        let second = q.dequeue("w2").await.unwrap().unwrap();
        assert_eq!(first.entity_id, "a");
        assert_eq!(second.entity_id, "b");
        assert!(q.dequeue("w3").await.unwrap().is_none());
        assert_eq!(q.depth().await.unwrap().processing, 2);
    }

    #[tokio::test]
    async fn test_write_during_processing_becomes_follow_up() {
        let (q, _) = queue();
        q.enqueue(upsert("a", "1", 1)).await.unwrap();
        let claimed = q.dequeue("w1").await.unwrap().unwrap();

        assert_eq!(q.enqueue(upsert("a", "2", 2)).await.unwrap(), EnqueueOutcome::Deferred);
        // Still exclusively owned
        assert!(q.dequeue("w2").await.unwrap().is_none());

        q.ack(&claimed).await.unwrap();
        let next = q.dequeue("w2").await.unwrap().unwrap();
        assert_eq!(next.payload, b"2");
        assert_eq!(next.version, 2);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered_and_stale_ack_rejected() {
        let (q, clock) = queue();
        q.enqueue(upsert("a", "1", 1)).await.unwrap();
        let first = q.dequeue("w1").await.unwrap().unwrap();

        clock.advance(Duration::from_secs(30));
        let second = q.dequeue("w2").await.unwrap().unwrap();
        assert_eq!(second.id, first.id);

        let err = q.ack(&first).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { .. }));
        q.ack(&second).await.unwrap();
        assert_eq!(q.depth().await.unwrap().active(), 0);
    }

    #[tokio::test]
    async fn test_nack_backs_off_then_dead_letters() {
        let (q, clock) = queue();
        q.enqueue(upsert("a", "1", 1)).await.unwrap();

        let item = q.dequeue("w1").await.unwrap().unwrap();
        let outcome = q.nack(&item, "down").await.unwrap();
        assert!(matches!(outcome, NackOutcome::Requeued { attempts: 1, .. }));
        assert!(q.dequeue("w1").await.unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        let item = q.dequeue("w1").await.unwrap().unwrap();
        q.nack(&item, "down").await.unwrap();

        clock.advance(Duration::from_secs(2));
        let item = q.dequeue("w1").await.unwrap().unwrap();
        assert_eq!(q.nack(&item, "down").await.unwrap(), NackOutcome::DeadLettered { attempts: 3 });

        let depth = q.depth().await.unwrap();
        assert_eq!(depth.active(), 0);
        assert_eq!(depth.dead_lettered, 1);
        let dead = q.dead_lettered().await.unwrap();
        assert_eq!(dead[0].status, SyncStatus::DeadLettered);
        assert_eq!(dead[0].last_error.as_deref(), Some("down"));
    }

    #[tokio::test]
    async fn test_retry_dead_lettered() {
        let (q, clock) = queue();
        q.enqueue(upsert("a", "1", 1)).await.unwrap();
        for _ in 0..3 {
            clock.advance(Duration::from_secs(10));
            let item = q.dequeue("w1").await.unwrap().unwrap();
            q.nack(&item, "down").await.unwrap();
        }

        assert_eq!(q.retry_dead_lettered("a").await.unwrap(), DeadLetterRetry::Requeued);
        let item = q.dequeue("w1").await.unwrap().unwrap();
        assert_eq!(item.attempts, 0);

        let err = q.retry_dead_lettered("a").await.unwrap_err();
        assert_eq!(err, QueueError::NotFound("a".into()));
    }

    #[tokio::test]
    async fn test_newer_write_supersedes_dead_letter() {
        let (q, clock) = queue();
        q.enqueue(upsert("a", "1", 1)).await.unwrap();
        for _ in 0..3 {
            clock.advance(Duration::from_secs(10));
            let item = q.dequeue("w1").await.unwrap().unwrap();
            q.nack(&item, "down").await.unwrap();
        }

        // A new write starts a fresh item alongside the dead letter
        assert_eq!(q.enqueue(upsert("a", "2", 2)).await.unwrap(), EnqueueOutcome::Inserted);
        let item = q.dequeue("w1").await.unwrap().unwrap();
        q.ack(&item).await.unwrap();

        assert!(q.dead_lettered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_returns_item_without_attempt() {
        let (q, _) = queue();
        q.enqueue(upsert("a", "1", 1)).await.unwrap();
        let item = q.dequeue("w1").await.unwrap().unwrap();

        q.release(&item).await.unwrap();
        let again = q.dequeue("w2").await.unwrap().unwrap();
        assert_eq!(again.attempts, 0);
        assert_eq!(again.worker_id.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_purge_applied_respects_retention() {
        let (q, clock) = queue();
        q.enqueue(upsert("a", "1", 1)).await.unwrap();
        let item = q.dequeue("w1").await.unwrap().unwrap();
        q.ack(&item).await.unwrap();
        assert_eq!(q.applied_len(), 1);

        assert_eq!(q.purge_applied().await.unwrap(), 0);
        clock.advance(Duration::from_secs(60));
        assert_eq!(q.purge_applied().await.unwrap(), 1);
        assert_eq!(q.applied_len(), 0);
    }

    #[tokio::test]
    async fn test_ack_drops_expired_applied_records() {
        let (q, clock) = queue();

        for round in 0..3 {
            for n in 0..200 {
                q.enqueue(upsert(&format!("e{}", n), "x", round + 1)).await.unwrap();
                let item = q.dequeue("w1").await.unwrap().unwrap();
                q.ack(&item).await.unwrap();
            }
            assert_eq!(q.applied_len(), 200);
            clock.advance(Duration::from_secs(120));
        }

        q.enqueue(upsert("last", "x", 1)).await.unwrap();
        let item = q.dequeue("w1").await.unwrap().unwrap();
        q.ack(&item).await.unwrap();
        assert_eq!(q.applied_len(), 1);
    }
}
