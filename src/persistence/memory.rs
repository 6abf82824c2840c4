//! 内存存储：快照与 HITL 记录放在 tokio RwLock 保护的 HashMap 中
//!
//! 快照与 HITL 记录按 TTL 过期，写入时清除过期条目；快照超过上限时淘汰最早写入的会话。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{HitlStore, SnapshotStore, StoreError, SubmitOutcome};
use crate::workflow::{HitlRecord, HitlResponse, HitlStatus};

struct Entry<T> {
    value: T,
    stored_at: Instant,
}

pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, Entry<String>>>,
    hitl: RwLock<HashMap<(String, String), Entry<HitlRecord>>>,
    ttl: Duration,
    max_snapshots: usize,
}

impl MemoryStore {
    pub fn new(ttl_secs: u64, max_snapshots: usize) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            hitl: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
            max_snapshots: max_snapshots.max(1),
        }
    }

    fn is_live<T>(&self, entry: &Entry<T>) -> bool {
        entry.stored_at.elapsed() < self.ttl
    }

    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn hitl_count(&self) -> usize {
        self.hitl.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(3600, 1000)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save(&self, session_id: &str, blob: String) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().await;
        let ttl = self.ttl;
        snapshots.retain(|_, e| e.stored_at.elapsed() < ttl);
        if !snapshots.contains_key(session_id) && snapshots.len() >= self.max_snapshots {
            let oldest = snapshots
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                tracing::debug!(session_id = %key, "evicting oldest snapshot");
                snapshots.remove(&key);
            }
        }
        snapshots.insert(
            session_id.to_string(),
            Entry {
                value: blob,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<String>, StoreError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(session_id)
            .filter(|e| self.is_live(e))
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.snapshots.write().await.remove(session_id);
        Ok(())
    }
}

#[async_trait]
impl HitlStore for MemoryStore {
    async fn create(&self, record: HitlRecord) -> Result<(), StoreError> {
        let key = (record.session_id.clone(), record.request.id.clone());
        let mut hitl = self.hitl.write().await;
        let ttl = self.ttl;
        hitl.retain(|_, e| e.stored_at.elapsed() < ttl);
        hitl.insert(
            key,
            Entry {
                value: record,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn get(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Result<Option<HitlRecord>, StoreError> {
        let hitl = self.hitl.read().await;
        Ok(hitl
            .get(&(session_id.to_string(), request_id.to_string()))
            .filter(|e| self.is_live(e))
            .map(|e| e.value.clone()))
    }

    async fn pending(&self, session_id: &str) -> Result<Vec<HitlRecord>, StoreError> {
        let hitl = self.hitl.read().await;
        let mut records: Vec<HitlRecord> = hitl
            .iter()
            .filter(|((s, _), e)| {
                s == session_id && self.is_live(e) && e.value.status == HitlStatus::Pending
            })
            .map(|(_, e)| e.value.clone())
            .collect();
        records.sort_by_key(|r| r.request.created_at);
        Ok(records)
    }

    async fn submit_response(
        &self,
        session_id: &str,
        response: HitlResponse,
    ) -> Result<SubmitOutcome, StoreError> {
        let mut hitl = self.hitl.write().await;
        let key = (session_id.to_string(), response.request_id.clone());
        let ttl = self.ttl;
        let Some(entry) = hitl.get_mut(&key).filter(|e| e.stored_at.elapsed() < ttl) else {
            return Ok(SubmitOutcome::NotFound);
        };
        if entry.value.status != HitlStatus::Pending {
            return Ok(SubmitOutcome::AlreadyFinal(entry.value.clone()));
        }
        entry.value.status = HitlStatus::Responded;
        entry.value.response = Some(response);
        entry.value.updated_at = Utc::now();
        Ok(SubmitOutcome::Applied(entry.value.clone()))
    }

    async fn mark_timed_out(&self, session_id: &str, request_id: &str) -> Result<bool, StoreError> {
        let mut hitl = self.hitl.write().await;
        let key = (session_id.to_string(), request_id.to_string());
        match hitl.get_mut(&key) {
            Some(entry) if entry.value.status == HitlStatus::Pending => {
                entry.value.status = HitlStatus::TimedOut;
                entry.value.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{HitlKind, HitlRequest};

    #[tokio::test]
    async fn test_snapshot_save_load_delete() {
        let store = MemoryStore::default();
        store.save("s1", "{\"a\":1}".to_string()).await.unwrap();
        assert_eq!(store.load("s1").await.unwrap().as_deref(), Some("{\"a\":1}"));
        store.delete("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_cap_evicts_oldest() {
        let store = MemoryStore::new(3600, 2);
        store.save("s1", "1".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        store.save("s2", "2".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        store.save("s3", "3".into()).await.unwrap();
        assert_eq!(store.snapshot_count().await, 2);
        assert!(store.load("s1").await.unwrap().is_none());
        assert!(store.load("s3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_ttl_expires_immediately() {
        let store = MemoryStore::new(0, 10);
        store.save("s1", "x".into()).await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_hitl_records_are_pruned_on_create() {
        let store = MemoryStore::new(0, 10);
        for task in ["task_1", "task_2", "task_3"] {
            let request = HitlRequest::new(HitlKind::RiskWarning, task, 60);
            store.create(HitlRecord::pending("s1", request)).await.unwrap();
        }
        assert_eq!(store.hitl_count().await, 1);
        assert!(store.pending("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hitl_transitions_once() {
        let store = MemoryStore::default();
        let req = HitlRequest::new(HitlKind::RiskWarning, "task_1", 300);
        let req_id = req.id.clone();
        store.create(HitlRecord::pending("s1", req)).await.unwrap();
        assert_eq!(store.pending("s1").await.unwrap().len(), 1);

        let first = store
            .submit_response("s1", HitlResponse::select(&req_id, "proceed"))
            .await
            .unwrap();
        assert!(matches!(first, SubmitOutcome::Applied(_)));
        let second = store
            .submit_response("s1", HitlResponse::select(&req_id, "abort"))
            .await
            .unwrap();
        match second {
            SubmitOutcome::AlreadyFinal(rec) => {
                assert_eq!(rec.response.unwrap().selected_option, "proceed")
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!store.mark_timed_out("s1", &req_id).await.unwrap());
        assert!(store.pending("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_unknown_request() {
        let store = MemoryStore::default();
        let outcome = store
            .submit_response("s1", HitlResponse::select("missing", "x"))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::NotFound);
    }
}
