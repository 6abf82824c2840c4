//! 会话监管：按会话串行化 run / resume，并提供取消令牌
//!
//! 每个会话一把异步互斥锁，持锁期间驱动状态机；取消令牌都是根令牌的子令牌，
//! `cancel_all` 可一次中断所有会话。会话空闲后由 `release` 回收槽位。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

struct SessionSlot {
    lock: Arc<tokio::sync::Mutex<()>>,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct SessionSupervisor {
    root: CancellationToken,
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slot<T>(&self, session_id: &str, f: impl FnOnce(&mut SessionSlot) -> T) -> T {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionSlot {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                cancel: self.root.child_token(),
            });
        f(slot)
    }

    /// 获取会话锁；同一会话的调用按顺序执行
    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = self.with_slot(session_id, |slot| Arc::clone(&slot.lock));
        lock.lock_owned().await
    }

    /// 会话当前的取消令牌；已取消的令牌会被替换为新令牌
    pub fn cancel_token(&self, session_id: &str) -> CancellationToken {
        self.with_slot(session_id, |slot| {
            if slot.cancel.is_cancelled() && !self.root.is_cancelled() {
                slot.cancel = self.root.child_token();
            }
            slot.cancel.clone()
        })
    }

    /// 中断会话中正在进行的运行；没有槽位的会话没有可中断的运行
    pub fn cancel(&self, session_id: &str) {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = sessions.get(session_id) {
            slot.cancel.cancel();
        }
    }

    /// 没有持锁者也没有等待者时移除会话槽位
    pub fn release(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions
            .get(session_id)
            .is_some_and(|slot| Arc::strong_count(&slot.lock) == 1)
        {
            sessions.remove(session_id);
        }
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_session_is_serialised() {
        let sup = Arc::new(SessionSupervisor::new());
        let guard = sup.lock("s1").await;

        let other = Arc::clone(&sup);
        let waiter = tokio::spawn(async move {
            let _g = other.lock("s1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let _unrelated = sup.lock("s2").await;
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(sup.session_count(), 2);
    }

    #[tokio::test]
    async fn test_release_keeps_busy_slot() {
        let sup = SessionSupervisor::new();
        let guard = sup.lock("s1").await;
        sup.release("s1");
        assert_eq!(sup.session_count(), 1);

        drop(guard);
        sup.release("s1");
        assert_eq!(sup.session_count(), 0);

        sup.cancel("s1");
        assert_eq!(sup.session_count(), 0);
    }

    #[test]
    fn test_cancel_and_refresh_token() {
        let sup = SessionSupervisor::new();
        let token = sup.cancel_token("s1");
        sup.cancel("s1");
        assert!(token.is_cancelled());
        assert!(!sup.cancel_token("s1").is_cancelled());

        let token = sup.cancel_token("s2");
        sup.cancel_all();
        assert!(token.is_cancelled());
        assert!(sup.cancel_token("s2").is_cancelled());
    }
}
