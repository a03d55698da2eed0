//! 会话存储：会话快照按 `session:<id>` 存入键值后端
//!
//! 存活会话使用 `retention` 作为 TTL，终态会话使用 `terminal_retention`。
//! 持久化后端不可用时退回进程内实现（重启后不保留）。

mod kv;
#[cfg(feature = "async-sqlite")]
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

pub use kv::{KvBackend, MemoryKv};
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteKv;

use crate::config::{BackendKind, StoreSection};
use crate::core::{OrchestratorError, Result, TransportError};
use crate::session::Session;

const KEY_PREFIX: &str = "session:";

#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KvBackend>,
    retention: Duration,
    terminal_retention: Duration,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvBackend>, retention: Duration, terminal_retention: Duration) -> Self {
        Self {
            kv,
            retention,
            terminal_retention,
        }
    }

    /// 进程内存储（测试与无持久化场景）
    pub fn in_memory() -> Self {
        let cfg = StoreSection::default();
        Self::new(
            Arc::new(MemoryKv::new()),
            Duration::from_secs(cfg.retention_secs),
            Duration::from_secs(cfg.terminal_retention_secs),
        )
    }

    pub fn is_durable(&self) -> bool {
        self.kv.is_durable()
    }

    fn key(session_id: &str) -> String {
        format!("{KEY_PREFIX}{session_id}")
    }

    pub fn ttl_for(&self, session: &Session) -> Duration {
        if session.status.is_terminal() {
            self.terminal_retention
        } else {
            self.retention
        }
    }

    /// 保存快照（覆盖）
    pub async fn save(&self, session: &Session) -> Result<(), TransportError> {
        let json = serde_json::to_string(session)?;
        self.kv
            .set(&Self::key(&session.id), json, Some(self.ttl_for(session)))
            .await?;
        Ok(())
    }

    /// 不存在或已过期返回 NotFound
    pub async fn load(&self, session_id: &str) -> Result<Session> {
        let json = self
            .kv
            .get(&Self::key(session_id))
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(session_id.to_string()))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// 幂等
    pub async fn delete(&self, session_id: &str) -> Result<(), TransportError> {
        self.kv.delete(&Self::key(session_id)).await?;
        Ok(())
    }

    /// 所有未过期会话；损坏的记录跳过并记录日志
    pub async fn list(&self) -> Result<Vec<Session>, TransportError> {
        let mut sessions = Vec::new();
        for key in self.kv.keys(KEY_PREFIX).await? {
            let Some(json) = self.kv.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<Session>(&json) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!(key = %key, "Skipping unreadable session record: {}", e),
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }
}

/// 按配置创建会话存储
pub async fn create_session_store(cfg: &StoreSection) -> SessionStore {
    let kv: Arc<dyn KvBackend> = match cfg.backend {
        BackendKind::Memory => Arc::new(MemoryKv::new()),
        BackendKind::Sqlite => open_sqlite(cfg).await,
    };
    SessionStore::new(
        kv,
        Duration::from_secs(cfg.retention_secs),
        Duration::from_secs(cfg.terminal_retention_secs),
    )
}

#[cfg(feature = "async-sqlite")]
async fn open_sqlite(cfg: &StoreSection) -> Arc<dyn KvBackend> {
    let path = cfg
        .path
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("stagehand_sessions.db"));
    match SqliteKv::open(&path).await {
        Ok(kv) => {
            tracing::info!("Session store opened at {}", path.display());
            Arc::new(kv)
        }
        Err(e) => {
            tracing::warn!(
                "Session store at {} unavailable ({}), falling back to in-memory store",
                path.display(),
                e
            );
            Arc::new(MemoryKv::new())
        }
    }
}

#[cfg(not(feature = "async-sqlite"))]
async fn open_sqlite(_cfg: &StoreSection) -> Arc<dyn KvBackend> {
    tracing::warn!("SQLite session store requested but the async-sqlite feature is disabled, using in-memory store");
    Arc::new(MemoryKv::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use serde_json::Value;

    #[tokio::test]
    async fn test_save_and_load() {
        let store = SessionStore::in_memory();
        let session = Session::new(Duration::from_secs(30), None, Value::Null);
        store.save(&session).await.unwrap();
        let loaded = store.load(&session.id).await.unwrap();
        assert_eq!(loaded, session);
        assert!(!store.is_durable());
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let store = SessionStore::in_memory();
        let err = store.load("session_missing").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
        store.delete("session_missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_sessions_use_terminal_ttl() {
        let store = SessionStore::new(
            Arc::new(MemoryKv::new()),
            Duration::from_secs(60),
            Duration::from_millis(20),
        );
        let mut session = Session::new(Duration::from_secs(30), None, Value::Null);
        session.status = SessionStatus::Ended;
        assert_eq!(store.ttl_for(&session), Duration::from_millis(20));
        store.save(&session).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(
            store.load(&session.id).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_skips_garbage() {
        let kv = Arc::new(MemoryKv::new());
        let store = SessionStore::new(kv.clone(), Duration::from_secs(60), Duration::from_secs(60));
        let session = Session::new(Duration::from_secs(30), None, Value::Null);
        store.save(&session).await.unwrap();
        kv.set("session:broken", "not json".into(), None).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, session.id);
    }
}
