//! 键值后端抽象与进程内实现

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::core::TransportError;

/// 带 TTL 的键值后端
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// 是否跨重启保留
    fn is_durable(&self) -> bool;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), TransportError>;

    /// 不存在或已过期返回 None
    async fn get(&self, key: &str) -> Result<Option<String>, TransportError>;

    async fn delete(&self, key: &str) -> Result<(), TransportError>;

    /// 所有未过期且以 prefix 开头的键
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TransportError>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// 每写入这么多次顺带清理一次过期条目
const PURGE_EVERY: u64 = 256;

/// 进程内 HashMap，读取时检查过期
///
/// 过期条目在 `keys` 扫描时以及每 `PURGE_EVERY` 次写入时释放。
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
    writes: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>, now: Instant) {
    let before = entries.len();
    entries.retain(|_, e| !e.is_expired(now));
    let purged = before - entries.len();
    if purged > 0 {
        tracing::debug!(purged, remaining = entries.len(), "Purged expired entries");
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    fn is_durable(&self) -> bool {
        false
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), TransportError> {
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let mut entries = self.entries.write().await;
        if self.writes.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            purge_expired(&mut entries, now);
        }
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TransportError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().await;
        if entries.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), TransportError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TransportError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries, now);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let kv = MemoryKv::new();
        kv.set("session:a", "{}".into(), None).await.unwrap();
        assert_eq!(kv.get("session:a").await.unwrap().as_deref(), Some("{}"));
        kv.delete("session:a").await.unwrap();
        kv.delete("session:a").await.unwrap();
        assert!(kv.get("session:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible() {
        let kv = MemoryKv::new();
        kv.set("session:a", "1".into(), Some(Duration::from_millis(20))).await.unwrap();
        kv.set("session:b", "2".into(), None).await.unwrap();
        kv.set("other:c", "3".into(), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv.get("session:a").await.unwrap().is_none());
        assert_eq!(kv.keys("session:").await.unwrap(), vec!["session:b".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_entries_are_freed_by_scan() {
        let kv = MemoryKv::new();
        for i in 0..1000 {
            kv.set(&format!("session:{i}"), "{}".into(), Some(Duration::from_millis(1)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(kv.keys("session:").await.unwrap().is_empty());
        assert_eq!(kv.entries.read().await.len(), 0);
    }

    #[tokio::test]
    async fn test_writes_free_expired_entries() {
        let kv = MemoryKv::new();
        for i in 0..PURGE_EVERY - 1 {
            kv.set(&format!("session:{i}"), "{}".into(), Some(Duration::from_millis(1)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        kv.set("session:live", "{}".into(), None).await.unwrap();
        let entries = kv.entries.read().await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("session:live"));
    }
}
