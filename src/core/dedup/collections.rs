//! 链路集合
//!
//! 出站侧按目标、入站侧按发送方各持有一组持久器。出站链路在启动时按配置创建，
//! 入站链路在第一次收到某个发送方的消息时按需创建。

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

use super::inbox::InboxPersister;
use super::link_state::LinkKey;
use super::outbox::OutboxPersister;
use crate::infra::db::Database;
use crate::infra::error::Result;

/// 一条出站链路：持久器加唤醒清理循环的信号
#[derive(Clone)]
pub struct OutboxLink {
    pub persister: Arc<OutboxPersister>,
    pub trigger: Arc<Notify>,
}

/// 出站链路集合
#[derive(Clone, Default)]
pub struct OutboxCollection {
    links: Arc<DashMap<String, OutboxLink>>,
}

impl OutboxCollection {
    /// 按配置的目标列表创建出站链路
    ///
    /// # 参数说明
    /// * `local` - 本节点名称（即 sequence-key）
    /// * `destinations` - 启用去重的目标
    /// * `epoch_size` - 窗口宽度
    pub fn new(local: &str, destinations: &[String], epoch_size: i64) -> Self {
        let links = DashMap::new();
        for destination in destinations {
            let persister = OutboxPersister::new(LinkKey::new(local, destination), epoch_size);
            links.insert(
                destination.clone(),
                OutboxLink {
                    persister: Arc::new(persister),
                    trigger: Arc::new(Notify::new()),
                },
            );
        }
        Self {
            links: Arc::new(links),
        }
    }

    pub fn get(&self, destination: &str) -> Option<OutboxLink> {
        self.links.get(destination).map(|link| link.clone())
    }

    pub fn is_enabled(&self, destination: &str) -> bool {
        self.links.contains_key(destination)
    }

    pub fn links(&self) -> Vec<OutboxLink> {
        self.links.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// 入站链路集合
#[derive(Clone)]
pub struct InboxCollection {
    local: String,
    persisters: Arc<DashMap<String, Arc<InboxPersister>>>,
}

impl InboxCollection {
    pub fn new(local: &str) -> Self {
        Self {
            local: local.to_string(),
            persisters: Arc::new(DashMap::new()),
        }
    }

    /// 获取发送方对应的入站持久器，不存在时创建并确保状态行存在
    pub async fn get_or_create(&self, db: &Database, source: &str) -> Result<Arc<InboxPersister>> {
        if let Some(persister) = self.persisters.get(source) {
            return Ok(persister.clone());
        }

        let persister = Arc::new(InboxPersister::new(LinkKey::new(source, &self.local)));
        persister.setup(db).await?;

        let persister = self
            .persisters
            .entry(source.to_string())
            .or_insert_with(|| {
                info!(source, local = %self.local, "新的入站链路");
                persister
            })
            .clone();
        Ok(persister)
    }

    pub fn len(&self) -> usize {
        self.persisters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persisters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_links_per_destination() {
        let outboxes = OutboxCollection::new("a", &["b".to_string(), "c".to_string()], 10);
        assert_eq!(outboxes.len(), 2);
        assert!(outboxes.is_enabled("b"));
        assert!(!outboxes.is_enabled("d"));
        assert_eq!(outboxes.get("c").unwrap().persister.key(), &LinkKey::new("a", "c"));
    }

    #[tokio::test]
    async fn test_inbox_persisters_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("links.db").to_str().unwrap())
            .await
            .unwrap();
        let inboxes = InboxCollection::new("b");

        let first = inboxes.get_or_create(&db, "a").await.unwrap();
        let again = inboxes.get_or_create(&db, "a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.key(), &LinkKey::new("a", "b"));

        inboxes.get_or_create(&db, "c").await.unwrap();
        assert_eq!(inboxes.len(), 2);
        assert_eq!(db.list_link_states().await.unwrap().len(), 2);
    }
}
