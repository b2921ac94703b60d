//! 链路序号分配器
//!
//! 每条出站链路一个持久化单调计数器，给穿过链路的每条消息打序号。
//!
//! 计数器按块预留：每次预留在独立连接上以自动提交语句推进 `next_value`，
//! 块内的序号在内存中逐个发放。发放出去的序号不随调用方事务回滚，
//! 进程崩溃时块内剩余的序号直接作废，因此序号永不重复，只会被跳过。
//! 跳过的序号在窗口表中表现为空洞，由清理循环填补。

use std::collections::VecDeque;
use std::ops::Range;

use sqlx::SqliteConnection;
use tokio::sync::Mutex;
use tracing::debug;

use super::link_state::LinkKey;
use crate::infra::error::{Error, Result};

/// 序号分配器
#[derive(Debug)]
pub struct SequenceAllocator {
    key: LinkKey,
    reserved: Mutex<VecDeque<Range<i64>>>,
}

impl SequenceAllocator {
    pub fn new(key: LinkKey) -> Self {
        Self {
            key,
            reserved: Mutex::new(VecDeque::new()),
        }
    }

    /// 确保计数器行存在
    pub async fn ensure(&self, conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO link_sequence (source_key, destination_key, next_value)
             VALUES (?, ?, 0)",
        )
        .bind(&self.key.source)
        .bind(&self.key.destination)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// 预留一块序号
    ///
    /// 必须在不处于事务中的连接上调用，预留在语句结束时即已持久化
    ///
    /// # 参数说明
    /// * `conn` - 自动提交的连接
    /// * `count` - 预留数量
    pub async fn reserve(&self, conn: &mut SqliteConnection, count: i64) -> Result<Range<i64>> {
        let start: Option<i64> = sqlx::query_scalar(
            "UPDATE link_sequence SET next_value = next_value + ?
             WHERE source_key = ? AND destination_key = ?
             RETURNING next_value - ?",
        )
        .bind(count)
        .bind(&self.key.source)
        .bind(&self.key.destination)
        .bind(count)
        .fetch_optional(&mut *conn)
        .await?;

        let start = start.ok_or_else(|| Error::Protocol(format!("链路序号行不存在: {}", self.key)))?;
        let block = start..start + count;
        debug!(link = %self.key, start = block.start, end = block.end, "已预留序号块");
        self.reserved.lock().await.push_back(block.clone());
        Ok(block)
    }

    /// 剩余序号不足 `block / 2` 时预留新的一块，返回是否预留
    pub async fn top_up(&self, conn: &mut SqliteConnection, block: i64) -> Result<bool> {
        if self.remaining().await * 2 > block {
            return Ok(false);
        }
        self.reserve(conn, block).await?;
        Ok(true)
    }

    /// 下一个将要发放的序号（不发放）
    pub async fn peek_next(&self) -> Option<i64> {
        let reserved = self.reserved.lock().await;
        reserved.front().map(|block| block.start)
    }

    /// 发放下一个序号，已预留的序号用完时返回 `None`
    pub async fn take(&self) -> Option<i64> {
        let mut reserved = self.reserved.lock().await;
        let block = reserved.front_mut()?;
        let seq = block.start;
        block.start += 1;
        if block.is_empty() {
            reserved.pop_front();
        }
        Some(seq)
    }

    /// 已预留但尚未发放的序号数
    pub async fn remaining(&self) -> i64 {
        let reserved = self.reserved.lock().await;
        reserved.iter().map(|block| block.end - block.start).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::db::Database;

    async fn test_db(dir: &tempfile::TempDir) -> Database {
        Database::new(dir.path().join("seq.db").to_str().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_values_are_monotonic_and_never_reused_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.db");

        {
            let db = Database::new(path.to_str().unwrap()).await.unwrap();
            let mut conn = db.pool().acquire().await.unwrap();
            let allocator = SequenceAllocator::new(LinkKey::new("a", "b"));
            allocator.ensure(&mut conn).await.unwrap();
            assert_eq!(allocator.take().await, None);

            assert_eq!(allocator.reserve(&mut conn, 4).await.unwrap(), 0..4);
            assert_eq!(allocator.take().await, Some(0));
            assert_eq!(allocator.take().await, Some(1));
            assert_eq!(allocator.remaining().await, 2);
            drop(conn);
            db.close().await;
        }

        // 重启后未发放的 2、3 作废，不会再次发放
        let db = Database::new(path.to_str().unwrap()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let allocator = SequenceAllocator::new(LinkKey::new("a", "b"));
        allocator.ensure(&mut conn).await.unwrap();
        allocator.reserve(&mut conn, 4).await.unwrap();
        assert_eq!(allocator.take().await, Some(4));
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_does_not_return_value() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir).await;
        let allocator = SequenceAllocator::new(LinkKey::new("a", "b"));
        {
            let mut conn = db.pool().acquire().await.unwrap();
            allocator.ensure(&mut conn).await.unwrap();
            allocator.reserve(&mut conn, 8).await.unwrap();
        }

        let tx = db.begin().await.unwrap();
        let first = allocator.take().await.unwrap();
        tx.rollback().await.unwrap();

        let tx = db.begin().await.unwrap();
        let second = allocator.take().await.unwrap();
        tx.rollback().await.unwrap();
        assert!(second > first);

        // 另一个实例从存储中预留，同样跳过前一块
        let other = SequenceAllocator::new(LinkKey::new("a", "b"));
        let mut conn = db.pool().acquire().await.unwrap();
        assert_eq!(other.reserve(&mut conn, 8).await.unwrap(), 8..16);
    }

    #[tokio::test]
    async fn test_top_up_and_independent_links() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir).await;
        let mut conn = db.pool().acquire().await.unwrap();

        let ab = SequenceAllocator::new(LinkKey::new("a", "b"));
        let ac = SequenceAllocator::new(LinkKey::new("a", "c"));
        ab.ensure(&mut conn).await.unwrap();
        ac.ensure(&mut conn).await.unwrap();

        assert!(ab.top_up(&mut conn, 4).await.unwrap());
        assert!(!ab.top_up(&mut conn, 4).await.unwrap());
        for expected in 0..3 {
            assert_eq!(ab.take().await, Some(expected));
        }
        // 剩余 1 个，不足半块，接着预留 4..8
        assert!(ab.top_up(&mut conn, 4).await.unwrap());
        assert_eq!(ab.peek_next().await, Some(3));
        assert_eq!(ab.take().await, Some(3));
        assert_eq!(ab.take().await, Some(4));
        assert_eq!(ab.remaining().await, 3);

        ac.reserve(&mut conn, 2).await.unwrap();
        assert_eq!(ac.take().await, Some(0));
    }

    #[tokio::test]
    async fn test_missing_counter_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(&dir).await;
        let mut conn = db.pool().acquire().await.unwrap();

        let allocator = SequenceAllocator::new(LinkKey::new("a", "b"));
        assert!(matches!(
            allocator.reserve(&mut conn, 4).await,
            Err(Error::Protocol(_))
        ));
    }
}
