//! 链路状态持久化
//!
//! `link_state` 表中一条链路一行。锁定读通过一次空更新拿到 SQLite 的写锁，
//! 效果等同于 `SELECT ... FOR UPDATE`：同一时刻只有一个事务能改写 epoch。

use sqlx::SqliteConnection;
use tokio::sync::RwLock;

use super::link_state::{LinkKey, LinkSide, LinkState, SessionWindow, TableName};
use crate::infra::db::LinkStateRecord;
use crate::infra::error::{Error, Result};

/// 某条链路在 `link_state` 表中的行
#[derive(Debug, Clone)]
pub struct LinkStateRow {
    side: LinkSide,
    key: LinkKey,
}

impl LinkStateRow {
    pub fn new(side: LinkSide, key: LinkKey) -> Self {
        Self { side, key }
    }

    pub fn key(&self) -> &LinkKey {
        &self.key
    }

    pub fn side(&self) -> LinkSide {
        self.side
    }

    /// 确保行存在（未初始化状态）
    pub async fn ensure(&self, conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO link_state (side, source_key, destination_key, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(self.side.as_str())
        .bind(&self.key.source)
        .bind(&self.key.destination)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// 读取链路状态
    ///
    /// # 错误
    /// 行不存在时返回协议错误
    pub async fn load(&self, conn: &mut SqliteConnection) -> Result<LinkState> {
        let record = sqlx::query_as::<_, LinkStateRecord>(
            "SELECT * FROM link_state WHERE side = ? AND source_key = ? AND destination_key = ?",
        )
        .bind(self.side.as_str())
        .bind(&self.key.source)
        .bind(&self.key.destination)
        .fetch_optional(&mut *conn)
        .await?;

        match record {
            Some(record) => record_to_state(&record),
            None => Err(self.missing()),
        }
    }

    /// 锁定读取链路状态
    ///
    /// 必须在事务内调用，锁一直持有到事务提交或回滚
    pub async fn lock(&self, conn: &mut SqliteConnection) -> Result<LinkState> {
        let locked = sqlx::query(
            "UPDATE link_state SET epoch = epoch
             WHERE side = ? AND source_key = ? AND destination_key = ?",
        )
        .bind(self.side.as_str())
        .bind(&self.key.source)
        .bind(&self.key.destination)
        .execute(&mut *conn)
        .await?;

        if locked.rows_affected() == 0 {
            return Err(self.missing());
        }
        self.load(conn).await
    }

    /// 写入完整状态
    pub async fn save(&self, conn: &mut SqliteConnection, state: &LinkState) -> Result<()> {
        sqlx::query(
            "UPDATE link_state SET
                epoch = ?, announced = ?,
                head_lo = ?, head_hi = ?, head_table = ?,
                tail_lo = ?, tail_hi = ?, tail_table = ?,
                updated_at = ?
             WHERE side = ? AND source_key = ? AND destination_key = ?",
        )
        .bind(state.epoch)
        .bind(state.announced)
        .bind(state.head.lo)
        .bind(state.head.hi)
        .bind(state.head.table.as_str())
        .bind(state.tail.lo)
        .bind(state.tail.hi)
        .bind(state.tail.table.as_str())
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(self.side.as_str())
        .bind(&self.key.source)
        .bind(&self.key.destination)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// 标记某个 epoch 已通知对端
    ///
    /// 只在存储中的 epoch 仍是该 epoch 时生效，返回是否更新成功
    pub async fn mark_announced(&self, conn: &mut SqliteConnection, epoch: i64) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE link_state SET announced = 1, updated_at = ?
             WHERE side = ? AND source_key = ? AND destination_key = ? AND epoch = ?",
        )
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(self.side.as_str())
        .bind(&self.key.source)
        .bind(&self.key.destination)
        .bind(epoch)
        .execute(&mut *conn)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    fn missing(&self) -> Error {
        Error::Protocol(format!("链路状态行不存在: {} {}", self.side, self.key))
    }
}

/// 持久器内存中的链路状态缓存
///
/// 只接受更新的状态，缓存永不回退
#[derive(Debug, Default)]
pub struct LinkStateCache {
    state: RwLock<LinkState>,
}

impl LinkStateCache {
    pub async fn get(&self) -> LinkState {
        self.state.read().await.clone()
    }

    /// 用更新的状态覆盖缓存，返回覆盖后的缓存
    pub async fn remember(&self, fresh: &LinkState) -> LinkState {
        let mut cached = self.state.write().await;
        if fresh.supersedes(&cached) {
            *cached = fresh.clone();
        }
        cached.clone()
    }
}

/// 把数据库记录转换为链路状态
pub fn record_to_state(record: &LinkStateRecord) -> Result<LinkState> {
    if record.epoch == 0 {
        return Ok(LinkState::uninitialized());
    }

    Ok(LinkState {
        epoch: record.epoch,
        announced: record.announced,
        head: SessionWindow::new(
            record.head_lo,
            record.head_hi,
            TableName::new(&record.head_table)?,
        ),
        tail: SessionWindow::new(
            record.tail_lo,
            record.tail_hi,
            TableName::new(&record.tail_table)?,
        ),
    })
}
