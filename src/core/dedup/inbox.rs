//! 入站持久器
//!
//! 每个发送方（sequence-key）一个实例。在接收事务内记录已见过的序号，
//! 并按发送方的 Initialize / Advance 通知轮换窗口。

use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use super::link_state::{LinkKey, LinkSide, LinkState, LinkTables};
use super::store::{LinkStateCache, LinkStateRow};
use super::window::{self, InsertOutcome};
use crate::infra::db::Database;
use crate::infra::error::{Error, Result};

/// 去重结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// 首次见到，继续转发
    Ok,
    /// 已见过，静默丢弃
    Duplicate,
    /// 链路状态尚未跟上，稍后重试
    RetryLater,
}

/// 入站 epoch 推进结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxAdvance {
    Applied(LinkState),
    /// 重复的 Advance 通知
    AlreadyApplied(LinkState),
    RetryLater,
}

/// 入站持久器
#[derive(Debug)]
pub struct InboxPersister {
    row: LinkStateRow,
    tables: LinkTables,
    cache: LinkStateCache,
}

impl InboxPersister {
    /// 创建入站持久器
    ///
    /// # 参数说明
    /// * `key` - 链路键（发送方 → 本节点）
    pub fn new(key: LinkKey) -> Self {
        Self {
            tables: LinkTables::for_link(LinkSide::Inbox, &key),
            row: LinkStateRow::new(LinkSide::Inbox, key),
            cache: LinkStateCache::default(),
        }
    }

    pub fn key(&self) -> &LinkKey {
        self.row.key()
    }

    pub fn tables(&self) -> &LinkTables {
        &self.tables
    }

    pub async fn cached_state(&self) -> LinkState {
        self.cache.get().await
    }

    /// 确保链路状态行存在并加载缓存
    pub async fn setup(&self, db: &Database) -> Result<LinkState> {
        let mut conn = db.pool().acquire().await?;
        self.row.ensure(&mut conn).await?;
        self.refresh(&mut conn).await
    }

    /// 从存储刷新缓存
    pub async fn refresh(&self, conn: &mut SqliteConnection) -> Result<LinkState> {
        let fresh = self.row.load(conn).await?;
        Ok(self.cache.remember(&fresh).await)
    }

    /// 对一条打过序号的消息去重
    ///
    /// 必须在转发该消息的同一事务内调用，事务回滚时记录一起回滚
    ///
    /// # 参数说明
    /// * `conn` - 接收事务的连接
    /// * `message_id` - 消息 ID
    /// * `seq` - 消息序号
    pub async fn deduplicate(
        &self,
        conn: &mut SqliteConnection,
        message_id: &str,
        seq: i64,
    ) -> Result<DedupOutcome> {
        let mut state = self.cache.get().await;
        if !state.is_initialized() || state.is_stale(seq) {
            state = self.refresh(conn).await?;
        }

        let mut refreshed_on_violation = false;
        loop {
            if !state.is_initialized() {
                debug!(link = %self.key(), seq, "链路尚未初始化，稍后重试");
                return Ok(DedupOutcome::RetryLater);
            }
            if state.is_retired(seq) {
                debug!(link = %self.key(), seq, tail_lo = state.tail.lo, "序号属于已退役窗口");
                return Ok(DedupOutcome::Duplicate);
            }
            let Some(window) = state.window_for(seq) else {
                debug!(link = %self.key(), seq, head_hi = state.head.hi, "序号超出当前窗口，等待 Advance");
                return Ok(DedupOutcome::RetryLater);
            };

            match window::insert(conn, &window.table, seq, message_id, "{}", &[], true).await? {
                InsertOutcome::Inserted => return Ok(DedupOutcome::Ok),
                InsertOutcome::DuplicateSequence => {
                    debug!(link = %self.key(), seq, message_id, "重复消息");
                    return Ok(DedupOutcome::Duplicate);
                }
                InsertOutcome::OutsideWindow if !refreshed_on_violation => {
                    refreshed_on_violation = true;
                    state = self.refresh(conn).await?;
                }
                InsertOutcome::OutsideWindow => {
                    warn!(link = %self.key(), seq, "窗口约束冲突，稍后重试");
                    return Ok(DedupOutcome::RetryLater);
                }
            }
        }
    }

    /// 处理 Initialize 通知
    ///
    /// 幂等：链路已初始化时保持原状态
    ///
    /// # 错误
    /// 边界不满足 `tail.hi == head.lo` 或宽度不一致时返回协议错误
    pub async fn initialize(
        &self,
        db: &Database,
        head_lo: i64,
        head_hi: i64,
        tail_lo: i64,
        tail_hi: i64,
    ) -> Result<LinkState> {
        let width = head_hi - head_lo;
        if width < 1 || tail_hi - tail_lo != width || tail_hi != head_lo {
            return Err(Error::Protocol(format!(
                "链路 {} 的初始化边界非法: head=[{}, {}) tail=[{}, {})",
                self.key(),
                head_lo,
                head_hi,
                tail_lo,
                tail_hi
            )));
        }

        let mut tx = db.begin().await?;
        self.row.ensure(&mut tx).await?;
        let locked = self.row.lock(&mut tx).await?;
        if locked.is_initialized() {
            tx.commit().await?;
            debug!(link = %self.key(), epoch = locked.epoch, "重复的初始化通知");
            return Ok(self.cache.remember(&locked).await);
        }

        for table in [&self.tables.first, &self.tables.second] {
            window::create_table(&mut tx, table).await?;
        }
        let state = LinkState::initialize_with_bounds(&self.tables, head_lo, head_hi, tail_lo, tail_hi);
        window::set_bounds(&mut tx, &state.head.table, state.head.lo, state.head.hi).await?;
        window::set_bounds(&mut tx, &state.tail.table, state.tail.lo, state.tail.hi).await?;
        self.row.save(&mut tx, &state).await?;
        tx.commit().await?;

        info!(link = %self.key(), head_lo, head_hi, tail_lo, tail_hi, "入站链路已初始化");
        Ok(self.cache.remember(&state).await)
    }

    /// 处理 Advance 通知
    ///
    /// tail 窗口存在空洞时拒绝推进：空洞对应的消息或 Plug 仍在路上，
    /// 提前截断会丢失这些序号的去重记录
    pub async fn advance(
        &self,
        db: &Database,
        next_epoch: i64,
        next_lo: i64,
        next_hi: i64,
    ) -> Result<InboxAdvance> {
        let mut conn = db.pool().acquire().await?;
        let state = self.refresh(&mut conn).await?;
        if !state.is_initialized() {
            debug!(link = %self.key(), next_epoch, "链路尚未初始化，Advance 稍后重试");
            return Ok(InboxAdvance::RetryLater);
        }
        if next_epoch <= state.epoch {
            return Ok(InboxAdvance::AlreadyApplied(state));
        }

        let holes = self.holes_in_tail(&mut conn, &state).await?;
        if holes > 0 {
            debug!(link = %self.key(), next_epoch, holes, "tail 窗口仍有空洞，Advance 稍后重试");
            return Ok(InboxAdvance::RetryLater);
        }
        drop(conn);

        let mut tx = db.begin().await?;
        let locked = self.row.lock(&mut tx).await?;
        if next_epoch <= locked.epoch {
            tx.commit().await?;
            return Ok(InboxAdvance::AlreadyApplied(self.cache.remember(&locked).await));
        }
        if locked.epoch != state.epoch || next_epoch != locked.epoch + 1 {
            tx.rollback().await?;
            warn!(
                link = %self.key(),
                current = locked.epoch,
                next_epoch,
                "epoch 不连续，Advance 稍后重试"
            );
            return Ok(InboxAdvance::RetryLater);
        }

        let next = locked.advance(next_hi - next_lo);
        if next.head.lo != next_lo || next.head.hi != next_hi || next.head.width() < 1 {
            tx.rollback().await?;
            return Err(Error::Protocol(format!(
                "链路 {} 的 Advance 边界 [{}, {}) 与当前 head 上界 {} 不衔接",
                self.key(),
                next_lo,
                next_hi,
                locked.head.hi
            )));
        }

        window::truncate(&mut tx, &next.head.table).await?;
        window::set_bounds(&mut tx, &next.head.table, next.head.lo, next.head.hi).await?;
        self.row.save(&mut tx, &next).await?;
        tx.commit().await?;

        info!(link = %self.key(), epoch = next.epoch, head_lo = next_lo, head_hi = next_hi, "入站链路 epoch 已推进");
        Ok(InboxAdvance::Applied(self.cache.remember(&next).await))
    }

    async fn holes_in_tail(&self, conn: &mut SqliteConnection, state: &LinkState) -> Result<i64> {
        let tail = &state.tail;
        let present = window::count_in_range(conn, &tail.table, tail.lo, tail.hi).await?;
        Ok(tail.width() - present)
    }

    /// tail 窗口中尚未见到的序号数
    pub async fn tail_holes(&self, db: &Database) -> Result<i64> {
        let mut conn = db.pool().acquire().await?;
        let state = self.refresh(&mut conn).await?;
        if !state.is_initialized() {
            return Ok(0);
        }
        self.holes_in_tail(&mut conn, &state).await
    }
}
