//! 出站持久器
//!
//! 每个启用去重的目标链路一个实例。负责给出站消息打序号并写入窗口表，
//! 以及发送侧的 epoch 迁移（初始化、填补空洞、交换窗口、通知对端）。
//!
//! # 关键约束
//! - `store` 运行在调用方事务内，只向清理循环发信号，从不阻塞在清理工作上
//! - 缓存的 `LinkState` 只会被更新的 epoch 覆盖，永不回退
//! - 序号按块预留并在事务外持久化，回滚的写入只留下空洞，序号不会重复发放
//! - epoch 交换在链路状态行的写锁下完成

use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use super::control;
use super::link_state::{LinkKey, LinkSide, LinkState, LinkTables, TableName};
use super::sequence::SequenceAllocator;
use super::store::{LinkStateCache, LinkStateRow};
use super::window::{self, InsertOutcome};
use crate::core::message::sender::MessageSender;
use crate::core::message::types::{Headers, OutboundMessage, RouterMessage};
use crate::infra::db::Database;
use crate::infra::error::{Error, Result};

/// 已写入窗口表、等待真正发出的出站操作
#[derive(Debug, Clone)]
pub struct CapturedOperation {
    /// 目标名称
    pub destination: String,
    /// 所在窗口表
    pub table: TableName,
    /// 序号
    pub seq: i64,
    /// 打过序号的消息
    pub message: RouterMessage,
}

/// `store` 的结果
#[derive(Debug, Clone)]
pub enum StoreOutcome {
    /// 已写入，提交后交给分发循环
    Stored(CapturedOperation),
    /// 当前没有窗口能接收该序号，调用方需要重新排队
    RetryLater(String),
}

/// `try_advance` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// 尚不需要推进
    Unchanged(LinkState),
    /// 已推进并通知对端
    Advanced(LinkState),
    /// 其他进程已经推进过
    Superseded(LinkState),
}

/// 出站持久器
#[derive(Debug)]
pub struct OutboxPersister {
    row: LinkStateRow,
    sequence: SequenceAllocator,
    tables: LinkTables,
    epoch_size: i64,
    /// 每次预留的序号数
    block: i64,
    cache: LinkStateCache,
}

impl OutboxPersister {
    /// 创建出站持久器
    ///
    /// # 参数说明
    /// * `key` - 链路键（本节点 → 目标）
    /// * `epoch_size` - 窗口宽度
    pub fn new(key: LinkKey, epoch_size: i64) -> Self {
        let tables = LinkTables::for_link(LinkSide::Outbox, &key);
        Self {
            sequence: SequenceAllocator::new(key.clone()),
            row: LinkStateRow::new(LinkSide::Outbox, key),
            tables,
            epoch_size,
            block: 2 * epoch_size,
            cache: LinkStateCache::default(),
        }
    }

    pub fn key(&self) -> &LinkKey {
        self.row.key()
    }

    pub fn tables(&self) -> &LinkTables {
        &self.tables
    }

    /// 当前缓存的链路状态（可能已过期）
    pub async fn cached_state(&self) -> LinkState {
        self.cache.get().await
    }

    async fn remember(&self, fresh: &LinkState) -> LinkState {
        self.cache.remember(fresh).await
    }

    /// 从存储刷新缓存
    pub async fn refresh(&self, conn: &mut SqliteConnection) -> Result<LinkState> {
        let fresh = self.row.load(conn).await?;
        Ok(self.remember(&fresh).await)
    }

    /// 启动时初始化链路
    ///
    /// 已初始化则不做改动；随后预留第一块序号，
    /// 新初始化或尚未通知对端时发送 Initialize/Advance 通知
    pub async fn initialize(&self, db: &Database, sender: &dyn MessageSender) -> Result<LinkState> {
        let mut tx = db.begin().await?;
        self.row.ensure(&mut tx).await?;
        self.sequence.ensure(&mut tx).await?;

        let locked = self.row.lock(&mut tx).await?;
        let state = if locked.is_initialized() {
            locked
        } else {
            for table in [&self.tables.first, &self.tables.second] {
                window::create_table(&mut tx, table).await?;
            }
            let state = LinkState::initialize(&self.tables.first, &self.tables.second, self.epoch_size);
            window::set_bounds(&mut tx, &state.head.table, state.head.lo, state.head.hi).await?;
            window::set_bounds(&mut tx, &state.tail.table, state.tail.lo, state.tail.hi).await?;
            self.row.save(&mut tx, &state).await?;
            info!(link = %self.key(), epoch_size = self.epoch_size, "出站链路已初始化");
            state
        };
        tx.commit().await?;
        self.remember(&state).await;

        let mut conn = db.pool().acquire().await?;
        self.sequence.top_up(&mut conn, self.block).await?;
        if state.announced {
            return Ok(state);
        }
        self.announce(&mut conn, sender, &state).await
    }

    /// 向对端通知当前 epoch 的边界，并持久化"已通知"
    async fn announce(
        &self,
        conn: &mut SqliteConnection,
        sender: &dyn MessageSender,
        state: &LinkState,
    ) -> Result<LinkState> {
        let message = control::announce_message(&self.key().source, state);
        sender
            .send(OutboundMessage::new(&self.key().destination, message))
            .await?;

        if self.row.mark_announced(conn, state.epoch).await? {
            info!(link = %self.key(), epoch = state.epoch, "已向对端通知 epoch 边界");
            Ok(self.remember(&state.announce()).await)
        } else {
            // 通知期间 epoch 已被其他进程推进，以存储为准
            self.refresh(conn).await
        }
    }

    /// 给出站消息打序号并写入窗口表
    ///
    /// # 参数说明
    /// * `conn` - 调用方事务的连接
    /// * `message` - 出站消息
    /// * `trigger_advance` - 唤醒清理循环的回调，必须非阻塞
    ///
    /// # 返回值
    /// 写入成功返回捕获的操作；没有可用序号或没有窗口能接收该序号时返回 `RetryLater`
    pub async fn store(
        &self,
        conn: &mut SqliteConnection,
        mut message: RouterMessage,
        trigger_advance: &(dyn Fn() + Send + Sync),
    ) -> Result<StoreOutcome> {
        let Some(next) = self.sequence.peek_next().await else {
            trigger_advance();
            debug!(link = %self.key(), "已预留的序号用完，等待清理循环预留");
            return Ok(StoreOutcome::RetryLater(format!(
                "链路 {} 暂无已预留的序号",
                self.key()
            )));
        };

        let mut state = self.cached_state().await;
        if state.is_stale(next) {
            state = self.refresh(conn).await?;
        }

        if state.should_advance(next) || self.sequence.remaining().await * 2 <= self.block {
            trigger_advance();
        }

        // 先确认有窗口再发放，避免重试时白白消耗序号
        if state.window_for(next).is_none() {
            warn!(link = %self.key(), seq = next, epoch = state.epoch, "没有窗口能接收该序号，稍后重试");
            return Ok(StoreOutcome::RetryLater(format!(
                "链路 {} 的序号 {} 超出当前窗口",
                self.key(),
                next
            )));
        }

        let Some(seq) = self.sequence.take().await else {
            trigger_advance();
            return Ok(StoreOutcome::RetryLater(format!(
                "链路 {} 暂无已预留的序号",
                self.key()
            )));
        };
        // 并发写入可能已取走 `next`
        if state.is_stale(seq) {
            state = self.refresh(conn).await?;
        }

        let table = match state.window_for(seq) {
            Some(window) => window.table.clone(),
            None => {
                warn!(link = %self.key(), seq, epoch = state.epoch, "序号已发放但超出当前窗口，作废");
                return Ok(StoreOutcome::RetryLater(format!(
                    "链路 {} 的序号 {} 超出当前窗口",
                    self.key(),
                    seq
                )));
            }
        };

        control::stamp(&mut message, seq, &self.key().source);
        let headers = serde_json::to_string(&message.headers)?;

        match window::insert(conn, &table, seq, &message.id, &headers, &message.body, false).await? {
            InsertOutcome::Inserted => {
                debug!(link = %self.key(), seq, table = %table, message_id = %message.id, "出站消息已写入窗口");
                Ok(StoreOutcome::Stored(CapturedOperation {
                    destination: self.key().destination.clone(),
                    table,
                    seq,
                    message,
                }))
            }
            outcome => {
                // epoch 在本次写入期间被推进了
                let fresh = self.refresh(conn).await?;
                warn!(link = %self.key(), seq, ?outcome, epoch = fresh.epoch, "窗口已过期，稍后重试");
                Ok(StoreOutcome::RetryLater(format!(
                    "链路 {} 的序号 {} 写入时窗口已推进",
                    self.key(),
                    seq
                )))
            }
        }
    }

    /// 标记某个捕获操作已真正发出
    pub async fn mark_dispatched(&self, db: &Database, table: &TableName, seq: i64) -> Result<()> {
        let mut conn = db.pool().acquire().await?;
        window::mark_dispatched(&mut conn, table, seq).await
    }

    /// 尝试推进 epoch（仅由清理循环调用）
    ///
    /// # 步骤
    /// 1. 从存储重新读取状态，补充预留序号，未通知则补发通知
    /// 2. 最近发放的序号未达到水位线则直接返回
    /// 3. 扫描 tail 窗口：缺失的行写入占位并发送 Plug，未分发的行重新分发
    /// 4. 在行锁下交换窗口并提交
    /// 5. 向对端发送 Advance
    pub async fn try_advance(&self, db: &Database, sender: &dyn MessageSender) -> Result<AdvanceOutcome> {
        let mut conn = db.pool().acquire().await?;
        let mut state = self.refresh(&mut conn).await?;
        if !state.is_initialized() {
            return Ok(AdvanceOutcome::Unchanged(state));
        }

        self.sequence.top_up(&mut conn, self.block).await?;
        if !state.announced {
            state = self.announce(&mut conn, sender, &state).await?;
        }

        let last_issued = self.last_issued(&mut conn, &state).await?;
        if !last_issued.is_some_and(|seq| state.should_advance(seq)) {
            return Ok(AdvanceOutcome::Unchanged(state));
        }

        let plugged = self.drain_tail(&mut conn, sender, &state).await?;
        debug!(link = %self.key(), epoch = state.epoch, plugged, "tail 窗口已排空");

        let mut tx = db.begin().await?;
        let locked = self.row.lock(&mut tx).await?;
        if locked.epoch != state.epoch {
            tx.commit().await?;
            info!(link = %self.key(), epoch = locked.epoch, "epoch 已被其他进程推进");
            return Ok(AdvanceOutcome::Superseded(self.remember(&locked).await));
        }

        let tail = &locked.tail;
        let entries = window::entries_in_range(&mut tx, &tail.table, tail.lo, tail.hi).await?;
        if entries.len() as i64 != tail.width() || entries.iter().any(|e| !e.dispatched) {
            tx.rollback().await?;
            warn!(link = %self.key(), epoch = locked.epoch, "tail 窗口仍有未处理的序号，推迟推进");
            return Ok(AdvanceOutcome::Unchanged(locked));
        }

        let next = locked.advance(self.epoch_size);
        window::truncate(&mut tx, &next.head.table).await?;
        window::set_bounds(&mut tx, &next.head.table, next.head.lo, next.head.hi).await?;
        self.row.save(&mut tx, &next).await?;
        tx.commit().await?;

        info!(
            link = %self.key(),
            epoch = next.epoch,
            head_lo = next.head.lo,
            head_hi = next.head.hi,
            "出站链路 epoch 已推进"
        );
        self.remember(&next).await;

        let announced = self.announce(&mut conn, sender, &next).await?;
        Ok(AdvanceOutcome::Advanced(announced))
    }

    /// 最近发放的序号
    ///
    /// 取窗口表中已提交的最大序号和本实例下一个待发放序号之前的那个，
    /// 崩溃后整块作废的序号也能推动 epoch 前进
    async fn last_issued(&self, conn: &mut SqliteConnection, state: &LinkState) -> Result<Option<i64>> {
        let mut last = self.sequence.peek_next().await.map(|next| next - 1);
        for table in [&state.head.table, &state.tail.table] {
            last = last.max(window::max_seq(conn, table).await?);
        }
        Ok(last)
    }

    /// 排空 tail 窗口，返回填补的空洞数
    async fn drain_tail(
        &self,
        conn: &mut SqliteConnection,
        sender: &dyn MessageSender,
        state: &LinkState,
    ) -> Result<usize> {
        let tail = &state.tail;
        let entries = window::entries_in_range(conn, &tail.table, tail.lo, tail.hi).await?;
        let holes = window::missing_sequences(tail.lo, tail.hi, &entries);

        for &seq in &holes {
            let plug = control::plug_message(&self.key().source, seq);
            let headers = serde_json::to_string(&plug.headers)?;
            match window::insert(conn, &tail.table, seq, &plug.id, &headers, &[], false).await? {
                InsertOutcome::Inserted | InsertOutcome::DuplicateSequence => {}
                InsertOutcome::OutsideWindow => {
                    return Err(Error::Database(format!(
                        "链路 {} 的窗口表 {} 约束与链路状态不一致",
                        self.key(),
                        tail.table
                    )));
                }
            }
            self.redispatch(conn, sender, &tail.table, seq).await?;
        }

        for entry in entries.iter().filter(|e| !e.dispatched) {
            self.redispatch(conn, sender, &tail.table, entry.seq).await?;
        }

        Ok(holes.len())
    }

    /// 重新分发窗口表中的一行并标记已分发
    async fn redispatch(
        &self,
        conn: &mut SqliteConnection,
        sender: &dyn MessageSender,
        table: &TableName,
        seq: i64,
    ) -> Result<()> {
        let Some(row) = window::fetch(conn, table, seq).await? else {
            return Ok(());
        };
        let headers: Headers = serde_json::from_str(&row.headers)?;
        let message = RouterMessage {
            id: row.message_id,
            headers,
            body: row.body,
        };

        sender
            .send(OutboundMessage::new(&self.key().destination, message))
            .await?;
        window::mark_dispatched(conn, table, seq).await?;
        debug!(link = %self.key(), seq, "tail 序号已重新分发");
        Ok(())
    }

    /// tail 窗口中缺失的序号数
    pub async fn tail_holes(&self, db: &Database) -> Result<i64> {
        let mut conn = db.pool().acquire().await?;
        let state = self.refresh(&mut conn).await?;
        if !state.is_initialized() {
            return Ok(0);
        }
        let tail = &state.tail;
        let present = window::count_in_range(&mut conn, &tail.table, tail.lo, tail.hi).await?;
        Ok(tail.width() - present)
    }
}
