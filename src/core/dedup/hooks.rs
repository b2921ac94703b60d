//! 管道挂钩
//!
//! # 出站捕获
//! 路由管道通过 `ForwardContext::send` 发出消息。目标启用了去重时，
//! 消息不直接发出，而是在接收事务内写入出站窗口，事务提交后交给分发循环。
//!
//! # 入站去重
//! `InboundDeduplication::invoke(ctx, next)` 在同一事务内先对打过序号的消息去重，
//! 首次见到才调用 `next` 继续管道；控制消息和 Plug 在这里消费，不进入管道。
//! 未启用去重的接口上收到的控制消息和 Plug 直接丢弃。

use sqlx::SqliteConnection;
use tracing::{debug, error, warn};

use super::collections::{InboxCollection, OutboxCollection};
use super::control::{self, classify, ControlMessage, LinkMessage};
use super::dispatcher::Dispatcher;
use super::inbox::{DedupOutcome, InboxAdvance};
use super::outbox::{CapturedOperation, StoreOutcome};
use crate::core::message::sender::MessageSender;
use crate::core::message::types::{InboundMessage, OutboundMessage, RouterMessage};
use crate::core::routing::ForwardPipeline;
use crate::infra::db::{Database, Tx};
use crate::infra::error::{Error, Result};

/// 接收结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// 已进入路由管道
    Forwarded,
    /// 控制消息或 Plug，已处理但不转发
    Consumed,
    /// 重复消息，静默丢弃
    Duplicate,
    /// 链路状态未就绪，事务已回滚，传输层应重新投递
    RetryLater,
}

/// 一次转发的事务上下文
pub struct ForwardContext {
    tx: Tx,
    incoming: Option<InboundMessage>,
    outboxes: OutboxCollection,
    captured: Vec<CapturedOperation>,
    immediate: Vec<OutboundMessage>,
}

impl ForwardContext {
    /// 开启事务并创建上下文
    ///
    /// # 参数说明
    /// * `db` - 数据库
    /// * `incoming` - 触发本次转发的入站消息，本地发起的发送为 `None`
    /// * `outboxes` - 出站链路集合
    pub async fn begin(
        db: &Database,
        incoming: Option<InboundMessage>,
        outboxes: OutboxCollection,
    ) -> Result<Self> {
        Ok(Self {
            tx: db.begin().await?,
            incoming,
            outboxes,
            captured: Vec::new(),
            immediate: Vec::new(),
        })
    }

    pub fn incoming(&self) -> Option<&InboundMessage> {
        self.incoming.as_ref()
    }

    /// 事务连接
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// 发出一条消息
    ///
    /// # 错误
    /// 出站窗口暂时无法接收时返回 `Error::RetryLater`，调用方应回滚整个上下文
    pub async fn send(&mut self, destination: &str, message: RouterMessage) -> Result<()> {
        let Some(link) = self.outboxes.get(destination) else {
            self.immediate.push(OutboundMessage::new(destination, message));
            return Ok(());
        };

        let trigger = || link.trigger.notify_one();
        match link.persister.store(&mut self.tx, message, &trigger).await? {
            StoreOutcome::Stored(operation) => {
                self.captured.push(operation);
                Ok(())
            }
            StoreOutcome::RetryLater(reason) => Err(Error::RetryLater(reason)),
        }
    }

    pub fn captured(&self) -> &[CapturedOperation] {
        &self.captured
    }

    /// 提交事务并放行本次转发产生的出站操作
    ///
    /// 去重链路上的操作进入分发队列；其他目标在提交后直接发送，失败只记录日志
    pub async fn commit(self, dispatcher: &Dispatcher, sender: &dyn MessageSender) -> Result<()> {
        let Self {
            tx,
            captured,
            immediate,
            ..
        } = self;
        tx.commit().await?;

        for operation in captured {
            dispatcher.enqueue(operation).await?;
        }
        for message in immediate {
            let destination = message.destination.clone();
            if let Err(e) = sender.send(message).await {
                error!(destination = %destination, error = %e, "提交后发送失败");
            }
        }
        Ok(())
    }

    /// 回滚事务，丢弃所有出站操作
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// 入站去重挂钩
#[derive(Clone)]
pub struct InboundDeduplication {
    db: Database,
    inboxes: InboxCollection,
    interfaces: Vec<String>,
}

impl InboundDeduplication {
    /// # 参数说明
    /// * `interfaces` - 启用入站去重的接口名称
    pub fn new(db: Database, inboxes: InboxCollection, interfaces: Vec<String>) -> Self {
        Self {
            db,
            inboxes,
            interfaces,
        }
    }

    pub fn is_enabled(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i == interface)
    }

    /// 处理一条入站消息
    ///
    /// # 错误
    /// 控制头部非法时返回协议错误，管道返回的错误原样传播
    pub async fn invoke(
        &self,
        ctx: &mut ForwardContext,
        next: &dyn ForwardPipeline,
    ) -> Result<ReceiveOutcome> {
        let (message_id, link_message) = match ctx.incoming() {
            Some(incoming) if self.is_enabled(&incoming.interface) => {
                (incoming.message.id.clone(), classify(&incoming.message)?)
            }
            Some(incoming) if control::is_link_control(&incoming.message) => {
                warn!(
                    interface = %incoming.interface,
                    message_id = %incoming.message.id,
                    "接口未启用去重，丢弃链路控制消息"
                );
                return Ok(ReceiveOutcome::Consumed);
            }
            _ => (String::new(), LinkMessage::Unsequenced),
        };

        match link_message {
            LinkMessage::Unsequenced => {
                next.forward(ctx).await?;
                Ok(ReceiveOutcome::Forwarded)
            }
            LinkMessage::Control { source, control } => self.apply_control(&source, control).await,
            LinkMessage::Plug { source, seq } => {
                match self.deduplicate(ctx, &source, &message_id, seq).await? {
                    DedupOutcome::Ok => {
                        debug!(source = %source, seq, "Plug 已记录");
                        Ok(ReceiveOutcome::Consumed)
                    }
                    DedupOutcome::Duplicate => Ok(ReceiveOutcome::Duplicate),
                    DedupOutcome::RetryLater => Ok(ReceiveOutcome::RetryLater),
                }
            }
            LinkMessage::Stamped { source, seq } => {
                match self.deduplicate(ctx, &source, &message_id, seq).await? {
                    DedupOutcome::Ok => {
                        next.forward(ctx).await?;
                        Ok(ReceiveOutcome::Forwarded)
                    }
                    DedupOutcome::Duplicate => {
                        debug!(source = %source, seq, message_id = %message_id, "丢弃重复消息");
                        Ok(ReceiveOutcome::Duplicate)
                    }
                    DedupOutcome::RetryLater => Ok(ReceiveOutcome::RetryLater),
                }
            }
        }
    }

    async fn deduplicate(
        &self,
        ctx: &mut ForwardContext,
        source: &str,
        message_id: &str,
        seq: i64,
    ) -> Result<DedupOutcome> {
        let inbox = self.inboxes.get_or_create(&self.db, source).await?;
        inbox.deduplicate(ctx.connection(), message_id, seq).await
    }

    async fn apply_control(&self, source: &str, control: ControlMessage) -> Result<ReceiveOutcome> {
        let inbox = self.inboxes.get_or_create(&self.db, source).await?;
        match control {
            ControlMessage::Initialize {
                head_lo,
                head_hi,
                tail_lo,
                tail_hi,
            } => {
                inbox
                    .initialize(&self.db, head_lo, head_hi, tail_lo, tail_hi)
                    .await?;
                Ok(ReceiveOutcome::Consumed)
            }
            ControlMessage::Advance {
                epoch,
                head_lo,
                head_hi,
            } => match inbox.advance(&self.db, epoch, head_lo, head_hi).await? {
                InboxAdvance::Applied(_) | InboxAdvance::AlreadyApplied(_) => {
                    Ok(ReceiveOutcome::Consumed)
                }
                InboxAdvance::RetryLater => {
                    warn!(source, epoch, "Advance 暂时无法应用，等待重新投递");
                    Ok(ReceiveOutcome::RetryLater)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dedup::control;
    use crate::core::dedup::link_state::{LinkKey, LinkSide, LinkState, LinkTables};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPipeline {
        forwarded: AtomicUsize,
    }

    #[async_trait]
    impl ForwardPipeline for CountingPipeline {
        async fn forward(&self, _ctx: &mut ForwardContext) -> Result<()> {
            self.forwarded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn receive(
        db: &Database,
        hook: &InboundDeduplication,
        pipeline: &CountingPipeline,
        message: RouterMessage,
    ) -> ReceiveOutcome {
        let incoming = InboundMessage::new("link", message);
        let mut ctx = ForwardContext::begin(db, Some(incoming), OutboxCollection::default())
            .await
            .unwrap();
        let outcome = hook.invoke(&mut ctx, pipeline).await.unwrap();
        ctx.tx.commit().await.unwrap();
        outcome
    }

    fn stamped(id: &str, seq: i64) -> RouterMessage {
        let mut message = RouterMessage::with_id(id, b"payload".to_vec());
        control::stamp(&mut message, seq, "a");
        message
    }

    #[tokio::test]
    async fn test_invoke_forwards_each_sequence_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("hooks.db").to_str().unwrap())
            .await
            .unwrap();
        let hook = InboundDeduplication::new(db.clone(), InboxCollection::new("b"), vec!["link".to_string()]);
        let pipeline = CountingPipeline::default();

        // 初始化之前的消息需要重试
        assert_eq!(receive(&db, &hook, &pipeline, stamped("m0", 0)).await, ReceiveOutcome::RetryLater);

        let tables = LinkTables::for_link(LinkSide::Outbox, &LinkKey::new("a", "b"));
        let state = LinkState::initialize(&tables.first, &tables.second, 3);
        let init = control::initialize_message("a", &state);
        assert_eq!(receive(&db, &hook, &pipeline, init.clone()).await, ReceiveOutcome::Consumed);
        assert_eq!(receive(&db, &hook, &pipeline, init).await, ReceiveOutcome::Consumed);

        assert_eq!(receive(&db, &hook, &pipeline, stamped("m0", 0)).await, ReceiveOutcome::Forwarded);
        assert_eq!(receive(&db, &hook, &pipeline, stamped("m0", 0)).await, ReceiveOutcome::Duplicate);
        assert_eq!(
            receive(&db, &hook, &pipeline, control::plug_message("a", 1)).await,
            ReceiveOutcome::Consumed
        );
        assert_eq!(receive(&db, &hook, &pipeline, stamped("m2", 2)).await, ReceiveOutcome::Forwarded);
        assert_eq!(pipeline.forwarded.load(Ordering::SeqCst), 2);

        let advance = control::advance_message("a", &state.advance(3));
        assert_eq!(receive(&db, &hook, &pipeline, advance).await, ReceiveOutcome::Consumed);
        assert_eq!(receive(&db, &hook, &pipeline, stamped("m0", 0)).await, ReceiveOutcome::Duplicate);
        assert_eq!(pipeline.forwarded.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_interface_and_malformed_headers() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("hooks.db").to_str().unwrap())
            .await
            .unwrap();
        let pipeline = CountingPipeline::default();

        let plain = InboundDeduplication::new(db.clone(), InboxCollection::new("b"), Vec::new());
        assert_eq!(
            receive(&db, &plain, &pipeline, stamped("m0", 0)).await,
            ReceiveOutcome::Forwarded
        );
        assert_eq!(pipeline.forwarded.load(Ordering::SeqCst), 1);

        // 链路控制消息不会漏进未启用去重的接口的路由管道
        let tables = LinkTables::for_link(LinkSide::Outbox, &LinkKey::new("a", "b"));
        let state = LinkState::initialize(&tables.first, &tables.second, 3);
        for message in [
            control::plug_message("a", 3),
            control::initialize_message("a", &state),
            control::advance_message("a", &state.advance(3)),
        ] {
            assert_eq!(
                receive(&db, &plain, &pipeline, message).await,
                ReceiveOutcome::Consumed
            );
        }
        assert_eq!(pipeline.forwarded.load(Ordering::SeqCst), 1);

        let hook = InboundDeduplication::new(db.clone(), InboxCollection::new("b"), vec!["link".to_string()]);
        let broken = RouterMessage::with_id("bad", Vec::new())
            .with_header(control::SEQUENCE_KEY, "a")
            .with_header(control::SEQUENCE_NUMBER, "x");
        let mut ctx = ForwardContext::begin(&db, Some(InboundMessage::new("link", broken)), OutboxCollection::default())
            .await
            .unwrap();
        assert!(matches!(
            hook.invoke(&mut ctx, &pipeline).await,
            Err(Error::Protocol(_))
        ));
        ctx.rollback().await.unwrap();
    }
}
