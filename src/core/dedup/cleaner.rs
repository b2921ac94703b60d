//! 清理循环
//!
//! 每条出站链路一个后台任务，被 `store` 的水位线信号或轮询间隔唤醒，
//! 调用 `try_advance` 推进 epoch。链路尚未初始化时（例如启动时对端不可达）
//! 先重试初始化。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::outbox::{AdvanceOutcome, OutboxPersister};
use crate::core::message::sender::MessageSender;
use crate::infra::db::Database;
use crate::infra::error::Result;

/// 清理循环
pub struct Cleaner {
    outbox: Arc<OutboxPersister>,
    trigger: Arc<Notify>,
    interval: Duration,
}

impl Cleaner {
    pub fn new(outbox: Arc<OutboxPersister>, trigger: Arc<Notify>, interval: Duration) -> Self {
        Self {
            outbox,
            trigger,
            interval,
        }
    }

    /// 执行一轮清理
    pub async fn tick(&self, db: &Database, sender: &dyn MessageSender) -> Result<AdvanceOutcome> {
        if !self.outbox.cached_state().await.is_initialized() {
            let state = self.outbox.initialize(db, sender).await?;
            return Ok(AdvanceOutcome::Unchanged(state));
        }
        self.outbox.try_advance(db, sender).await
    }

    /// 启动后台循环
    pub fn spawn(
        self,
        db: Database,
        sender: Arc<dyn MessageSender>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let link = self.outbox.key().to_string();
            info!(link = %link, interval_ms = self.interval.as_millis() as u64, "清理循环已启动");

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = self.trigger.notified() => debug!(link = %link, "水位线触发清理"),
                    _ = tokio::time::sleep(self.interval) => {}
                }

                match self.tick(&db, sender.as_ref()).await {
                    Ok(AdvanceOutcome::Advanced(state)) => {
                        debug!(link = %link, epoch = state.epoch, "清理完成，epoch 已推进");
                    }
                    Ok(AdvanceOutcome::Superseded(state)) => {
                        debug!(link = %link, epoch = state.epoch, "epoch 已由其他进程推进");
                    }
                    Ok(AdvanceOutcome::Unchanged(_)) => {}
                    Err(e) => warn!(link = %link, error = %e, "清理失败，下一轮重试"),
                }
            }

            info!(link = %link, "清理循环已停止");
        })
    }
}
