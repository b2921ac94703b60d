//! 分发循环
//!
//! 事务提交后，捕获的出站操作进入分发队列，由有并发上限的任务池真正发出。
//! 发送成功后把窗口表中的行标记为已分发；失败只记录日志，
//! 未分发的行会在 epoch 推进前由清理循环重新分发。

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::collections::OutboxCollection;
use super::outbox::CapturedOperation;
use crate::core::message::sender::MessageSender;
use crate::core::message::types::OutboundMessage;
use crate::infra::db::Database;
use crate::infra::error::{Error, Result};

/// 分发队列容量
const QUEUE_CAPACITY: usize = 1024;

/// 分发器
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::Sender<CapturedOperation>,
    receiver: Arc<Mutex<Option<mpsc::Receiver<CapturedOperation>>>>,
    concurrency: usize,
}

impl Dispatcher {
    /// 创建分发器
    ///
    /// # 参数说明
    /// * `concurrency` - 同时进行的发送数上限
    pub fn new(concurrency: usize) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            concurrency: concurrency.max(1),
        }
    }

    /// 把已提交的操作放入分发队列
    pub async fn enqueue(&self, operation: CapturedOperation) -> Result<()> {
        self.sender
            .send(operation)
            .await
            .map_err(|e| Error::Transport(format!("分发队列已关闭: 序号 {}", e.0.seq)))
    }

    /// 启动分发循环
    ///
    /// 收到停止信号后不再接收新操作，队列中剩余的操作照常发出，
    /// 所有发送任务结束后循环退出
    pub async fn start(
        &self,
        db: Database,
        outboxes: OutboxCollection,
        sender: Arc<dyn MessageSender>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>> {
        let mut receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Unknown("分发循环已在运行".to_string()))?;
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let concurrency = self.concurrency;

        let handle = tokio::spawn(async move {
            info!(concurrency, "分发循环已启动");
            let mut tasks = JoinSet::new();

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                    operation = receiver.recv() => {
                        let Some(operation) = operation else { break };
                        let Ok(permit) = permits.clone().acquire_owned().await else { break };
                        let db = db.clone();
                        let outboxes = outboxes.clone();
                        let sender = sender.clone();
                        tasks.spawn(async move {
                            dispatch_one(&db, &outboxes, sender.as_ref(), operation).await;
                            drop(permit);
                        });
                    }
                }
            }

            receiver.close();
            let mut drained = 0usize;
            while let Some(operation) = receiver.recv().await {
                dispatch_one(&db, &outboxes, sender.as_ref(), operation).await;
                drained += 1;
            }
            while tasks.join_next().await.is_some() {}
            info!(drained, "分发循环已停止");
        });

        Ok(handle)
    }
}

async fn dispatch_one(
    db: &Database,
    outboxes: &OutboxCollection,
    sender: &dyn MessageSender,
    operation: CapturedOperation,
) {
    let CapturedOperation {
        destination,
        table,
        seq,
        message,
    } = operation;
    let message_id = message.id.clone();

    if let Err(e) = sender.send(OutboundMessage::new(&destination, message)).await {
        warn!(destination = %destination, seq, message_id = %message_id, error = %e, "分发失败，等待清理循环重新分发");
        return;
    }

    let Some(link) = outboxes.get(&destination) else {
        warn!(destination = %destination, seq, "目标没有出站链路，无法标记已分发");
        return;
    };
    match link.persister.mark_dispatched(db, &table, seq).await {
        Ok(()) => debug!(destination = %destination, seq, "已分发"),
        Err(e) => warn!(destination = %destination, seq, error = %e, "标记已分发失败"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dedup::outbox::StoreOutcome;
    use crate::core::dedup::window;
    use crate::core::message::types::RouterMessage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl MessageSender for Counting {
        async fn send(&self, _message: OutboundMessage) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_marks_rows_and_drains_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("dispatch.db").to_str().unwrap())
            .await
            .unwrap();
        let outboxes = OutboxCollection::new("a", &["b".to_string()], 10);
        let sender = Arc::new(Counting::default());
        let link = outboxes.get("b").unwrap();
        link.persister.initialize(&db, sender.as_ref()).await.unwrap();

        let dispatcher = Dispatcher::new(2);
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = dispatcher
            .start(db.clone(), outboxes.clone(), sender.clone(), shutdown_tx.subscribe())
            .await
            .unwrap();
        assert!(dispatcher
            .start(db.clone(), outboxes.clone(), sender.clone(), shutdown_tx.subscribe())
            .await
            .is_err());

        for i in 0..5 {
            let mut tx = db.begin().await.unwrap();
            let outcome = link
                .persister
                .store(&mut tx, RouterMessage::with_id(&format!("m{}", i), Vec::new()), &|| {})
                .await
                .unwrap();
            tx.commit().await.unwrap();
            match outcome {
                StoreOutcome::Stored(op) => dispatcher.enqueue(op).await.unwrap(),
                StoreOutcome::RetryLater(reason) => panic!("unexpected retry: {}", reason),
            }
        }

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        // Initialize 通知 + 5 条消息
        assert_eq!(sender.sent.load(Ordering::SeqCst), 6);
        let state = link.persister.cached_state().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let entries = window::entries_in_range(&mut conn, &state.tail.table, 0, 5)
            .await
            .unwrap();
        assert_eq!(entries.len(), 5);
        assert!(entries.iter().all(|e| e.dispatched));
    }
}
