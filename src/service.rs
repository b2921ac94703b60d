//! 服务模块
//!
//! 负责路由器节点的完整生命周期管理：打开数据库、创建链路、
//! 启动分发循环和清理循环，以及处理入站消息和本地发送。

use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channels::traits::InboundHandler;
use crate::core::dedup::cleaner::Cleaner;
use crate::core::dedup::dispatcher::Dispatcher;
use crate::core::dedup::report::{self, LinkReport};
use crate::core::dedup::{
    ForwardContext, InboundDeduplication, InboxCollection, OutboxCollection, ReceiveOutcome,
};
use crate::core::message::sender::MessageSender;
use crate::core::message::types::{InboundMessage, RouterMessage};
use crate::core::routing::{ForwardPipeline, StaticRoutePipeline};
use crate::infra::config::Config;
use crate::infra::db::Database;
use crate::infra::error::{Error, Result};

/// 服务状态
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceStatus {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// 路由器服务
#[derive(Clone)]
pub struct RouterService {
    config: Arc<Config>,
    db: Database,
    outboxes: OutboxCollection,
    hook: InboundDeduplication,
    dispatcher: Dispatcher,
    sender: Arc<dyn MessageSender>,
    pipeline: Arc<dyn ForwardPipeline>,
    status: Arc<RwLock<ServiceStatus>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RouterService {
    /// 创建服务
    ///
    /// # 参数说明
    /// * `config` - 已校验的配置
    /// * `sender` - 传输层发送器
    ///
    /// # 返回值
    /// 使用配置中 `[[routes]]` 静态路由表的服务
    pub async fn new(config: Config, sender: Arc<dyn MessageSender>) -> Result<Self> {
        config.validate()?;
        let db = Database::new_with_pool(&config.router.db_path, config.router.max_connections).await?;

        let dedup = &config.deduplication;
        let outboxes = OutboxCollection::new(&config.router.name, &dedup.outbound, dedup.epoch_size);
        let inboxes = InboxCollection::new(&config.router.name);
        let hook = InboundDeduplication::new(db.clone(), inboxes, dedup.inbound_interfaces.clone());
        let pipeline: Arc<dyn ForwardPipeline> = Arc::new(StaticRoutePipeline::from_config(&config.routes));
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            router = %config.router.name,
            outbound_links = outboxes.len(),
            inbound_interfaces = dedup.inbound_interfaces.len(),
            epoch_size = dedup.epoch_size,
            "路由器服务已创建"
        );

        Ok(Self {
            dispatcher: Dispatcher::new(dedup.dispatcher_concurrency),
            config: Arc::new(config),
            db,
            outboxes,
            hook,
            sender,
            pipeline,
            status: Arc::new(RwLock::new(ServiceStatus::Initializing)),
            shutdown_tx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.router.name
    }

    /// 订阅停止信号
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// 启动服务
    ///
    /// 初始化所有出站链路并通知对端，然后启动分发循环和每条链路的清理循环。
    /// 启动时对端不可达不会导致失败，清理循环会继续重试初始化
    pub async fn start(&self) -> Result<()> {
        info!(router = %self.name(), "开始启动服务...");

        for link in self.outboxes.links() {
            if let Err(e) = link.persister.initialize(&self.db, self.sender.as_ref()).await {
                warn!(link = %link.persister.key(), error = %e, "出站链路初始化失败，由清理循环重试");
            }
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(
            self.dispatcher
                .start(
                    self.db.clone(),
                    self.outboxes.clone(),
                    self.sender.clone(),
                    self.shutdown_tx.subscribe(),
                )
                .await?,
        );

        let interval = self.config.deduplication.cleaner_interval();
        for link in self.outboxes.links() {
            let cleaner = Cleaner::new(link.persister.clone(), link.trigger.clone(), interval);
            tasks.push(cleaner.spawn(self.db.clone(), self.sender.clone(), self.shutdown_tx.subscribe()));
        }

        *self.status.write().await = ServiceStatus::Running;
        info!(router = %self.name(), background_tasks = tasks.len(), "服务已启动");
        Ok(())
    }

    /// 停止服务并等待后台任务结束
    pub async fn stop(&self) {
        info!(router = %self.name(), "正在停止服务...");
        *self.status.write().await = ServiceStatus::Stopping;

        let _ = self.shutdown_tx.send(());
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "后台任务异常退出");
            }
        }

        *self.status.write().await = ServiceStatus::Stopped;
        info!(router = %self.name(), "服务已停止");
    }

    pub async fn status(&self) -> ServiceStatus {
        self.status.read().await.clone()
    }

    /// 处理一条入站消息
    ///
    /// 去重记录、路由管道产生的出站消息在同一事务内提交；
    /// 结果为 RetryLater 或出错时整个事务回滚
    pub async fn receive(&self, message: InboundMessage) -> Result<ReceiveOutcome> {
        let message_id = message.message.id.clone();
        let interface = message.interface.clone();
        let mut ctx = ForwardContext::begin(&self.db, Some(message), self.outboxes.clone()).await?;

        match self.hook.invoke(&mut ctx, self.pipeline.as_ref()).await {
            Ok(ReceiveOutcome::RetryLater) | Err(Error::RetryLater(_)) => {
                ctx.rollback().await?;
                debug!(interface = %interface, message_id = %message_id, "入站消息稍后重试");
                Ok(ReceiveOutcome::RetryLater)
            }
            Ok(outcome) => {
                ctx.commit(&self.dispatcher, self.sender.as_ref()).await?;
                debug!(interface = %interface, message_id = %message_id, ?outcome, "入站消息已处理");
                Ok(outcome)
            }
            Err(e) => {
                ctx.rollback().await?;
                Err(e)
            }
        }
    }

    /// 本地发起一次发送
    ///
    /// # 错误
    /// 出站窗口暂时无法接收时返回 `Error::RetryLater`
    pub async fn send(&self, destination: &str, message: RouterMessage) -> Result<()> {
        let mut ctx = ForwardContext::begin(&self.db, None, self.outboxes.clone()).await?;
        if let Err(e) = ctx.send(destination, message).await {
            ctx.rollback().await?;
            return Err(e);
        }
        ctx.commit(&self.dispatcher, self.sender.as_ref()).await
    }

    /// 所有链路的状态报告
    pub async fn link_report(&self) -> Result<Vec<LinkReport>> {
        report::link_report(&self.db).await
    }
}

#[async_trait::async_trait]
impl InboundHandler for RouterService {
    async fn handle(&self, message: InboundMessage) -> Result<ReceiveOutcome> {
        self.receive(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::{ConfigLoader, RouteSection};
    use async_trait::async_trait;
    use crate::core::message::types::OutboundMessage;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl MessageSender for Recording {
        async fn send(&self, message: OutboundMessage) -> Result<()> {
            self.sent.lock().await.push(message);
            Ok(())
        }
    }

    fn config(dir: &tempfile::TempDir) -> Config {
        let mut config = ConfigLoader::new().parse("").unwrap();
        config.router.name = "a".to_string();
        config.router.db_path = dir.path().join("a.db").to_string_lossy().to_string();
        config.deduplication.epoch_size = 4;
        config.deduplication.outbound = vec!["b".to_string()];
        config.routes = vec![RouteSection {
            interface: "local".to_string(),
            destinations: vec!["b".to_string(), "log".to_string()],
        }];
        config
    }

    #[tokio::test]
    async fn test_lifecycle_and_local_send() {
        let dir = tempfile::tempdir().unwrap();
        let sender = Arc::new(Recording::default());
        let service = RouterService::new(config(&dir), sender.clone()).await.unwrap();
        assert_eq!(service.status().await, ServiceStatus::Initializing);

        service.start().await.unwrap();
        assert_eq!(service.status().await, ServiceStatus::Running);

        service
            .send("b", RouterMessage::with_id("m1", b"hello".to_vec()))
            .await
            .unwrap();
        let outcome = service
            .receive(InboundMessage::new("local", RouterMessage::with_id("m2", Vec::new())))
            .await
            .unwrap();
        assert_eq!(outcome, ReceiveOutcome::Forwarded);

        service.stop().await;
        assert_eq!(service.status().await, ServiceStatus::Stopped);

        let sent = sender.sent.lock().await;
        // Initialize 通知、两条发往 b 的消息、一条发往 log 的消息
        assert_eq!(sent.len(), 4);
        let mut to_b: Vec<_> = sent
            .iter()
            .filter(|m| m.destination == "b")
            .filter_map(|m| m.message.header("sequence-number").map(|seq| (seq.to_string(), m.message.id.clone())))
            .collect();
        to_b.sort();
        assert_eq!(
            to_b,
            vec![("0".to_string(), "m1".to_string()), ("1".to_string(), "m2".to_string())]
        );
        let to_log = sent.iter().find(|m| m.destination == "log").unwrap();
        assert!(!to_log.message.has_header("sequence-number"));

        let report = service.link_report().await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].side, "outbox");
        assert!(report[0].announced);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.deduplication.epoch_size = 0;
        let sender = Arc::new(Recording::default());
        assert!(matches!(
            RouterService::new(config, sender).await,
            Err(Error::Config(_))
        ));
    }
}
