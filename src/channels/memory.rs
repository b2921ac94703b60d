//! 内存传输模块
//!
//! 进程内的至少一次投递传输，供二进制和集成测试使用。
//!
//! # 功能
//! 1. 按名称注册端点，发往端点的消息进入其无界队列
//! 2. 处理器返回 RetryLater 或可重试错误时，延迟后重新投递
//! 3. 不可重试的错误进入死信列表
//! 4. 可对指定端点注入重复投递，模拟至少一次语义
//!
//! # 使用示例
//! ```rust,ignore
//! let hub = MemoryHub::new(MemoryHubConfig::default());
//! let endpoint = hub.register("router-b");
//! endpoint.serve(handler, shutdown_rx);
//! ```

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::traits::{DeliveryAction, InboundHandler, MessageSender};
use crate::core::message::types::{InboundMessage, OutboundMessage, RouterMessage};
use crate::infra::error::{Error, Result};

/// 内存传输的接口名称
pub const INTERFACE: &str = "memory";

/// 内存传输配置
#[derive(Debug, Clone)]
pub struct MemoryHubConfig {
    /// 重新投递前的等待时间
    pub redelivery_delay: Duration,
}

impl Default for MemoryHubConfig {
    fn default() -> Self {
        Self {
            redelivery_delay: Duration::from_millis(50),
        }
    }
}

/// 死信
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub endpoint: String,
    pub message: RouterMessage,
    pub reason: String,
}

/// 内存消息中心
pub struct MemoryHub {
    config: MemoryHubConfig,
    endpoints: DashMap<String, mpsc::UnboundedSender<RouterMessage>>,
    duplicate_targets: DashSet<String>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryHub {
    pub fn new(config: MemoryHubConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            endpoints: DashMap::new(),
            duplicate_targets: DashSet::new(),
            dead_letters: Mutex::new(Vec::new()),
        })
    }

    /// 注册端点，同名端点会被替换
    pub fn register(self: &Arc<Self>, name: &str) -> MemoryEndpoint {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.endpoints.insert(name.to_string(), sender);
        debug!(endpoint = name, "内存端点已注册");
        MemoryEndpoint {
            name: name.to_string(),
            receiver,
            hub: self.clone(),
        }
    }

    /// 之后发往该端点的每条消息都投递两次
    pub fn duplicate_deliveries_to(&self, name: &str) {
        self.duplicate_targets.insert(name.to_string());
    }

    /// 已进入死信的消息
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().await.clone()
    }

    fn deliver(&self, endpoint: &str, message: RouterMessage) -> Result<()> {
        let sender = self
            .endpoints
            .get(endpoint)
            .ok_or_else(|| Error::Transport(format!("内存端点不存在: {}", endpoint)))?;
        sender
            .send(message)
            .map_err(|_| Error::Transport(format!("内存端点已关闭: {}", endpoint)))
    }

    async fn dead_letter(&self, endpoint: &str, message: RouterMessage, reason: String) {
        warn!(endpoint, message_id = %message.id, reason = %reason, "消息进入死信");
        self.dead_letters.lock().await.push(DeadLetter {
            endpoint: endpoint.to_string(),
            message,
            reason,
        });
    }
}

#[async_trait]
impl MessageSender for MemoryHub {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let OutboundMessage {
            destination,
            message,
        } = message;

        if self.duplicate_targets.contains(&destination) {
            self.deliver(&destination, message.clone())?;
        }
        self.deliver(&destination, message)
    }
}

/// 内存端点
pub struct MemoryEndpoint {
    name: String,
    receiver: mpsc::UnboundedReceiver<RouterMessage>,
    hub: Arc<MemoryHub>,
}

impl MemoryEndpoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 直接读取下一条消息（不经过处理器）
    pub async fn recv(&mut self) -> Option<RouterMessage> {
        self.receiver.recv().await
    }

    /// 启动接收循环，逐条交给处理器
    pub fn serve(
        mut self,
        handler: Arc<dyn InboundHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(endpoint = %self.name, "内存端点开始接收");
            loop {
                let message = tokio::select! {
                    _ = shutdown.recv() => break,
                    message = self.receiver.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let result = handler
                    .handle(InboundMessage::new(INTERFACE, message.clone()))
                    .await;
                match DeliveryAction::from_result(&result) {
                    DeliveryAction::Ack => {}
                    DeliveryAction::Redeliver => self.redeliver_later(message),
                    DeliveryAction::DeadLetter(reason) => {
                        self.hub.dead_letter(&self.name, message, reason).await;
                    }
                }
            }
            info!(endpoint = %self.name, "内存端点已停止接收");
        })
    }

    fn redeliver_later(&self, message: RouterMessage) {
        let hub = self.hub.clone();
        let name = self.name.clone();
        let delay = hub.config.redelivery_delay;
        debug!(endpoint = %name, message_id = %message.id, "稍后重新投递");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = hub.deliver(&name, message) {
                debug!(endpoint = %name, error = %e, "重新投递失败");
            }
        });
    }
}
