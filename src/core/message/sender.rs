use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use async_trait::async_trait;
use crate::infra::error::Result;
use super::types::OutboundMessage;

/// 消息发送器 Trait
///
/// 把消息推回传输层真正发出去（"恢复后转发"回调）。
/// 去重核心通过它发送捕获的操作、控制消息和 Plug 消息。
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// 发送消息
    ///
    /// # 参数说明
    /// * `message` - 出站消息
    async fn send(&self, message: OutboundMessage) -> Result<()>;
}

/// 统一消息发送器
///
/// 负责根据目标名称将消息路由到对应接口的发送器
#[derive(Clone, Default)]
pub struct UnifiedMessageSender {
    senders: Arc<RwLock<HashMap<String, Arc<dyn MessageSender>>>>,
    fallback: Arc<RwLock<Option<Arc<dyn MessageSender>>>>,
}

impl UnifiedMessageSender {
    /// 创建新的统一发送器
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册某个目标的发送器
    pub async fn register(&self, destination: &str, sender: Arc<dyn MessageSender>) {
        let mut senders = self.senders.write().await;
        senders.insert(destination.to_string(), sender);
    }

    /// 设置默认发送器（目标未单独注册时使用）
    pub async fn set_fallback(&self, sender: Arc<dyn MessageSender>) {
        *self.fallback.write().await = Some(sender);
    }
}

#[async_trait]
impl MessageSender for UnifiedMessageSender {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let sender = {
            let senders = self.senders.read().await;
            match senders.get(&message.destination) {
                Some(sender) => Some(sender.clone()),
                None => self.fallback.read().await.clone(),
            }
        };

        match sender {
            Some(sender) => sender.send(message).await,
            None => Err(crate::infra::error::Error::Transport(format!(
                "未找到目标 '{}' 的发送器",
                message.destination
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::types::RouterMessage;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageSender for Recording {
        async fn send(&self, message: OutboundMessage) -> Result<()> {
            self.sent.lock().unwrap().push(message.destination);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_routes_by_destination_and_fallback() {
        let unified = UnifiedMessageSender::new();
        let specific = Arc::new(Recording::default());
        let fallback = Arc::new(Recording::default());

        unified.register("router-b", specific.clone()).await;
        assert!(unified
            .send(OutboundMessage::new("router-c", RouterMessage::new(Vec::new())))
            .await
            .is_err());

        unified.set_fallback(fallback.clone()).await;
        unified
            .send(OutboundMessage::new("router-b", RouterMessage::new(Vec::new())))
            .await
            .unwrap();
        unified
            .send(OutboundMessage::new("router-c", RouterMessage::new(Vec::new())))
            .await
            .unwrap();

        assert_eq!(*specific.sent.lock().unwrap(), vec!["router-b".to_string()]);
        assert_eq!(*fallback.sent.lock().unwrap(), vec!["router-c".to_string()]);
    }
}
