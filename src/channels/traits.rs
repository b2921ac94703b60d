//! 渠道 Trait 定义模块
//!
//! 定义传输层与路由器之间的统一接口。
//!
//! # 设计原则
//! 1. 使用 `async-trait` 支持异步方法
//! 2. 所有方法返回 `Result` 类型
//! 3. 传输层只保证至少一次投递，是否重投由接收结果决定

use crate::core::dedup::ReceiveOutcome;
use crate::core::message::types::InboundMessage;
use crate::infra::error::Result;

pub use crate::core::message::sender::MessageSender;

/// 入站处理器 Trait
///
/// 传输层把收到的每条消息交给处理器，处理器在一个事务内完成去重和转发
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
    /// 处理一条入站消息
    ///
    /// # 参数说明
    /// * `message` - 入站消息
    ///
    /// # 返回值
    /// 接收结果；返回错误时由 `DeliveryAction::from_result` 决定重投还是进入死信
    async fn handle(&self, message: InboundMessage) -> Result<ReceiveOutcome>;
}

/// 传输层对一次投递的处理方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryAction {
    /// 确认，不再投递
    Ack,
    /// 稍后重新投递
    Redeliver,
    /// 不可重试，进入死信
    DeadLetter(String),
}

impl DeliveryAction {
    pub fn from_result(result: &Result<ReceiveOutcome>) -> Self {
        match result {
            Ok(ReceiveOutcome::RetryLater) => DeliveryAction::Redeliver,
            Ok(_) => DeliveryAction::Ack,
            Err(e) if e.is_retryable() => DeliveryAction::Redeliver,
            Err(e) => DeliveryAction::DeadLetter(e.to_string()),
        }
    }
}
