//! 消息类型定义模块
//!
//! 定义路由器转发的消息结构体，包括：
//! - 路由消息（ID、头部、消息体）
//! - 入站消息（从某个接口收到的消息）
//! - 出站消息（发往某个目标的消息）
//!
//! # 使用示例
//! ```rust,ignore
//! let message = RouterMessage::new(b"hello".to_vec())
//!     .with_header("content-type", "text/plain");
//! let inbound = InboundMessage::new("memory", message);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 消息头部
///
/// 使用有序映射，保证序列化结果稳定
pub type Headers = BTreeMap<String, String>;

/// 路由消息
///
/// 路由器在各接口之间转发的最小单元
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterMessage {
    /// 消息唯一 ID
    pub id: String,
    /// 消息头部
    pub headers: Headers,
    /// 消息体
    pub body: Vec<u8>,
}

impl RouterMessage {
    /// 创建带随机 ID 的消息
    pub fn new(body: Vec<u8>) -> Self {
        Self::with_id(&Uuid::new_v4().to_string(), body)
    }

    /// 使用指定 ID 创建消息
    pub fn with_id(id: &str, body: Vec<u8>) -> Self {
        Self {
            id: id.to_string(),
            headers: Headers::new(),
            body,
        }
    }

    /// 设置头部（构建器风格）
    pub fn with_header(mut self, key: &str, value: impl ToString) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    /// 读取头部
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// 是否包含头部
    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }
}

/// 入站消息
///
/// 从某个传输接口收到的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// 接收接口名称
    pub interface: String,
    /// 消息本体
    pub message: RouterMessage,
    /// 接收时间
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// 创建入站消息
    pub fn new(interface: &str, message: RouterMessage) -> Self {
        Self {
            interface: interface.to_string(),
            message,
            received_at: Utc::now(),
        }
    }
}

/// 出站消息
///
/// 发往某个目标（路由器或端点）的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// 目标名称
    pub destination: String,
    /// 消息本体
    pub message: RouterMessage,
}

impl OutboundMessage {
    /// 创建出站消息
    pub fn new(destination: &str, message: RouterMessage) -> Self {
        Self {
            destination: destination.to_string(),
            message,
        }
    }
}
