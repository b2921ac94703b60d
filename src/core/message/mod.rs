//! 消息处理模块
//!
//! 本模块负责：
//! 1. 定义消息类型（路由消息、入站消息、出站消息）
//! 2. 定义消息发送器（把消息交还给传输层）
//!
//! # 消息处理流程
//! ```text
//! 收到消息 → 入站去重 → 路由管道 → 出站捕获 → 提交 → 分发
//! ```

pub mod types;      // 消息类型定义
pub mod sender;     // 消息发送器

// 重新导出常用类型
pub use types::{Headers, InboundMessage, OutboundMessage, RouterMessage};
pub use sender::{MessageSender, UnifiedMessageSender};
