//! 核心运行时模块
//!
//! 路由器的"大脑"，负责消息类型、路由决策和链路去重
//!
//! # 模块结构
//! - `message/` - 消息类型与发送器
//! - `routing/` - 消息路由（决定消息转发到哪些目标）
//! - `dedup/` - 链路去重（恰好一次转发）

pub mod message;
pub mod routing;
pub mod dedup;
