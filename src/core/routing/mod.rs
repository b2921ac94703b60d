//! 消息路由模块
//!
//! 本模块负责决定入站消息转发到哪些目标。

pub mod engine;

// 重新导出常用类型
pub use engine::{ForwardPipeline, RouteRule, StaticRoutePipeline, ANY_INTERFACE};
