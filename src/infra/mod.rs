//! 基础设施模块
//!
//! 提供底层支持功能，包括：
//! - config/：配置管理系统
//! - db/：数据库层
//! - logging/：日志系统
//! - error/：错误处理

pub mod config;
pub mod db;
pub mod logging;
pub mod error;
