//! clawrouter 库入口
//!
//! 本模块导出所有公共 API。
//!
//! # 使用示例
//! ```rust,ignore
//! use clawrouter::infra::config::ConfigLoader;
//! use clawrouter::service::RouterService;
//!
//! let config = ConfigLoader::new().load("clawrouter.toml").await?;
//! let service = RouterService::new(config, sender).await?;
//! service.start().await?;
//! ```

/// 重新导出核心模块
pub mod core;
pub mod channels;
pub mod infra;
pub mod service;
