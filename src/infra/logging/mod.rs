//! 日志系统模块
//!
//! 本模块提供了统一的日志记录功能，使用 `tracing` 库实现。

use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use super::error::{Error, Result};

/// 日志级别
///
/// 从低到高：Trace < Debug < Info < Warn < Error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// 最详细的日志级别（调试用）
    Trace,
    /// 调试信息
    Debug,
    /// 一般信息
    Info,
    /// 警告
    Warn,
    /// 错误
    Error,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(Error::Config(format!("未知日志级别: {}", other))),
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// 日志格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// 默认格式（人类可读）
    Default,
    /// JSON 格式（机器可读）
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" | "text" | "pretty" => Ok(LogFormat::Default),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::Config(format!("未知日志格式: {}", other))),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: LogLevel,
    /// 日志格式
    pub format: LogFormat,
    /// 是否输出到文件
    pub file: bool,
    /// 日志文件路径
    pub file_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Default,
            file: false,
            file_path: PathBuf::from("clawrouter.log"),
        }
    }
}

impl LoggingConfig {
    /// 从配置文件中的日志段构建
    ///
    /// 无法识别的级别或格式回退到默认值
    pub fn from_section(section: &super::config::LoggingSection) -> Self {
        let mut config = Self::default();
        if let Some(level) = section.level.as_deref() {
            config.level = level.parse().unwrap_or(LogLevel::Info);
        }
        if let Some(format) = section.format.as_deref() {
            config.format = format.parse().unwrap_or(LogFormat::Default);
        }
        if let Some(path) = &section.file_path {
            config.file = true;
            config.file_path = path.clone();
        }
        config
    }
}

/// 初始化日志系统
///
/// `RUST_LOG` 环境变量存在时优先于配置中的级别。
/// 开启文件输出时日志追加写入 `file_path`。
///
/// # 参数说明
/// * `config` - 日志配置
///
/// # 错误
/// 全局 subscriber 已设置或日志文件无法打开时返回错误
pub fn init(config: &LoggingConfig) -> Result<()> {
    let level: Level = config.level.into();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if config.file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.file_path)?;
        let writer = std::sync::Mutex::new(file);
        match config.format {
            LogFormat::Json => builder.json().with_writer(writer).try_init(),
            LogFormat::Default => builder.with_ansi(false).with_writer(writer).try_init(),
        }
    } else {
        match config.format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Default => builder.try_init(),
        }
    };

    result.map_err(|e| Error::Config(format!("设置全局日志 subscriber 失败: {}", e)))?;

    info!(level = ?config.level, format = ?config.format, "日志系统初始化完成");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_and_format() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    }

    #[test]
    fn test_from_section_falls_back_to_defaults() {
        let section = super::super::config::LoggingSection {
            level: Some("nonsense".to_string()),
            format: Some("json".to_string()),
            file_path: None,
        };
        let config = LoggingConfig::from_section(&section);
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.file);
    }
}
