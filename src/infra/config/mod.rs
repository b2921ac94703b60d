//! 配置管理系统模块
//!
//! 本模块负责加载和管理路由器配置。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};

use super::error::{Error, Result};

/// 主配置结构
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// 路由器节点配置
    #[serde(default)]
    pub router: RouterSection,
    /// 链路去重配置
    #[serde(default)]
    pub deduplication: DeduplicationSection,
    /// 静态路由表
    #[serde(default)]
    pub routes: Vec<RouteSection>,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingSection,
}

/// 路由器节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    /// 节点名称，同时作为出站链路的源键（sequence-key）
    pub name: String,
    /// 数据库路径
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// 数据库最大连接数
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> String {
    "data/clawrouter.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            name: "router".to_string(),
            db_path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// 链路去重配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationSection {
    /// 窗口宽度（每个 epoch 的序号数）
    #[serde(default = "default_epoch_size")]
    pub epoch_size: i64,
    /// 分发池最大并发数
    #[serde(default = "default_dispatcher_concurrency")]
    pub dispatcher_concurrency: usize,
    /// 清理循环轮询间隔（毫秒）
    #[serde(default = "default_cleaner_interval_ms")]
    pub cleaner_interval_ms: u64,
    /// 启用去重的出站目标
    #[serde(default)]
    pub outbound: Vec<String>,
    /// 启用去重的入站接口
    #[serde(default)]
    pub inbound_interfaces: Vec<String>,
}

fn default_epoch_size() -> i64 {
    1000
}

fn default_dispatcher_concurrency() -> usize {
    16
}

fn default_cleaner_interval_ms() -> u64 {
    5000
}

impl Default for DeduplicationSection {
    fn default() -> Self {
        Self {
            epoch_size: default_epoch_size(),
            dispatcher_concurrency: default_dispatcher_concurrency(),
            cleaner_interval_ms: default_cleaner_interval_ms(),
            outbound: Vec::new(),
            inbound_interfaces: Vec::new(),
        }
    }
}

impl DeduplicationSection {
    /// 清理循环轮询间隔
    pub fn cleaner_interval(&self) -> Duration {
        Duration::from_millis(self.cleaner_interval_ms)
    }

    /// 出站目标是否启用去重
    pub fn is_outbound_enabled(&self, destination: &str) -> bool {
        self.outbound.iter().any(|d| d == destination)
    }

    /// 入站接口是否启用去重
    pub fn is_inbound_enabled(&self, interface: &str) -> bool {
        self.inbound_interfaces.iter().any(|i| i == interface)
    }
}

/// 静态路由：某个接口收到的消息转发到哪些目标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSection {
    /// 入站接口名称
    pub interface: String,
    /// 转发目标列表
    pub destinations: Vec<String>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSection {
    /// 日志级别
    pub level: Option<String>,
    /// 日志格式（default / json）
    pub format: Option<String>,
    /// 日志文件路径
    pub file_path: Option<PathBuf>,
}

impl Config {
    /// 校验配置
    ///
    /// # 错误
    /// 节点名为空、窗口宽度小于 1、分发并发数为 0 或连接数不足时返回配置错误
    pub fn validate(&self) -> Result<()> {
        if self.router.name.trim().is_empty() {
            return Err(Error::Config("router.name 不能为空".to_string()));
        }
        if self.deduplication.epoch_size < 1 {
            return Err(Error::Config(format!(
                "deduplication.epoch_size 必须大于 0，当前为 {}",
                self.deduplication.epoch_size
            )));
        }
        if self.deduplication.dispatcher_concurrency == 0 {
            return Err(Error::Config(
                "deduplication.dispatcher_concurrency 必须大于 0".to_string(),
            ));
        }
        // 清理循环在持有一个连接时还要再开一个事务
        if self.router.max_connections < 2 {
            return Err(Error::Config(format!(
                "router.max_connections 至少为 2，当前为 {}",
                self.router.max_connections
            )));
        }
        if let Some(d) = self.deduplication.outbound.iter().find(|d| *d == &self.router.name) {
            return Err(Error::Config(format!("出站去重目标不能是节点自身: {}", d)));
        }
        Ok(())
    }
}

/// 配置加载器
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// 创建新的配置加载器
    pub fn new() -> Self {
        Self
    }

    /// 加载配置
    ///
    /// 文件不存在时使用默认配置
    pub async fn load(&self, path: &str) -> Result<Config> {
        tracing::info!(path = path, "加载配置文件");

        if !PathBuf::from(path).exists() {
            tracing::warn!(path = path, "配置文件不存在，使用默认配置");
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("读取配置文件失败: {}", e)))?;

        let config = self.parse(&content)?;

        tracing::info!("配置加载成功");
        Ok(config)
    }

    /// 解析配置文本并替换环境变量
    pub fn parse(&self, content: &str) -> Result<Config> {
        let mut config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("解析配置文件失败: {}", e)))?;

        self.substitute_env_vars(&mut config)?;
        Ok(config)
    }

    /// 替换环境变量
    ///
    /// 将 `${VAR_NAME}` 格式的字符串替换为对应的环境变量值
    fn substitute_env_vars(&self, config: &mut Config) -> Result<()> {
        let re = regex::Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| Error::Config(format!("环境变量模式无效: {}", e)))?;

        config.router.name = Self::replace_env_vars(&re, &config.router.name);
        config.router.db_path = Self::replace_env_vars(&re, &config.router.db_path);

        for destination in &mut config.deduplication.outbound {
            *destination = Self::replace_env_vars(&re, destination);
        }

        Ok(())
    }

    /// 替换字符串中的环境变量，未设置的变量保持原样
    fn replace_env_vars(re: &regex::Regex, input: &str) -> String {
        let result = re.replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
        });

        result.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [router]
        name = "router-a"
        db_path = "${CLAWROUTER_TEST_DATA_DIR}/a.db"

        [deduplication]
        epoch_size = 50
        outbound = ["router-b"]
        inbound_interfaces = ["memory"]

        [[routes]]
        interface = "memory"
        destinations = ["router-b"]

        [logging]
        level = "debug"
    "#;

    #[test]
    fn test_parse_sample_config() {
        env::set_var("CLAWROUTER_TEST_DATA_DIR", "/tmp/clawrouter");
        let config = ConfigLoader::new().parse(SAMPLE).unwrap();

        assert_eq!(config.router.name, "router-a");
        assert_eq!(config.router.db_path, "/tmp/clawrouter/a.db");
        assert_eq!(config.deduplication.epoch_size, 50);
        assert_eq!(config.deduplication.dispatcher_concurrency, 16);
        assert!(config.deduplication.is_outbound_enabled("router-b"));
        assert!(!config.deduplication.is_outbound_enabled("router-c"));
        assert!(config.deduplication.is_inbound_enabled("memory"));
        assert_eq!(config.routes.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unset_env_var_is_kept() {
        let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
        let out = ConfigLoader::replace_env_vars(&re, "${CLAWROUTER_SURELY_UNSET_VAR}/x");
        assert_eq!(out, "${CLAWROUTER_SURELY_UNSET_VAR}/x");
    }

    #[test]
    fn test_validate_rejects_bad_epoch_size() {
        let mut config = Config::default();
        config.deduplication.epoch_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_self_destination() {
        let mut config = Config::default();
        config.deduplication.outbound = vec![config.router.name.clone()];
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let config = ConfigLoader::new()
            .load("/nonexistent/clawrouter.toml")
            .await
            .unwrap();
        assert_eq!(config.router.name, "router");
        assert_eq!(config.deduplication.epoch_size, 1000);
    }
}
