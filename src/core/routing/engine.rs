//! 路由引擎模块
//!
//! 决定入站消息转发到哪些目标。去重子系统只通过 `ForwardPipeline` 与管道交互。

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::dedup::control;
use crate::core::dedup::hooks::ForwardContext;
use crate::infra::config::RouteSection;
use crate::infra::error::Result;

/// 转发管道 Trait
///
/// 入站去重挂钩确认消息首次到达后调用 `forward`，管道通过 `ctx.send`
/// 发出的消息与去重记录处于同一事务
#[async_trait::async_trait]
pub trait ForwardPipeline: Send + Sync {
    /// 转发当前上下文中的入站消息
    async fn forward(&self, ctx: &mut ForwardContext) -> Result<()>;
}

/// 通配所有接口
pub const ANY_INTERFACE: &str = "*";

/// 路由规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    /// 入站接口名称，`*` 匹配所有接口
    pub interface: String,
    /// 转发目标
    pub destinations: Vec<String>,
}

impl RouteRule {
    pub fn new(interface: &str, destinations: &[&str]) -> Self {
        Self {
            interface: interface.to_string(),
            destinations: destinations.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn matches(&self, interface: &str) -> bool {
        self.interface == ANY_INTERFACE || self.interface == interface
    }
}

impl From<&RouteSection> for RouteRule {
    fn from(section: &RouteSection) -> Self {
        Self {
            interface: section.interface.clone(),
            destinations: section.destinations.clone(),
        }
    }
}

/// 静态路由表管道
#[derive(Clone, Debug, Default)]
pub struct StaticRoutePipeline {
    rules: Arc<RwLock<Vec<RouteRule>>>,
}

impl StaticRoutePipeline {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self {
            rules: Arc::new(RwLock::new(rules)),
        }
    }

    /// 按配置文件中的 `[[routes]]` 创建
    pub fn from_config(routes: &[RouteSection]) -> Self {
        Self::new(routes.iter().map(RouteRule::from).collect())
    }

    pub async fn add_rule(&self, rule: RouteRule) {
        self.rules.write().await.push(rule);
    }

    pub async fn list_rules(&self) -> Vec<RouteRule> {
        self.rules.read().await.clone()
    }

    /// 某个接口的转发目标（去重，按名称排序）
    pub async fn destinations_for(&self, interface: &str) -> Vec<String> {
        let rules = self.rules.read().await;
        rules
            .iter()
            .filter(|rule| rule.matches(interface))
            .flat_map(|rule| rule.destinations.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[async_trait::async_trait]
impl ForwardPipeline for StaticRoutePipeline {
    async fn forward(&self, ctx: &mut ForwardContext) -> Result<()> {
        let Some(incoming) = ctx.incoming() else {
            return Ok(());
        };
        let interface = incoming.interface.clone();
        let mut message = incoming.message.clone();
        // 上一跳的链路头部只对上一跳有效
        control::strip(&mut message);

        let destinations = self.destinations_for(&interface).await;
        if destinations.is_empty() {
            debug!(interface = %interface, message_id = %message.id, "没有匹配的路由，消息被丢弃");
            return Ok(());
        }

        for destination in destinations {
            debug!(interface = %interface, destination = %destination, message_id = %message.id, "转发消息");
            ctx.send(&destination, message.clone()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_destinations_for_interface() {
        let pipeline = StaticRoutePipeline::new(vec![
            RouteRule::new("memory", &["sink", "audit"]),
            RouteRule::new(ANY_INTERFACE, &["audit"]),
            RouteRule::new("http", &["web"]),
        ]);

        assert_eq!(pipeline.destinations_for("memory").await, vec!["audit", "sink"]);
        assert_eq!(pipeline.destinations_for("ftp").await, vec!["audit"]);

        pipeline.add_rule(RouteRule::new("ftp", &["archive"])).await;
        assert_eq!(pipeline.destinations_for("ftp").await, vec!["archive", "audit"]);
        assert_eq!(pipeline.list_rules().await.len(), 4);
    }

    #[test]
    fn test_rule_from_config_section() {
        let section = RouteSection {
            interface: "memory".to_string(),
            destinations: vec!["sink".to_string()],
        };
        assert_eq!(RouteRule::from(&section), RouteRule::new("memory", &["sink"]));
    }
}
