/// 路由能力
///
/// 分发器只消费 `Router` trait；具体的规则匹配由实现者提供。
/// 内置的 `RuleRouter` 只按入站标签和嗅探协议做精确匹配。
use async_trait::async_trait;
use tracing::trace;

use crate::config::RouteRule;
use crate::destination::Destination;
use crate::error::{DispatchError, Result};

/// 提供给路由器的单个流属性
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub inbound_tag: String,
    pub source: Option<Destination>,
    /// 目标地址（可能已被嗅探出的域名替换）
    pub target: Destination,
    /// 嗅探出的协议名称
    pub protocol: Option<String>,
}

/// 路由决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub outbound_tag: String,
    /// 经过的出站组（由外层到内层）
    pub group_trail: Vec<String>,
}

impl RoutingDecision {
    pub fn new(outbound_tag: impl Into<String>) -> Self {
        Self {
            outbound_tag: outbound_tag.into(),
            group_trail: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Router: Send + Sync {
    /// 返回 `DispatchError::NoClue` 表示没有决定，使用默认出站
    async fn pick_route(&self, ctx: &RoutingContext) -> Result<RoutingDecision>;
}

/// 按顺序匹配规则的路由器，第一条命中的规则生效
pub struct RuleRouter {
    rules: Vec<RouteRule>,
}

impl RuleRouter {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    fn matches(rule: &RouteRule, ctx: &RoutingContext) -> bool {
        if !rule.inbound_tags.is_empty() && !rule.inbound_tags.iter().any(|t| *t == ctx.inbound_tag) {
            return false;
        }
        if !rule.protocols.is_empty() {
            match &ctx.protocol {
                Some(p) => {
                    if !rule.protocols.iter().any(|r| r.name() == p.as_str()) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if !rule.networks.is_empty() && !rule.networks.contains(&ctx.target.network) {
            return false;
        }
        true
    }
}

#[async_trait]
impl Router for RuleRouter {
    async fn pick_route(&self, ctx: &RoutingContext) -> Result<RoutingDecision> {
        for (index, rule) in self.rules.iter().enumerate() {
            if Self::matches(rule, ctx) {
                trace!("Rule #{} matched {} -> {}", index, ctx.target, rule.outbound_tag);
                return Ok(RoutingDecision::new(rule.outbound_tag.clone()));
            }
        }
        Err(DispatchError::NoClue)
    }
}
