use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use super::{InboundHandler, InboundProxy};
use crate::config::InboundConfig;
use crate::dispatcher::Dispatch;
use crate::error::Result;
use crate::stats::StatsManager;

/// 管理所有配置的入站处理器
pub struct InboundManager {
    handlers: Vec<InboundHandler>,
}

impl InboundManager {
    /// 为每个入站配置创建处理器，未设置标签的入站按序号命名
    pub fn from_configs(configs: &[InboundConfig], dispatcher: Arc<dyn Dispatch>, stats: &StatsManager) -> Result<Self> {
        let mut handlers = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            let handler = if config.tag.is_empty() {
                let mut named = config.clone();
                named.tag = format!("inbound-{}", index);
                InboundHandler::from_config(&named, dispatcher.clone(), stats)?
            } else {
                InboundHandler::from_config(config, dispatcher.clone(), stats)?
            };
            handlers.push(handler);
        }
        Ok(Self { handlers })
    }

    /// 启动所有入站；任何一个失败时关闭已启动的入站
    pub async fn start_all(&self) -> Result<()> {
        for (index, handler) in self.handlers.iter().enumerate() {
            if let Err(e) = handler.start().await {
                warn!("Inbound [{}] failed to start: {}", handler.tag(), e);
                for started in &self.handlers[..index] {
                    started.close().await;
                }
                return Err(e);
            }
        }
        info!("Started {} inbound(s)", self.handlers.len());
        Ok(())
    }

    pub async fn close_all(&self) {
        join_all(self.handlers.iter().map(|h| h.close())).await;
    }

    pub fn get(&self, tag: &str) -> Option<&InboundHandler> {
        self.handlers.iter().find(|h| h.tag() == tag)
    }

    /// 从指定入站随机挑选一个 (入站协议, 端口)
    pub fn get_random_inbound_proxy(&self, tag: &str) -> Option<(Arc<dyn InboundProxy>, u16)> {
        self.get(tag)?.get_random_inbound_proxy()
    }

    pub fn tags(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.tag()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
