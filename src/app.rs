use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::inbound::InboundManager;
use crate::outbound::{build_outbound, OutboundManager};
use crate::routing::RuleRouter;
use crate::stats::StatsManager;

/// 由配置组装的完整实例：出站、路由、分发器和所有入站
pub struct App {
    stats: StatsManager,
    dispatcher: Arc<Dispatcher>,
    inbounds: InboundManager,
}

impl App {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let outbounds = Arc::new(OutboundManager::new());
        for outbound in &config.outbounds {
            outbounds.add_handler(build_outbound(outbound));
        }
        if let Some(ref tag) = config.routing.default_outbound {
            let handler = outbounds
                .get_handler(tag)
                .ok_or_else(|| DispatchError::config_error(format!("unknown default outbound '{}'", tag)))?;
            outbounds.set_default_handler(handler);
        }

        let stats = StatsManager::new();
        let router = Arc::new(RuleRouter::new(config.routing.rules.clone()));
        let dispatcher = Arc::new(Dispatcher::new(outbounds, router, stats.clone()));
        let inbounds = InboundManager::from_configs(&config.inbounds, dispatcher.clone(), &stats)?;

        Ok(Self {
            stats,
            dispatcher,
            inbounds,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.inbounds.start_all().await?;
        info!(
            "Dispatching with {} inbound(s) and outbound(s) {:?}",
            self.inbounds.len(),
            self.dispatcher.outbounds().tags()
        );
        Ok(())
    }

    pub async fn close(&self) {
        self.inbounds.close_all().await;
        info!("All inbounds closed");
    }

    pub fn stats(&self) -> &StatsManager {
        &self.stats
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn inbounds(&self) -> &InboundManager {
        &self.inbounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::OutboundHandler;

    const CONFIG: &str = r#"
        [[inbounds]]
        listen = "127.0.0.1"
        port_range = "10000-10001"
        destination = "tcp:127.0.0.1:80"

        [[outbounds]]
        tag = "direct"
        protocol = "direct"

        [[outbounds]]
        tag = "block"
        protocol = "block"

        [routing]
        default_outbound = "block"
    "#;

    #[test]
    fn test_from_config() {
        let config = AppConfig::from_toml_str(CONFIG).unwrap();
        let app = App::from_config(&config).unwrap();

        assert_eq!(app.inbounds().tags(), vec!["inbound-0"]);
        let default = app.dispatcher().outbounds().get_default_handler().unwrap();
        assert_eq!(default.tag(), "block");
        assert!(app.stats().get_inbound_stats("inbound-0").is_some());
    }

    #[test]
    fn test_first_outbound_is_default() {
        let mut config = AppConfig::from_toml_str(CONFIG).unwrap();
        config.routing.default_outbound = None;
        let app = App::from_config(&config).unwrap();
        let default = app.dispatcher().outbounds().get_default_handler().unwrap();
        assert_eq!(default.tag(), "direct");
    }
}
