use anyhow::{bail, Result};
use std::collections::HashSet;
use tracing::warn;

use super::{AllocationStrategy, AppConfig, InboundConfig, InboundProtocol, PortRange, RateLimitConfig};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证端口范围
    pub fn validate_port_range(range: &PortRange, context: &str) -> Result<()> {
        if range.from == 0 {
            bail!("{}: port cannot be 0", context);
        }
        if range.from > range.to {
            bail!(
                "{}: invalid port range {}-{} (from must not exceed to)",
                context,
                range.from,
                range.to
            );
        }
        Ok(())
    }

    /// 验证速率限制配置
    pub fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<()> {
        if config.requests_per_second == 0 {
            bail!("rate_limit.requests_per_second must be greater than 0");
        }
        if config.burst_size == 0 {
            bail!("rate_limit.burst_size must be greater than 0");
        }
        if config.burst_size < config.requests_per_second {
            warn!(
                "rate_limit.burst_size ({}) is less than requests_per_second ({}), \
                 this may cause frequent rate limiting",
                config.burst_size, config.requests_per_second
            );
        }
        Ok(())
    }

    /// 验证单个入站配置
    pub fn validate_inbound(inbound: &InboundConfig) -> Result<()> {
        let context = if inbound.tag.is_empty() {
            format!("Inbound on {}", inbound.listen)
        } else {
            format!("Inbound '{}'", inbound.tag)
        };

        Self::validate_address(&inbound.listen, &context)?;
        Self::validate_port_range(&inbound.port_range, &context)?;

        if inbound.network.is_empty() {
            bail!("{}: at least one network must be enabled", context);
        }

        if inbound.allocation.strategy == AllocationStrategy::Random {
            let allocation = &inbound.allocation;
            if allocation.concurrency == 0 {
                bail!("{}: allocation.concurrency must be at least 1", context);
            }
            if allocation.concurrency > inbound.port_range.len() {
                bail!(
                    "{}: allocation.concurrency ({}) exceeds the number of ports in {}",
                    context,
                    allocation.concurrency,
                    inbound.port_range
                );
            }
            if inbound.port_range.len() < allocation.concurrency * 2 {
                warn!(
                    "{}: port range {} is smaller than twice the concurrency; refreshes may keep fewer workers",
                    context, inbound.port_range
                );
            }
            if allocation.refresh_minutes == 0 {
                bail!("{}: allocation.refresh_minutes must be at least 1", context);
            }
        }

        match inbound.protocol {
            InboundProtocol::Forward => match &inbound.destination {
                Some(dest) if !dest.is_valid() => {
                    bail!("{}: invalid destination {}", context, dest)
                }
                None if !inbound.receive_original_destination => {
                    bail!(
                        "{}: forward inbound requires a destination or receive_original_destination",
                        context
                    )
                }
                _ => {}
            },
        }

        if let Some(ref rate_limit) = inbound.rate_limit {
            Self::validate_rate_limit_config(rate_limit)?;
        }

        Ok(())
    }

    /// 验证完整应用配置
    pub fn validate_app_config(config: &AppConfig) -> Result<()> {
        let mut inbound_tags = HashSet::new();
        for inbound in &config.inbounds {
            Self::validate_inbound(inbound)?;
            if !inbound.tag.is_empty() && !inbound_tags.insert(inbound.tag.as_str()) {
                bail!("Duplicate inbound tag '{}'", inbound.tag);
            }
        }

        if config.outbounds.is_empty() && !config.inbounds.is_empty() {
            bail!("At least one outbound must be configured");
        }

        let mut outbound_tags = HashSet::new();
        for outbound in &config.outbounds {
            if outbound.tag.trim().is_empty() {
                bail!("Outbound tag cannot be empty");
            }
            if !outbound_tags.insert(outbound.tag.as_str()) {
                bail!("Duplicate outbound tag '{}'", outbound.tag);
            }
        }

        if let Some(ref default) = config.routing.default_outbound {
            if !outbound_tags.contains(default.as_str()) {
                bail!("routing.default_outbound '{}' is not a configured outbound", default);
            }
        }

        for (index, rule) in config.routing.rules.iter().enumerate() {
            if !outbound_tags.contains(rule.outbound_tag.as_str()) {
                bail!(
                    "routing.rules[{}]: outbound_tag '{}' is not a configured outbound",
                    index,
                    rule.outbound_tag
                );
            }
            for tag in &rule.inbound_tags {
                if !inbound_tags.contains(tag.as_str()) {
                    warn!("routing.rules[{}]: inbound tag '{}' matches no inbound", index, tag);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllocationConfig, OutboundConfig, OutboundProtocol, RouteRule};

    fn inbound() -> InboundConfig {
        InboundConfig::builder()
            .tag("in")
            .port_range(PortRange::new(10000, 10002))
            .destination("tcp:127.0.0.1:80".parse().unwrap())
            .build()
            .unwrap()
    }

    fn app(inbounds: Vec<InboundConfig>) -> AppConfig {
        AppConfig {
            inbounds,
            outbounds: vec![OutboundConfig {
                tag: "direct".to_string(),
                protocol: OutboundProtocol::Direct,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(ConfigValidator::validate_app_config(&app(vec![inbound()])).is_ok());
    }

    #[test]
    fn test_reversed_port_range() {
        let mut config = inbound();
        config.port_range = PortRange::new(10002, 10000);
        assert!(ConfigValidator::validate_inbound(&config).is_err());
    }

    #[test]
    fn test_zero_port() {
        let mut config = inbound();
        config.port_range = PortRange::single(0);
        assert!(ConfigValidator::validate_inbound(&config).is_err());
    }

    #[test]
    fn test_concurrency_exceeds_range() {
        let mut config = inbound();
        config.allocation = AllocationConfig {
            strategy: AllocationStrategy::Random,
            concurrency: 4,
            refresh_minutes: 5,
        };
        let err = ConfigValidator::validate_inbound(&config).unwrap_err();
        assert!(err.to_string().contains("concurrency"));

        config.allocation.concurrency = 3;
        assert!(ConfigValidator::validate_inbound(&config).is_ok());
    }

    #[test]
    fn test_forward_needs_destination() {
        let mut config = inbound();
        config.destination = None;
        assert!(ConfigValidator::validate_inbound(&config).is_err());

        config.receive_original_destination = true;
        assert!(ConfigValidator::validate_inbound(&config).is_ok());
    }

    #[test]
    fn test_duplicate_inbound_tags() {
        assert!(ConfigValidator::validate_app_config(&app(vec![inbound(), inbound()])).is_err());
    }

    #[test]
    fn test_unknown_outbound_references() {
        let mut config = app(vec![inbound()]);
        config.routing.default_outbound = Some("missing".to_string());
        assert!(ConfigValidator::validate_app_config(&config).is_err());

        let mut config = app(vec![inbound()]);
        config.routing.rules.push(RouteRule {
            inbound_tags: vec![],
            protocols: vec![],
            networks: vec![],
            outbound_tag: "missing".to_string(),
        });
        assert!(ConfigValidator::validate_app_config(&config).is_err());
    }

    #[test]
    fn test_inbounds_without_outbound() {
        let mut config = app(vec![inbound()]);
        config.outbounds.clear();
        assert!(ConfigValidator::validate_app_config(&config).is_err());
    }
}
