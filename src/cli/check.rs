use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::config::{AllocationStrategy, AppConfig};

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

fn print_json(result: &CheckResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

/// 收集不影响运行但值得提醒的配置问题
fn collect_warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.inbounds.is_empty() {
        warnings.push("No inbound configurations defined".to_string());
    }
    for (index, inbound) in config.inbounds.iter().enumerate() {
        let allocation = &inbound.allocation;
        if allocation.strategy == AllocationStrategy::Random
            && inbound.port_range.len() < allocation.concurrency * 2
        {
            warnings.push(format!(
                "inbounds[{}]: port range {} leaves no room to rotate {} worker(s)",
                index, inbound.port_range, allocation.concurrency
            ));
        }
    }
    warnings
}

fn summarize(config: &AppConfig) -> serde_json::Value {
    let inbounds: Vec<serde_json::Value> = config
        .inbounds
        .iter()
        .map(|inbound| {
            serde_json::json!({
                "tag": inbound.tag,
                "listen": inbound.listen,
                "port_range": inbound.port_range.to_string(),
                "strategy": inbound.allocation.strategy,
                "network": inbound.network,
                "sniffing": inbound.sniffing,
            })
        })
        .collect();
    let outbounds: Vec<serde_json::Value> = config
        .outbounds
        .iter()
        .map(|outbound| serde_json::json!({ "tag": outbound.tag, "protocol": outbound.protocol }))
        .collect();

    serde_json::json!({
        "inbounds": inbounds,
        "outbounds": outbounds,
        "default_outbound": config.routing.default_outbound,
        "rules_count": config.routing.rules.len(),
    })
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    if !Path::new(config_path).exists() {
        if format == "json" {
            print_json(&CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            })?;
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    let config = match AppConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            if format == "json" {
                print_json(&CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                })?;
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Port ranges are written as 8080 or \"10000-10002\"");
                println!("  3. Forward inbounds need a destination or receive_original_destination = true");
                println!("  4. Every outbound_tag must name a configured [[outbounds]] entry");
            }
            return Err(e);
        }
    };

    let warnings = collect_warnings(&config);
    if format == "json" {
        print_json(&CheckResult {
            valid: true,
            warnings,
            error: None,
            details: summarize(&config),
        })?;
        return Ok(());
    }

    println!("✓ Inbounds: {}", config.inbounds.len());
    for (idx, inbound) in config.inbounds.iter().enumerate() {
        println!(
            "  Inbound #{}: '{}' {}:{} ({:?}, network={:?})",
            idx + 1,
            inbound.tag,
            inbound.listen,
            inbound.port_range,
            inbound.allocation.strategy,
            inbound.network
        );
    }
    println!("✓ Outbounds: {}", config.outbounds.len());
    for outbound in &config.outbounds {
        println!("  Outbound '{}' ({:?})", outbound.tag, outbound.protocol);
    }
    println!("✓ Routing rules: {}", config.routing.rules.len());
    for warning in &warnings {
        println!("⚠ Warning: {}", warning);
    }
    println!("\n✓ Configuration is valid!");
    Ok(())
}
