use anyhow::{Context, Result};

/// 示例配置内容
pub const CONFIG_TEMPLATE: &str = include_str!("../../templates/traffic-dispatch.toml");

/// Generate configuration template
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated configuration template: {}", path);
    } else {
        println!("{}", CONFIG_TEMPLATE);
    }

    Ok(())
}
