use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "traffic-dispatch")]
#[command(author, version, about = "Connection dispatch and routing engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，默认取配置文件中的 log.level
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 加载配置并运行，直到收到 Ctrl+C
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "traffic-dispatch.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成示例配置
    Template {
        /// 输出文件路径（缺省时打印到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["traffic-dispatch", "run", "-c", "a.toml", "--log-level", "debug"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Run { config } => assert_eq!(config, "a.toml"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_check_json() {
        let cli = Cli::parse_from(["traffic-dispatch", "check", "--config", "a.toml", "--format", "json"]);
        match cli.command {
            Commands::Check { config, format } => {
                assert_eq!(config, "a.toml");
                assert_eq!(format, "json");
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn test_reject_unknown_format() {
        assert!(Cli::try_parse_from(["traffic-dispatch", "check", "-c", "a.toml", "-f", "yaml"]).is_err());
    }
}
