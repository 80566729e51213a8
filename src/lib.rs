/// Traffic Dispatch 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod app;
pub mod cli;
pub mod config;
pub mod context;
pub mod destination;
pub mod dispatcher;
pub mod error;
pub mod inbound;
pub mod link;
pub mod outbound;
pub mod rate_limiter;
pub mod routing;
pub mod sniff;
pub mod stats;

// 重新导出常用类型
pub use app::App;
pub use config::{AppConfig, InboundConfig, OutboundConfig, PortRange};
pub use context::RequestContext;
pub use destination::{Address, Destination, Network};
pub use dispatcher::{Dispatch, Dispatcher};
pub use error::{DispatchError, Result};
pub use inbound::{InboundHandler, InboundManager, InboundProxy, Worker};
pub use link::{link_pair, Link, LinkReader, LinkWriter};
pub use outbound::{OutboundHandler, OutboundManager};
pub use rate_limiter::RateLimiter;
pub use routing::{Router, RoutingContext, RoutingDecision, RuleRouter};
pub use sniff::{SniffProtocol, SniffResult, Sniffer};
pub use stats::{InboundStats, StatsManager};
