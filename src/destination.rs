/// 目标地址模型
///
/// `Destination` 是 (网络, 地址, 端口) 三元组，分发路径上的所有组件都以它描述流的去向。
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::DispatchError;

/// 传输网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Network {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(DispatchError::config_error(format!("Unknown network: {}", s))),
        }
    }
}

/// 目标地址：IP 或域名
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(IpAddr),
    Domain(String),
}

impl Address {
    /// 解析主机字符串，能解析为 IP 的视为 IP，否则视为域名
    pub fn parse(host: &str) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Domain(host.to_string()),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Address::Ip(_) => false,
            Address::Domain(d) => d.is_empty(),
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            Address::Domain(d) => Some(d.as_str()),
            Address::Ip(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Domain(d) => write!(f, "{}", d),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Address::Ip(ip)
    }
}

/// 流的目标：网络 + 地址 + 端口
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
    pub port: u16,
}

impl Destination {
    pub fn new(network: Network, address: Address, port: u16) -> Self {
        Self {
            network,
            address,
            port,
        }
    }

    pub fn tcp(address: Address, port: u16) -> Self {
        Self::new(Network::Tcp, address, port)
    }

    pub fn udp(address: Address, port: u16) -> Self {
        Self::new(Network::Udp, address, port)
    }

    /// 从 SocketAddr 构造
    pub fn from_socket_addr(network: Network, addr: SocketAddr) -> Self {
        Self::new(network, Address::Ip(addr.ip()), addr.port())
    }

    /// 地址和端口都已设置才有效
    pub fn is_valid(&self) -> bool {
        !self.address.is_empty() && self.port != 0
    }

    /// 替换地址，保留网络和端口
    pub fn with_address(&self, address: Address) -> Self {
        Self {
            network: self.network,
            address,
            port: self.port,
        }
    }

    /// 仅 IP 目标可以直接转换为 SocketAddr
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.address {
            Address::Ip(ip) => Some(SocketAddr::new(ip, self.port)),
            Address::Domain(_) => None,
        }
    }

    /// `host:port` 形式，供解析器使用
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.network, self.address, self.port)
    }
}

impl FromStr for Destination {
    type Err = DispatchError;

    /// 支持 `tcp:host:port`、`udp:[::1]:53` 以及默认 TCP 的 `host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (network, rest) = match s.split_once(':') {
            Some((prefix, rest)) if prefix.eq_ignore_ascii_case("tcp") => (Network::Tcp, rest),
            Some((prefix, rest)) if prefix.eq_ignore_ascii_case("udp") => (Network::Udp, rest),
            _ => (Network::Tcp, s),
        };

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| DispatchError::invalid_destination(format!("missing port: {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| DispatchError::invalid_destination(format!("invalid port: {}", s)))?;

        let destination = Destination::new(network, Address::parse(host), port);
        if !destination.is_valid() {
            return Err(DispatchError::invalid_destination(s.to_string()));
        }
        Ok(destination)
    }
}

impl Serialize for Destination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
