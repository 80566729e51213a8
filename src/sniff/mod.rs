//! Protocol sniffing
//!
//! Inspects the first bytes of a flow to recover the application protocol
//! and, when the protocol carries one, the target domain name.
//!
//! Each protocol tester is a pure function over a byte prefix. A [`Sniffer`]
//! keeps the set of testers that are still possible for one flow: a tester
//! that rejects the prefix once is never consulted again for that flow.

mod bittorrent;
mod http;
mod tls;

pub use bittorrent::sniff_bittorrent;
pub use http::sniff_http;
pub use tls::sniff_tls;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{DispatchError, Result};
use crate::link::LinkReader;

/// 最多尝试次数
pub const SNIFF_MAX_ATTEMPTS: usize = 5;

/// 两次尝试之间的固定间隔
pub const SNIFF_ATTEMPT_INTERVAL: Duration = Duration::from_millis(100);

/// 嗅探最多查看的字节数（一个读缓冲区）
pub const SNIFF_BUFFER_SIZE: usize = 2048;

/// 可嗅探的协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SniffProtocol {
    Http,
    Tls,
    #[serde(alias = "bt")]
    Bittorrent,
}

impl SniffProtocol {
    pub fn name(self) -> &'static str {
        match self {
            SniffProtocol::Http => "http",
            SniffProtocol::Tls => "tls",
            SniffProtocol::Bittorrent => "bittorrent",
        }
    }

    fn tester(self) -> fn(&[u8]) -> TestOutcome {
        match self {
            SniffProtocol::Http => sniff_http,
            SniffProtocol::Tls => sniff_tls,
            SniffProtocol::Bittorrent => sniff_bittorrent,
        }
    }
}

impl fmt::Display for SniffProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 嗅探结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffResult {
    pub protocol: SniffProtocol,
    pub domain: Option<String>,
}

impl SniffResult {
    pub fn new(protocol: SniffProtocol, domain: Option<String>) -> Self {
        Self { protocol, domain }
    }

    pub fn protocol_name(&self) -> &'static str {
        self.protocol.name()
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref().filter(|d| !d.is_empty())
    }
}

/// 单个协议测试器的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Matched(SniffResult),
    NeedMoreData,
    NoMatch,
}

/// 整个 Sniffer 一次调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffOutcome {
    /// 可信的识别结果，domain 可能为空
    Matched(SniffResult),
    /// 数据不足，调用方应缓冲更多数据后重试
    NeedMoreData,
    /// 数据确定不是任何候选协议
    NoMatch,
    /// 所有候选测试器都已拒绝
    AllUnknown,
}

/// 单个流的嗅探器，持有仍可能匹配的测试器集合
#[derive(Debug, Clone)]
pub struct Sniffer {
    candidates: Vec<SniffProtocol>,
}

impl Sniffer {
    pub fn new(candidates: &[SniffProtocol]) -> Self {
        let mut unique = Vec::with_capacity(candidates.len());
        for p in candidates {
            if !unique.contains(p) {
                unique.push(*p);
            }
        }
        Self { candidates: unique }
    }

    /// 仍然可能匹配的协议
    pub fn candidates(&self) -> &[SniffProtocol] {
        &self.candidates
    }

    /// 对前缀运行所有剩余测试器；返回 NoMatch 的测试器会被永久移除
    ///
    /// 本次调用淘汰了最后一个测试器时返回 `AllUnknown`，此后再调用返回 `NoMatch`。
    pub fn sniff(&mut self, prefix: &[u8]) -> SniffOutcome {
        if self.candidates.is_empty() {
            return SniffOutcome::NoMatch;
        }

        let mut pending = Vec::with_capacity(self.candidates.len());
        for protocol in &self.candidates {
            match (protocol.tester())(prefix) {
                TestOutcome::Matched(result) => return SniffOutcome::Matched(result),
                TestOutcome::NeedMoreData => pending.push(*protocol),
                TestOutcome::NoMatch => trace!("Sniffer '{}' rejected prefix", protocol),
            }
        }

        self.candidates = pending;
        if self.candidates.is_empty() {
            SniffOutcome::AllUnknown
        } else {
            SniffOutcome::NeedMoreData
        }
    }
}

/// 在 Link 上行端非消费地窥视数据并尝试嗅探
///
/// 返回 `Ok(Some(result))` 表示识别成功；`Ok(None)` 表示达到尝试次数或缓冲上限、
/// 或者所有测试器都已拒绝；取消时返回 `DispatchError::Cancelled`。
pub async fn sniff_link(
    reader: &LinkReader,
    candidates: &[SniffProtocol],
    cancel: &CancellationToken,
) -> Result<Option<SniffResult>> {
    let mut sniffer = Sniffer::new(candidates);
    let mut buf = vec![0u8; SNIFF_BUFFER_SIZE];

    for attempt in 1..=SNIFF_MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let n = reader.peek(&mut buf);
        if n > 0 {
            match sniffer.sniff(&buf[..n]) {
                SniffOutcome::Matched(result) => {
                    debug!(
                        "Sniffed protocol '{}' (domain: {:?}) after {} attempt(s)",
                        result.protocol,
                        result.domain(),
                        attempt
                    );
                    return Ok(Some(result));
                }
                SniffOutcome::NoMatch | SniffOutcome::AllUnknown => {
                    debug!("No known protocol in first {} bytes", n);
                    return Ok(None);
                }
                SniffOutcome::NeedMoreData => {}
            }
            if n >= SNIFF_BUFFER_SIZE {
                debug!("Sniff buffer full without a match");
                return Ok(None);
            }
        }

        if attempt == SNIFF_MAX_ATTEMPTS {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            _ = tokio::time::sleep(SNIFF_ATTEMPT_INTERVAL) => {}
        }
    }

    debug!("Sniffing gave up after {} attempts", SNIFF_MAX_ATTEMPTS);
    Ok(None)
}
