/// 单个流的请求上下文
///
/// 由入站 Worker 在接受连接（或收到新 UDP 流的第一个数据报）时创建，
/// 通过 `Arc` 沿分发路径传递。嗅探结果和最终路由目标各自只能写入一次，其余字段不可变。
use std::fmt;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::destination::Destination;
use crate::sniff::{SniffProtocol, SniffResult};

pub struct RequestContext {
    id: Uuid,
    inbound_tag: String,
    source: Option<Destination>,
    original_target: Option<Destination>,
    sniffing: Vec<SniffProtocol>,
    allow_passive_connection: bool,
    cancel: CancellationToken,
    sniffed: OnceLock<SniffResult>,
    target: OnceLock<Destination>,
}

impl RequestContext {
    pub fn new(inbound_tag: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            inbound_tag: inbound_tag.into(),
            source: None,
            original_target: None,
            sniffing: Vec::new(),
            allow_passive_connection: false,
            cancel,
            sniffed: OnceLock::new(),
            target: OnceLock::new(),
        }
    }

    pub fn with_source(mut self, source: Destination) -> Self {
        self.source = Some(source);
        self
    }

    /// 透明代理场景下恢复出的原始目标
    pub fn with_original_target(mut self, target: Destination) -> Self {
        self.original_target = Some(target);
        self
    }

    pub fn with_sniffing(mut self, candidates: Vec<SniffProtocol>) -> Self {
        self.sniffing = candidates;
        self
    }

    pub fn with_allow_passive_connection(mut self, allow: bool) -> Self {
        self.allow_passive_connection = allow;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn inbound_tag(&self) -> &str {
        &self.inbound_tag
    }

    pub fn source(&self) -> Option<&Destination> {
        self.source.as_ref()
    }

    pub fn original_target(&self) -> Option<&Destination> {
        self.original_target.as_ref()
    }

    pub fn sniffing(&self) -> &[SniffProtocol] {
        &self.sniffing
    }

    pub fn allow_passive_connection(&self) -> bool {
        self.allow_passive_connection
    }

    /// 流的取消作用域
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 记录嗅探结果；只有第一次调用生效
    pub fn set_sniffed(&self, result: SniffResult) -> bool {
        self.sniffed.set(result).is_ok()
    }

    pub fn sniffed(&self) -> Option<&SniffResult> {
        self.sniffed.get()
    }

    /// 记录最终路由使用的目标（出站处理器据此拨号）；只有第一次调用生效
    pub fn set_target(&self, target: Destination) -> bool {
        self.target.set(target).is_ok()
    }

    pub fn target(&self) -> Option<&Destination> {
        self.target.get()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("inbound_tag", &self.inbound_tag)
            .field("source", &self.source)
            .field("original_target", &self.original_target)
            .field("target", &self.target.get())
            .field("sniffed", &self.sniffed.get())
            .finish()
    }
}
