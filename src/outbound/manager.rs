use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::OutboundHandler;

/// 出站处理器注册表：标签 → 处理器，外加一个默认处理器
///
/// 查找发生在每个流的分发路径上，修改只在启动或重新配置时发生，因此使用读写锁。
#[derive(Default)]
pub struct OutboundManager {
    handlers: RwLock<HashMap<String, Arc<dyn OutboundHandler>>>,
    default_handler: RwLock<Option<Arc<dyn OutboundHandler>>>,
}

impl OutboundManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_handler(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.handlers.read().get(tag).cloned()
    }

    pub fn get_default_handler(&self) -> Option<Arc<dyn OutboundHandler>> {
        self.default_handler.read().clone()
    }

    pub fn set_default_handler(&self, handler: Arc<dyn OutboundHandler>) {
        info!("Default outbound set to '{}'", handler.tag());
        *self.default_handler.write() = Some(handler);
    }

    /// 注册处理器；还没有默认处理器时，第一个注册的成为默认
    pub fn add_handler(&self, handler: Arc<dyn OutboundHandler>) {
        let tag = handler.tag().to_string();
        {
            let mut default = self.default_handler.write();
            if default.is_none() {
                debug!("Outbound '{}' becomes default", tag);
                *default = Some(handler.clone());
            }
        }
        if self.handlers.write().insert(tag.clone(), handler).is_some() {
            debug!("Outbound '{}' replaced", tag);
        }
    }

    /// 移除处理器；若它是默认处理器，默认处理器也一并清除
    pub fn remove_handler(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        let removed = self.handlers.write().remove(tag);
        if removed.is_some() {
            let mut default = self.default_handler.write();
            if default.as_ref().is_some_and(|h| h.tag() == tag) {
                *default = None;
            }
        }
        removed
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.handlers.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::BlockOutbound;

    fn handler(tag: &str) -> Arc<dyn OutboundHandler> {
        Arc::new(BlockOutbound::new(tag.to_string()))
    }

    #[test]
    fn test_first_added_becomes_default() {
        let manager = OutboundManager::new();
        assert!(manager.get_default_handler().is_none());

        manager.add_handler(handler("a"));
        manager.add_handler(handler("b"));
        assert_eq!(manager.get_default_handler().unwrap().tag(), "a");
        assert_eq!(manager.tags(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_set_default_overrides() {
        let manager = OutboundManager::new();
        manager.add_handler(handler("a"));
        manager.set_default_handler(handler("b"));
        assert_eq!(manager.get_default_handler().unwrap().tag(), "b");
        assert!(manager.get_handler("b").is_none());
    }

    #[test]
    fn test_remove_default() {
        let manager = OutboundManager::new();
        manager.add_handler(handler("a"));
        assert!(manager.remove_handler("a").is_some());
        assert!(manager.get_default_handler().is_none());
        assert!(manager.remove_handler("a").is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_concurrent_lookup_and_mutation() {
        let manager = Arc::new(OutboundManager::new());
        manager.add_handler(handler("base"));

        let threads: Vec<_> = (0..4)
            .map(|i| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        let tag = format!("h-{}-{}", i, j);
                        manager.add_handler(handler(&tag));
                        assert!(manager.get_handler(&tag).is_some());
                        assert!(manager.get_default_handler().is_some());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(manager.len(), 401);
    }
}
