use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Statistics for a single inbound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundStats {
    /// Inbound tag
    pub tag: String,
    /// Total number of accepted flows
    pub total_connections: u64,
    /// Currently active flows
    pub active_connections: u64,
    /// Flows dropped by the rate limiter
    pub rejected_connections: u64,
    /// Bytes received from clients
    pub uplink_bytes: u64,
    /// Bytes sent back to clients
    pub downlink_bytes: u64,
    /// Timestamp when this inbound was registered (Unix timestamp)
    pub start_time: u64,
}

/// Statistics tracker for a single inbound
#[derive(Debug, Clone)]
pub struct InboundStatsTracker {
    tag: String,
    total_connections: Arc<AtomicU64>,
    active_connections: Arc<AtomicU64>,
    rejected_connections: Arc<AtomicU64>,
    uplink_bytes: Arc<AtomicU64>,
    downlink_bytes: Arc<AtomicU64>,
    start_time: u64,
}

impl InboundStatsTracker {
    pub fn new(tag: String) -> Self {
        Self {
            tag,
            total_connections: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicU64::new(0)),
            rejected_connections: Arc::new(AtomicU64::new(0)),
            uplink_bytes: Arc::new(AtomicU64::new(0)),
            downlink_bytes: Arc::new(AtomicU64::new(0)),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Increment active connections (called when a flow starts)
    pub fn connection_started(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections (called when a flow ends)
    pub fn connection_ended(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_uplink_bytes(&self, bytes: u64) {
        self.uplink_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downlink_bytes(&self, bytes: u64) {
        self.downlink_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn get_stats(&self) -> InboundStats {
        InboundStats {
            tag: self.tag.clone(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            uplink_bytes: self.uplink_bytes.load(Ordering::Relaxed),
            downlink_bytes: self.downlink_bytes.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

/// RAII guard to automatically decrement active connections count
pub struct ConnectionGuard {
    tracker: InboundStatsTracker,
}

impl ConnectionGuard {
    pub fn new(tracker: InboundStatsTracker) -> Self {
        tracker.connection_started();
        Self { tracker }
    }

    pub fn tracker(&self) -> &InboundStatsTracker {
        &self.tracker
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.connection_ended();
    }
}

/// Dispatch counts for a single outbound
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundStats {
    pub tag: String,
    /// Flows handed to this outbound
    pub dispatched: u64,
    /// Flows that reached this outbound through default fallback
    pub fallbacks: u64,
}

/// Global statistics manager
#[derive(Debug, Clone, Default)]
pub struct StatsManager {
    inbounds: Arc<Mutex<HashMap<String, InboundStatsTracker>>>,
    outbounds: Arc<Mutex<HashMap<String, OutboundStats>>>,
}

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inbound; registering the same tag again returns the existing tracker
    pub fn register_inbound(&self, tag: &str) -> InboundStatsTracker {
        self.inbounds
            .lock()
            .entry(tag.to_string())
            .or_insert_with(|| InboundStatsTracker::new(tag.to_string()))
            .clone()
    }

    /// Unregister an inbound
    pub fn unregister_inbound(&self, tag: &str) {
        self.inbounds.lock().remove(tag);
    }

    /// Record a flow dispatched to an outbound
    pub fn record_dispatch(&self, outbound_tag: &str, fallback: bool) {
        let mut outbounds = self.outbounds.lock();
        let entry = outbounds
            .entry(outbound_tag.to_string())
            .or_insert_with(|| OutboundStats {
                tag: outbound_tag.to_string(),
                dispatched: 0,
                fallbacks: 0,
            });
        entry.dispatched += 1;
        if fallback {
            entry.fallbacks += 1;
        }
    }

    /// Get stats for all inbounds, sorted by tag
    pub fn get_all_inbound_stats(&self) -> Vec<InboundStats> {
        let mut stats: Vec<InboundStats> = self
            .inbounds
            .lock()
            .values()
            .map(|tracker| tracker.get_stats())
            .collect();
        stats.sort_by(|a, b| a.tag.cmp(&b.tag));
        stats
    }

    /// Get stats for a specific inbound
    pub fn get_inbound_stats(&self, tag: &str) -> Option<InboundStats> {
        self.inbounds.lock().get(tag).map(|tracker| tracker.get_stats())
    }

    pub fn get_outbound_stats(&self, tag: &str) -> Option<OutboundStats> {
        self.outbounds.lock().get(tag).cloned()
    }

    /// Get dispatch counts for all outbounds, sorted by tag
    pub fn get_all_outbound_stats(&self) -> Vec<OutboundStats> {
        let mut stats: Vec<OutboundStats> = self.outbounds.lock().values().cloned().collect();
        stats.sort_by(|a, b| a.tag.cmp(&b.tag));
        stats
    }

    /// Clear all stats
    pub fn clear(&self) {
        self.inbounds.lock().clear();
        self.outbounds.lock().clear();
    }
}
