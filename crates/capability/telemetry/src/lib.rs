//! 追踪初始化、扫描关联 ID 与驱动指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 驱动指标快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub points_read: u64,
    pub points_bad: u64,
    pub write_success: u64,
    pub write_failure: u64,
    pub reconnects: u64,
    pub browse_retries: u64,
    pub bacnet_timeouts: u64,
    pub subscription_rebuilds: u64,
    pub notifications_dropped: u64,
}

/// 驱动指标（进程级计数器）。
pub struct DriverMetrics {
    points_read: AtomicU64,
    points_bad: AtomicU64,
    write_success: AtomicU64,
    write_failure: AtomicU64,
    reconnects: AtomicU64,
    browse_retries: AtomicU64,
    bacnet_timeouts: AtomicU64,
    subscription_rebuilds: AtomicU64,
    notifications_dropped: AtomicU64,
}

impl DriverMetrics {
    pub fn new() -> Self {
        Self {
            points_read: AtomicU64::new(0),
            points_bad: AtomicU64::new(0),
            write_success: AtomicU64::new(0),
            write_failure: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            browse_retries: AtomicU64::new(0),
            bacnet_timeouts: AtomicU64::new(0),
            subscription_rebuilds: AtomicU64::new(0),
            notifications_dropped: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            points_read: self.points_read.load(Ordering::Relaxed),
            points_bad: self.points_bad.load(Ordering::Relaxed),
            write_success: self.write_success.load(Ordering::Relaxed),
            write_failure: self.write_failure.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            browse_retries: self.browse_retries.load(Ordering::Relaxed),
            bacnet_timeouts: self.bacnet_timeouts.load(Ordering::Relaxed),
            subscription_rebuilds: self.subscription_rebuilds.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for DriverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<DriverMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static DriverMetrics {
    METRICS.get_or_init(DriverMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成一次设备/对象扫描的关联 ID。
pub fn new_scan_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 记录一次批量读取的点位数与其中坏质量点位数。
pub fn record_points_read(total: usize, bad: usize) {
    let metrics = metrics();
    metrics
        .points_read
        .fetch_add(total as u64, Ordering::Relaxed);
    metrics.points_bad.fetch_add(bad as u64, Ordering::Relaxed);
}

pub fn record_write_success() {
    metrics().write_success.fetch_add(1, Ordering::Relaxed);
}

pub fn record_write_failure() {
    metrics().write_failure.fetch_add(1, Ordering::Relaxed);
}

/// 记录会话重连（OPC-UA 重连、BACnet 重新发现）。
pub fn record_reconnect() {
    metrics().reconnects.fetch_add(1, Ordering::Relaxed);
}

pub fn record_browse_retry() {
    metrics().browse_retries.fetch_add(1, Ordering::Relaxed);
}

pub fn record_bacnet_timeout() {
    metrics().bacnet_timeouts.fetch_add(1, Ordering::Relaxed);
}

pub fn record_subscription_rebuild() {
    metrics()
        .subscription_rebuilds
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录因订阅队列已满而丢弃的通知。
pub fn record_notification_dropped() {
    metrics()
        .notifications_dropped
        .fetch_add(1, Ordering::Relaxed);
}
