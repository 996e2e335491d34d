//! 设备级订阅与本地值缓存
//!
//! ```text
//! 服务端 publish ──► 回调 try_send ──► 有界 mpsc ──► 后台任务 ──► cache (point_id → PointValue)
//!                    (队列满则丢弃并计数)                ▲
//!                                                       └── CancellationToken 停止
//! ```

use super::session::{MonitoredNode, Notification, SubscriptionRequest, UaSession};
use crate::error::DriverError;
use crate::types::{now_epoch_ms, DriverTuning};
use domain::{Point, PointValue};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 订阅身份：排序去重后的 (点位 ID, 节点地址)
pub type SubscriptionKey = Vec<(String, String)>;

pub fn subscription_key(points: &[Point]) -> SubscriptionKey {
    let mut key: SubscriptionKey = points
        .iter()
        .map(|p| (p.id.clone(), p.address.trim().to_string()))
        .collect();
    key.sort();
    key.dedup();
    key
}

type ValueCache = Arc<RwLock<HashMap<String, PointValue>>>;

/// 一台设备的一个服务端订阅
pub struct DeviceSubscription {
    subscription_id: u32,
    key: SubscriptionKey,
    cache: ValueCache,
    cancel: CancellationToken,
}

impl DeviceSubscription {
    /// 创建服务端订阅并启动通知消费任务
    pub async fn create(
        session: &Arc<dyn UaSession>,
        points: &[Point],
        tuning: &DriverTuning,
        next_handle: &AtomicU32,
    ) -> Result<Arc<Self>, DriverError> {
        let key = subscription_key(points);
        let mut handles: HashMap<u32, String> = HashMap::with_capacity(key.len());
        let mut items = Vec::with_capacity(key.len());
        for (point_id, node_id) in &key {
            let handle = next_handle.fetch_add(1, Ordering::Relaxed);
            handles.insert(handle, point_id.clone());
            items.push(MonitoredNode {
                handle,
                node_id: node_id.clone(),
            });
        }

        let (tx, rx) = mpsc::channel(tuning.opcua_queue_size);
        let request = SubscriptionRequest {
            publish_interval: tuning.opcua_publish_interval,
            sampling_interval_ms: tuning.opcua_sampling_interval_ms,
            queue_size: 10,
            items,
        };
        let subscription_id = session.subscribe(request, tx).await?;

        let cache: ValueCache = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();
        tokio::spawn(consume(rx, cancel.clone(), handles, cache.clone()));

        tracing::info!(subscription_id, points = key.len(), "opc-ua subscription created");
        Ok(Arc::new(Self {
            subscription_id,
            key,
            cache,
            cancel,
        }))
    }

    pub fn subscription_id(&self) -> u32 {
        self.subscription_id
    }

    pub fn matches(&self, key: &SubscriptionKey) -> bool {
        &self.key == key
    }

    /// 所有点位都已有缓存值时返回快照，否则 None
    pub fn cached(&self, points: &[Point]) -> Option<HashMap<String, PointValue>> {
        let cache = self.cache.read();
        points
            .iter()
            .map(|p| cache.get(&p.id).map(|v| (p.id.clone(), v.clone())))
            .collect()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for DeviceSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Notification>,
    cancel: CancellationToken,
    handles: HashMap<u32, String>,
    cache: ValueCache,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => {
                let Some(notification) = next else { break };
                let Some(point_id) = handles.get(&notification.handle) else {
                    tracing::debug!(handle = notification.handle, "notification for unknown handle");
                    continue;
                };
                let reading = notification.reading;
                let ts_ms = reading.source_ts_ms.unwrap_or_else(now_epoch_ms);
                let value = if reading.good {
                    PointValue::good(point_id.clone(), reading.value, ts_ms)
                } else {
                    PointValue::bad(point_id.clone(), ts_ms)
                };
                cache.write().insert(point_id.clone(), value);
            }
        }
    }
    tracing::debug!("opc-ua notification consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::DataType;

    #[test]
    fn key_ignores_order_and_duplicates() {
        let a = vec![
            Point::new("t2", "ns=2;s=B", DataType::Float64),
            Point::new("t1", "ns=2;s=A", DataType::Float64),
        ];
        let b = vec![
            Point::new("t1", "ns=2;s=A", DataType::Float64),
            Point::new("t2", "ns=2;s=B", DataType::Float64),
            Point::new("t1", "ns=2;s=A", DataType::Float64),
        ];
        assert_eq!(subscription_key(&a), subscription_key(&b));

        let moved = vec![
            Point::new("t1", "ns=2;s=C", DataType::Float64),
            Point::new("t2", "ns=2;s=B", DataType::Float64),
        ];
        assert_ne!(subscription_key(&a), subscription_key(&moved));
    }
}
