//! OPC-UA 客户端表、订阅复用与浏览重试，使用内存会话替代真实服务端

use async_trait::async_trait;
use domain::{DataType, DriverConfig, Point, PointValueData, Quality};
use gw_protocol::opcua::{
    BrowseEntry, EndpointConfig, NodeKind, Notification, SubscriptionRequest, UaConnector,
    UaReading, UaSession,
};
use gw_protocol::{Driver, DriverContext, DriverError, DriverTuning, HealthStatus, OpcUaDriver};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const URL: &str = "opc.tcp://plc:4840";

#[derive(Default)]
struct MockState {
    connects: AtomicU32,
    closes: AtomicU32,
    direct_reads: AtomicU32,
    /// 每次直接读取请求的节点
    read_requests: Mutex<Vec<Vec<String>>>,
    connect_delay: Mutex<Option<Duration>>,
    next_subscription: AtomicU32,
    browse_failures: AtomicU32,
    values: Mutex<HashMap<String, UaReading>>,
    writes: Mutex<Vec<(String, PointValueData)>>,
    write_status: Mutex<Option<u32>>,
    subscriptions: Mutex<Vec<(u32, SubscriptionRequest, mpsc::Sender<Notification>)>>,
    unsubscribed: Mutex<Vec<u32>>,
    tree: Mutex<HashMap<String, Vec<BrowseEntry>>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockState {
    fn set_value(&self, node: &str, value: PointValueData) {
        self.values
            .lock()
            .insert(node.to_string(), UaReading::good(value));
    }

    fn subscribe_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// 向最近一个订阅推送通知
    async fn notify(&self, node: &str, value: PointValueData, ts_ms: i64) {
        let (handle, sink) = {
            let subs = self.subscriptions.lock();
            let (_, request, sink) = subs.last().unwrap();
            let item = request.items.iter().find(|i| i.node_id == node).unwrap();
            (item.handle, sink.clone())
        };
        let mut reading = UaReading::good(value);
        reading.source_ts_ms = Some(ts_ms);
        sink.send(Notification { handle, reading }).await.unwrap();
    }

    /// 向最近一个订阅中监视该节点的所有项推送通知
    async fn notify_node(&self, node: &str, value: PointValueData, ts_ms: i64) {
        let (handles, sink) = {
            let subs = self.subscriptions.lock();
            let (_, request, sink) = subs.last().unwrap();
            let handles: Vec<u32> = request
                .items
                .iter()
                .filter(|i| i.node_id == node)
                .map(|i| i.handle)
                .collect();
            (handles, sink.clone())
        };
        for handle in handles {
            let mut reading = UaReading::good(value.clone());
            reading.source_ts_ms = Some(ts_ms);
            sink.send(Notification { handle, reading }).await.unwrap();
        }
    }

    fn drop_sessions(&self) {
        for session in self.sessions.lock().iter() {
            session.connected.store(false, Ordering::SeqCst);
        }
    }
}

struct MockSession {
    state: Arc<MockState>,
    connected: AtomicBool,
}

#[async_trait]
impl UaSession for MockSession {
    async fn read_values(&self, nodes: &[String]) -> Result<Vec<UaReading>, DriverError> {
        self.state.direct_reads.fetch_add(1, Ordering::SeqCst);
        self.state.read_requests.lock().push(nodes.to_vec());
        let values = self.state.values.lock();
        Ok(nodes
            .iter()
            .map(|n| {
                values
                    .get(n)
                    .cloned()
                    .unwrap_or_else(|| UaReading::bad(0x8034_0000))
            })
            .collect())
    }

    async fn write_value(&self, node: &str, value: &PointValueData) -> Result<(), DriverError> {
        if let Some(code) = *self.state.write_status.lock() {
            return Err(DriverError::Status {
                code,
                message: "BadTypeMismatch".to_string(),
            });
        }
        self.state
            .writes
            .lock()
            .push((node.to_string(), value.clone()));
        Ok(())
    }

    async fn read_data_types(&self, nodes: &[String]) -> Result<Vec<Option<String>>, DriverError> {
        Ok(nodes.iter().map(|_| Some("Double".to_string())).collect())
    }

    async fn browse(&self, node: &str) -> Result<Vec<BrowseEntry>, DriverError> {
        let remaining = self.state.browse_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.browse_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::Connection("secure channel closed".to_string()));
        }
        Ok(self.state.tree.lock().get(node).cloned().unwrap_or_default())
    }

    async fn subscribe(
        &self,
        request: SubscriptionRequest,
        sink: mpsc::Sender<Notification>,
    ) -> Result<u32, DriverError> {
        let id = self.state.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.subscriptions.lock().push((id, request, sink));
        Ok(id)
    }

    async fn unsubscribe(&self, subscription_id: u32) -> Result<(), DriverError> {
        self.state.unsubscribed.lock().push(subscription_id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockConnector {
    state: Arc<MockState>,
}

#[async_trait]
impl UaConnector for MockConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn UaSession>, DriverError> {
        assert!(endpoint.url.starts_with("opc.tcp://"));
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(MockSession {
            state: self.state.clone(),
            connected: AtomicBool::new(true),
        });
        self.state.sessions.lock().push(session.clone());
        Ok(session)
    }
}

fn tuning() -> DriverTuning {
    DriverTuning {
        opcua_use_subscription: true,
        opcua_browse_retries: 3,
        ..DriverTuning::default()
    }
}

fn config(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

async fn driver() -> (OpcUaDriver, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    state.set_value("ns=2;s=Temp", PointValueData::F64(20.0));
    state.set_value("ns=2;s=Pressure", PointValueData::F64(1.5));
    let connector = Arc::new(MockConnector {
        state: state.clone(),
    });
    let mut driver = OpcUaDriver::with_connector(tuning(), connector);
    driver
        .init(&DriverConfig::new(
            "opc-ua",
            config(json!({"endpoint": URL, "device_id": "boiler"})),
        ))
        .unwrap();
    driver.connect(&DriverContext::default()).await.unwrap();
    (driver, state)
}

fn temp() -> Point {
    Point::new("temp", "ns=2;s=Temp", DataType::Float64)
}

fn pressure() -> Point {
    Point::new("pressure", "ns=2;s=Pressure", DataType::Float64)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn same_point_set_reuses_subscription() {
    let (driver, state) = driver().await;
    let ctx = DriverContext::default();
    assert_eq!(driver.health(), HealthStatus::Good);

    // 缓存尚空，回退为直接读取
    let values = driver.read_points(&ctx, &[temp(), pressure()]).await.unwrap();
    assert_eq!(values["temp"].value, PointValueData::F64(20.0));
    assert_eq!(state.direct_reads.load(Ordering::SeqCst), 1);
    assert_eq!(state.subscribe_count(), 1);

    state.notify("ns=2;s=Temp", PointValueData::F64(21.0), 1_000).await;
    state.notify("ns=2;s=Pressure", PointValueData::F64(1.7), 1_001).await;
    settle().await;

    // 顺序不同的同一集合
    let values = driver.read_points(&ctx, &[pressure(), temp()]).await.unwrap();
    assert_eq!(values["temp"].value, PointValueData::F64(21.0));
    assert_eq!(values["temp"].ts_ms, 1_000);
    assert_eq!(values["pressure"].value, PointValueData::F64(1.7));
    assert_eq!(state.direct_reads.load(Ordering::SeqCst), 1);
    assert_eq!(state.subscribe_count(), 1);
    assert!(state.unsubscribed.lock().is_empty());
    assert_eq!(state.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn partial_cache_reads_every_point() {
    let (driver, state) = driver().await;
    let ctx = DriverContext::default();
    driver.read_points(&ctx, &[temp(), pressure()]).await.unwrap();

    // 只有温度收到过通知
    state.notify("ns=2;s=Temp", PointValueData::F64(22.0), 2_000).await;
    settle().await;
    state.set_value("ns=2;s=Pressure", PointValueData::F64(1.9));

    let values = driver.read_points(&ctx, &[temp(), pressure()]).await.unwrap();
    assert_eq!(state.direct_reads.load(Ordering::SeqCst), 2);
    let mut requested = state.read_requests.lock().last().cloned().unwrap();
    requested.sort();
    assert_eq!(requested, vec!["ns=2;s=Pressure", "ns=2;s=Temp"]);
    assert_eq!(values.len(), 2);
    assert_eq!(values["pressure"].value, PointValueData::F64(1.9));
    assert_eq!(values["temp"].value, PointValueData::F64(20.0));
}

fn temp_alarm() -> Point {
    Point::new("temp_alarm", "ns=2;s=Temp", DataType::Float64)
}

#[tokio::test]
async fn points_sharing_a_node_are_cached_separately() {
    let (driver, state) = driver().await;
    let ctx = DriverContext::default();
    driver.read_points(&ctx, &[temp(), temp_alarm()]).await.unwrap();

    let handles: Vec<u32> = state.subscriptions.lock()[0]
        .1
        .items
        .iter()
        .map(|i| i.handle)
        .collect();
    assert_eq!(handles.len(), 2);
    assert_ne!(handles[0], handles[1]);

    state.notify_node("ns=2;s=Temp", PointValueData::F64(23.0), 3_000).await;
    settle().await;

    let values = driver.read_points(&ctx, &[temp(), temp_alarm()]).await.unwrap();
    assert_eq!(state.direct_reads.load(Ordering::SeqCst), 1);
    assert_eq!(values["temp"].value, PointValueData::F64(23.0));
    assert_eq!(values["temp_alarm"].value, PointValueData::F64(23.0));
    assert_eq!(values["temp_alarm"].ts_ms, 3_000);
}

#[tokio::test]
async fn changed_point_set_rebuilds_subscription() {
    let (driver, state) = driver().await;
    let ctx = DriverContext::default();

    driver.read_points(&ctx, &[temp()]).await.unwrap();
    driver.read_points(&ctx, &[temp(), pressure()]).await.unwrap();

    assert_eq!(state.subscribe_count(), 2);
    assert_eq!(state.unsubscribed.lock().as_slice(), &[1]);
    let subs = state.subscriptions.lock();
    let nodes: Vec<&str> = subs[1].1.items.iter().map(|i| i.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["ns=2;s=Pressure", "ns=2;s=Temp"]);
}

#[tokio::test]
async fn bad_status_reading_is_bad_quality() {
    let (driver, _state) = driver().await;
    let ctx = DriverContext::default();
    let missing = Point::new("flow", "ns=2;s=Flow", DataType::Float32);

    let values = driver.read_points(&ctx, &[temp(), missing]).await.unwrap();
    assert_eq!(values["temp"].quality, Quality::Good);
    assert_eq!(values["flow"].quality, Quality::Bad);
}

#[tokio::test]
async fn lost_session_reconnects_and_resubscribes() {
    let (driver, state) = driver().await;
    let ctx = DriverContext::default();

    driver.read_points(&ctx, &[temp()]).await.unwrap();
    state.drop_sessions();
    assert_eq!(driver.health(), HealthStatus::Bad);

    driver.read_points(&ctx, &[temp()]).await.unwrap();
    assert_eq!(state.connects.load(Ordering::SeqCst), 2);
    assert_eq!(state.subscribe_count(), 2);
    assert_eq!(driver.health(), HealthStatus::Good);
}

#[tokio::test]
async fn write_casts_value_and_reports_status() {
    let (driver, state) = driver().await;
    let ctx = DriverContext::default();
    let setpoint = Point::new("sp", "ns=2;s=Setpoint", DataType::Int16);

    driver.write_point(&ctx, &setpoint, &json!("42")).await.unwrap();
    assert_eq!(
        state.writes.lock().as_slice(),
        &[("ns=2;s=Setpoint".to_string(), PointValueData::I16(42))]
    );

    let err = driver
        .write_point(&ctx, &setpoint, &json!(40_000))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Conversion { .. }));

    *state.write_status.lock() = Some(0x8074_0000);
    let err = driver.write_point(&ctx, &setpoint, &json!(7)).await.unwrap_err();
    assert!(matches!(err, DriverError::Status { code: 0x8074_0000, .. }));
    assert_eq!(state.writes.lock().len(), 1);
}

#[tokio::test]
async fn devices_on_same_endpoint_share_client() {
    let (driver, state) = driver().await;

    driver
        .set_device_config(&config(json!({"device_id": "chiller"})))
        .await
        .unwrap();
    assert_eq!(driver.client_count(), 1);
    assert_eq!(state.connects.load(Ordering::SeqCst), 1);

    driver
        .set_device_config(&config(json!({"endpoint": "opc.tcp://plc-2:4840"})))
        .await
        .unwrap();
    assert_eq!(driver.client_count(), 2);

    assert!(driver
        .set_device_config(&config(json!({"endpoint": "http://plc"})))
        .await
        .is_err());
}

#[tokio::test]
async fn disconnect_closes_sessions() {
    let (driver, state) = driver().await;
    let ctx = DriverContext::default();
    driver.read_points(&ctx, &[temp()]).await.unwrap();

    driver.disconnect().await.unwrap();
    assert_eq!(state.closes.load(Ordering::SeqCst), 1);
    assert_eq!(driver.client_count(), 0);
    assert_eq!(driver.health(), HealthStatus::Unknown);
}

#[tokio::test]
async fn disconnect_waits_for_reconnect_in_flight() {
    let (driver, state) = driver().await;
    let ctx = DriverContext::default();
    state.drop_sessions();
    *state.connect_delay.lock() = Some(Duration::from_millis(100));

    let points = [temp()];
    let (_read, disconnected) = tokio::join!(driver.read_points(&ctx, &points), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        driver.disconnect().await
    });
    disconnected.unwrap();

    // 重连建立的会话同样被关闭
    assert_eq!(state.connects.load(Ordering::SeqCst), 2);
    assert_eq!(state.closes.load(Ordering::SeqCst), 2);
    assert!(state.sessions.lock().iter().all(|s| !s.is_connected()));
    assert_eq!(driver.client_count(), 0);
}

fn entry(node_id: &str, name: &str, kind: NodeKind) -> BrowseEntry {
    BrowseEntry {
        node_id: node_id.to_string(),
        browse_name: name.to_string(),
        display_name: name.to_string(),
        kind,
    }
}

#[tokio::test]
async fn browse_retries_after_reconnect() {
    let (driver, state) = driver().await;
    {
        let mut tree = state.tree.lock();
        tree.insert(
            "ns=0;i=85".to_string(),
            vec![
                entry("ns=2;s=Line1", "Line1", NodeKind::Object),
                entry("ns=0;i=11715", "GetMonitoredItems", NodeKind::Other),
            ],
        );
        tree.insert(
            "ns=2;s=Line1".to_string(),
            vec![
                entry("ns=2;s=Line1.Temp", "Temp", NodeKind::Variable),
                // 回指根节点的引用不会重复访问
                entry("ns=0;i=85", "Objects", NodeKind::Object),
            ],
        );
    }
    state.browse_failures.store(1, Ordering::SeqCst);

    let scanner = driver.as_object_scanner().unwrap();
    let result = scanner
        .scan_objects(&DriverContext::default(), &Map::new())
        .await
        .unwrap();
    let nodes = result.as_array().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0]["node_id"], json!("ns=2;s=Line1"));
    assert_eq!(nodes[0]["node_class"], json!("Object"));
    assert_eq!(nodes[0]["data_type"], Value::Null);
    assert_eq!(nodes[1]["path"], json!("Line1/Temp"));
    assert_eq!(nodes[1]["data_type"], json!("Double"));

    // 驱动会话 1 次，扫描会话 1 次，重试重连 1 次
    assert_eq!(state.connects.load(Ordering::SeqCst), 3);
    assert_eq!(driver.client_count(), 1);
}

#[tokio::test]
async fn browse_gives_up_after_retries() {
    let (driver, state) = driver().await;
    state.browse_failures.store(10, Ordering::SeqCst);

    let err = driver
        .as_object_scanner()
        .unwrap()
        .scan_objects(&DriverContext::default(), &Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Connection(_)));
    assert_eq!(state.browse_failures.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn direct_reads_without_subscription() {
    let (driver, state) = driver().await;
    let ctx = DriverContext::default();
    driver
        .set_device_config(&config(json!({"use_subscription": false})))
        .await
        .unwrap();

    driver.read_points(&ctx, &[temp()]).await.unwrap();
    driver.read_points(&ctx, &[temp()]).await.unwrap();
    assert_eq!(state.direct_reads.load(Ordering::SeqCst), 2);
    assert_eq!(state.subscribe_count(), 0);
}
