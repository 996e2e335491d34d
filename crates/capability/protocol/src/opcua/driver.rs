//! OPC-UA 驱动：端点客户端表、设备订阅、读写与地址空间扫描

use super::backend::AsyncOpcuaConnector;
use super::browse::Browser;
use super::session::{EndpointConfig, SecurityMode, SecurityPolicy, UaConnector, UaSession};
use super::subscription::{subscription_key, DeviceSubscription};
use crate::cast::cast_value;
use crate::driver::{Driver, ObjectScanner};
use crate::error::DriverError;
use crate::types::{now_epoch_ms, DriverContext, DriverTuning, HealthStatus};
use async_trait::async_trait;
use domain::{map_bool, map_str, DriverConfig, Point, PointValue};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// 标准 Objects 文件夹
pub const DEFAULT_ROOT_NODE: &str = "ns=0;i=85";
const DEFAULT_DEVICE: &str = "default";

/// 当前绑定的设备
#[derive(Debug, Clone, PartialEq)]
struct DeviceBinding {
    endpoint: EndpointConfig,
    device_id: String,
    root_node: String,
    use_subscription: bool,
}

impl DeviceBinding {
    fn from_map(map: &Map<String, Value>, tuning: &DriverTuning) -> Result<Self, DriverError> {
        let url = map_str(map, "endpoint")
            .or_else(|| map_str(map, "url"))
            .ok_or_else(|| DriverError::ConfigParse("missing endpoint".to_string()))?;
        if !url.starts_with("opc.tcp://") {
            return Err(DriverError::ConfigParse(format!(
                "endpoint must start with opc.tcp://: {url}"
            )));
        }
        let endpoint = EndpointConfig {
            url,
            security_policy: map_str(map, "security_policy")
                .map(|s| s.parse::<SecurityPolicy>())
                .transpose()?
                .unwrap_or_default(),
            security_mode: map_str(map, "security_mode")
                .map(|s| s.parse::<SecurityMode>())
                .transpose()?
                .unwrap_or_default(),
            username: map_str(map, "username"),
            password: map_str(map, "password"),
        };
        Ok(Self {
            endpoint,
            device_id: map_str(map, "device_id").unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            root_node: map_str(map, "root_node_id").unwrap_or_else(|| DEFAULT_ROOT_NODE.to_string()),
            use_subscription: map_bool(map, "use_subscription").unwrap_or(tuning.opcua_use_subscription),
        })
    }
}

/// 一个端点 URL 对应的会话及其设备订阅
pub struct ClientWrapper {
    endpoint: EndpointConfig,
    session: RwLock<Option<Arc<dyn UaSession>>>,
    /// 串行化建连，避免同一端点并发创建多个会话
    connecting: tokio::sync::Mutex<()>,
    /// 串行化订阅重建
    subscribing: tokio::sync::Mutex<()>,
    subscriptions: Mutex<HashMap<String, Arc<DeviceSubscription>>>,
    next_handle: AtomicU32,
    /// 已关闭的客户端不再建连或建订阅
    closed: AtomicBool,
}

impl ClientWrapper {
    fn new(endpoint: EndpointConfig) -> Self {
        Self {
            endpoint,
            session: RwLock::new(None),
            connecting: tokio::sync::Mutex::new(()),
            subscribing: tokio::sync::Mutex::new(()),
            subscriptions: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn live_session(&self) -> Option<Arc<dyn UaSession>> {
        self.session
            .read()
            .as_ref()
            .filter(|s| s.is_connected())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.live_session().is_some()
    }

    /// 返回可用会话，必要时重新建立；网络 IO 期间不持有任何同步锁
    async fn ensure_connected(&self, connector: &dyn UaConnector) -> Result<Arc<dyn UaSession>, DriverError> {
        if let Some(session) = self.live_session() {
            return Ok(session);
        }
        let _guard = self.connecting.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::NotConnected);
        }
        if let Some(session) = self.live_session() {
            return Ok(session);
        }
        let stale = self.session.write().take();
        if let Some(stale) = stale {
            gw_telemetry::record_reconnect();
            self.cancel_subscriptions();
            stale.close().await;
        }
        let session = connector.connect(&self.endpoint).await?;
        *self.session.write() = Some(session.clone());
        Ok(session)
    }

    /// 会话出错后丢弃，下次调用重新建连
    fn invalidate(&self) {
        let dropped = self.session.write().take();
        if dropped.is_some() {
            self.cancel_subscriptions();
            tracing::warn!(endpoint = %self.endpoint.url, "opc-ua session invalidated");
        }
    }

    fn cancel_subscriptions(&self) {
        let subs: Vec<Arc<DeviceSubscription>> =
            self.subscriptions.lock().drain().map(|(_, sub)| sub).collect();
        for sub in subs {
            sub.cancel();
        }
    }

    /// 等待进行中的建连与订阅重建结束后再关闭，避免其结果在关闭后才落地
    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let _connecting = self.connecting.lock().await;
        let _subscribing = self.subscribing.lock().await;
        self.cancel_subscriptions();
        let session = self.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// 同一点位集合复用现有订阅；集合变化时取消旧订阅并整体重建
    async fn ensure_subscription(
        &self,
        session: &Arc<dyn UaSession>,
        device_id: &str,
        points: &[Point],
        tuning: &DriverTuning,
    ) -> Result<Arc<DeviceSubscription>, DriverError> {
        let key = subscription_key(points);
        let _guard = self.subscribing.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::NotConnected);
        }

        let existing = self.subscriptions.lock().get(device_id).cloned();
        if let Some(existing) = existing {
            if existing.matches(&key) && !existing.is_cancelled() {
                return Ok(existing);
            }
            self.subscriptions.lock().remove(device_id);
            existing.cancel();
            gw_telemetry::record_subscription_rebuild();
            tracing::info!(device_id, subscription_id = existing.subscription_id(), "opc-ua point set changed, rebuilding subscription");
            if let Err(err) = session.unsubscribe(existing.subscription_id()).await {
                tracing::warn!(device_id, error = %err, "failed to delete old subscription");
            }
        }

        let sub = DeviceSubscription::create(session, points, tuning, &self.next_handle).await?;
        self.subscriptions
            .lock()
            .insert(device_id.to_string(), sub.clone());
        Ok(sub)
    }
}

/// OPC-UA 驱动
pub struct OpcUaDriver {
    tuning: DriverTuning,
    connector: Arc<dyn UaConnector>,
    config: RwLock<Map<String, Value>>,
    binding: RwLock<Option<DeviceBinding>>,
    clients: Mutex<HashMap<String, Arc<ClientWrapper>>>,
}

impl OpcUaDriver {
    pub fn new(tuning: DriverTuning) -> Self {
        let connector = Arc::new(AsyncOpcuaConnector::new(tuning.opcua_connect_timeout));
        Self::with_connector(tuning, connector)
    }

    pub fn with_connector(tuning: DriverTuning, connector: Arc<dyn UaConnector>) -> Self {
        Self {
            tuning,
            connector,
            config: RwLock::new(Map::new()),
            binding: RwLock::new(None),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn binding(&self) -> Result<DeviceBinding, DriverError> {
        self.binding
            .read()
            .clone()
            .ok_or_else(|| DriverError::ConfigParse("opc-ua driver has no endpoint configured".to_string()))
    }

    /// 按端点查找或创建客户端；返回 (客户端, 是否新建)
    fn client_for(&self, endpoint: &EndpointConfig) -> (Arc<ClientWrapper>, bool) {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&endpoint.url) {
            return (client.clone(), false);
        }
        let client = Arc::new(ClientWrapper::new(endpoint.clone()));
        clients.insert(endpoint.url.clone(), client.clone());
        (client, true)
    }

    /// 已建立的端点数量
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    async fn session(&self, ctx: &DriverContext, client: &ClientWrapper) -> Result<Arc<dyn UaSession>, DriverError> {
        ctx.run(client.ensure_connected(self.connector.as_ref()))
            .await
            .map_err(|err| match err {
                DriverError::Cancelled | DriverError::Connection(_) => err,
                other => DriverError::Connection(other.to_string()),
            })
    }

    async fn read_direct(
        &self,
        ctx: &DriverContext,
        client: &ClientWrapper,
        session: &Arc<dyn UaSession>,
        points: &[Point],
    ) -> Result<HashMap<String, PointValue>, DriverError> {
        let nodes: Vec<String> = points.iter().map(|p| p.address.trim().to_string()).collect();
        let readings = match ctx.run(session.read_values(&nodes)).await {
            Ok(readings) => readings,
            Err(err) => {
                if !session.is_connected() || err.is_retryable() {
                    client.invalidate();
                }
                return Err(err);
            }
        };
        let now = now_epoch_ms();
        let mut values = HashMap::with_capacity(points.len());
        for (i, point) in points.iter().enumerate() {
            let value = match readings.get(i) {
                Some(r) if r.good => PointValue::good(point.id.clone(), r.value.clone(), r.source_ts_ms.unwrap_or(now)),
                Some(r) => {
                    tracing::debug!(point_id = %point.id, status = r.status, "opc-ua bad read");
                    PointValue::bad(point.id.clone(), r.source_ts_ms.unwrap_or(now))
                }
                None => PointValue::bad(point.id.clone(), now),
            };
            values.insert(point.id.clone(), value);
        }
        Ok(values)
    }
}

fn record_read(values: &HashMap<String, PointValue>) {
    let bad = values.values().filter(|v| !v.is_good()).count();
    gw_telemetry::record_points_read(values.len(), bad);
}

#[async_trait]
impl Driver for OpcUaDriver {
    fn init(&mut self, config: &DriverConfig) -> Result<(), DriverError> {
        let binding = DeviceBinding::from_map(&config.config, &self.tuning)?;
        *self.config.write() = config.config.clone();
        *self.binding.write() = Some(binding);
        Ok(())
    }

    async fn connect(&self, ctx: &DriverContext) -> Result<(), DriverError> {
        let binding = self.binding()?;
        let (client, _) = self.client_for(&binding.endpoint);
        self.session(ctx, &client).await?;
        tracing::info!(endpoint = %binding.endpoint.url, device_id = %binding.device_id, "opc-ua driver connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        let clients: Vec<Arc<ClientWrapper>> =
            self.clients.lock().drain().map(|(_, client)| client).collect();
        futures::future::join_all(clients.iter().map(|client| client.shutdown())).await;
        tracing::info!("opc-ua driver disconnected");
        Ok(())
    }

    fn health(&self) -> HealthStatus {
        let Some(binding) = self.binding.read().clone() else {
            return HealthStatus::Unknown;
        };
        match self.clients.lock().get(&binding.endpoint.url) {
            Some(client) if client.is_connected() => HealthStatus::Good,
            Some(_) => HealthStatus::Bad,
            None => HealthStatus::Unknown,
        }
    }

    async fn set_device_config(&self, config: &Map<String, Value>) -> Result<(), DriverError> {
        let merged = {
            let mut merged = self.config.read().clone();
            for (k, v) in config {
                merged.insert(k.clone(), v.clone());
            }
            merged
        };
        let binding = DeviceBinding::from_map(&merged, &self.tuning)?;
        let (client, created) = self.client_for(&binding.endpoint);
        *self.config.write() = merged;
        *self.binding.write() = Some(binding.clone());

        if !created && !client.is_connected() {
            let connector = self.connector.clone();
            let timeout = self.tuning.opcua_reconnect_timeout;
            let url = binding.endpoint.url.clone();
            tracing::info!(endpoint = %url, "opc-ua background reconnect scheduled");
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, client.ensure_connected(connector.as_ref())).await {
                    Ok(Ok(_)) => tracing::info!(endpoint = %url, "opc-ua background reconnect succeeded"),
                    Ok(Err(err)) => tracing::warn!(endpoint = %url, error = %err, "opc-ua background reconnect failed"),
                    Err(_) => tracing::warn!(endpoint = %url, timeout_ms = timeout.as_millis() as u64, "opc-ua background reconnect timed out"),
                }
            });
        }
        Ok(())
    }

    async fn read_points(
        &self,
        ctx: &DriverContext,
        points: &[Point],
    ) -> Result<HashMap<String, PointValue>, DriverError> {
        if points.is_empty() {
            return Ok(HashMap::new());
        }
        let binding = self.binding()?;
        let (client, _) = self.client_for(&binding.endpoint);
        let session = self.session(ctx, &client).await?;

        if binding.use_subscription {
            match ctx
                .run(client.ensure_subscription(&session, &binding.device_id, points, &self.tuning))
                .await
            {
                Ok(sub) => {
                    if let Some(values) = sub.cached(points) {
                        record_read(&values);
                        return Ok(values);
                    }
                    tracing::debug!(device_id = %binding.device_id, "cache incomplete, reading directly");
                }
                Err(DriverError::Cancelled) => return Err(DriverError::Cancelled),
                Err(err) => {
                    tracing::warn!(device_id = %binding.device_id, error = %err, "opc-ua subscription unavailable, reading directly");
                }
            }
        }

        let values = self.read_direct(ctx, &client, &session, points).await?;
        record_read(&values);
        Ok(values)
    }

    async fn write_point(
        &self,
        ctx: &DriverContext,
        point: &Point,
        value: &Value,
    ) -> Result<(), DriverError> {
        let data = cast_value(value, point.data_type).inspect_err(|_| gw_telemetry::record_write_failure())?;
        let binding = self.binding()?;
        let (client, _) = self.client_for(&binding.endpoint);
        let session = self
            .session(ctx, &client)
            .await
            .inspect_err(|_| gw_telemetry::record_write_failure())?;

        match ctx.run(session.write_value(point.address.trim(), &data)).await {
            Ok(()) => {
                gw_telemetry::record_write_success();
                tracing::info!(point_id = %point.id, node_id = %point.address, value = %data, "opc-ua write ok");
                Ok(())
            }
            Err(err) => {
                gw_telemetry::record_write_failure();
                tracing::warn!(point_id = %point.id, node_id = %point.address, error = %err, "opc-ua write failed");
                Err(err)
            }
        }
    }

    fn as_object_scanner(&self) -> Option<&dyn ObjectScanner> {
        Some(self)
    }
}

#[async_trait]
impl ObjectScanner for OpcUaDriver {
    async fn scan_objects(
        &self,
        ctx: &DriverContext,
        params: &Map<String, Value>,
    ) -> Result<Value, DriverError> {
        let scan_id = gw_telemetry::new_scan_id();
        let mut merged = self.config.read().clone();
        for (k, v) in params {
            merged.insert(k.clone(), v.clone());
        }
        let binding = DeviceBinding::from_map(&merged, &self.tuning)?;
        tracing::info!(%scan_id, endpoint = %binding.endpoint.url, root = %binding.root_node, "opc-ua object scan started");

        // 独立会话，不进入共享客户端表
        let session = ctx.run(self.connector.connect(&binding.endpoint)).await?;
        let mut browser = Browser::new(
            ctx,
            self.connector.as_ref(),
            &binding.endpoint,
            session,
            self.tuning.opcua_browse_retries,
            self.tuning.opcua_browse_max_depth,
        );
        let result = browser.browse_tree(&binding.root_node).await;
        browser.session().close().await;
        let nodes = result?;

        let count = nodes.len();
        let records = serde_json::to_value(&nodes)
            .map_err(|e| DriverError::DataParse(format!("serialize scan result: {e}")))?;
        tracing::info!(%scan_id, nodes = count, "opc-ua object scan finished");
        Ok(records)
    }
}
