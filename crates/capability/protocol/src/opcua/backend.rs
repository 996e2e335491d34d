//! 基于 async-opcua 的会话实现

use super::session::{
    BrowseEntry, EndpointConfig, NodeKind, Notification, SecurityMode, SecurityPolicy,
    SubscriptionRequest, UaConnector, UaReading, UaSession,
};
use super::variant::{data_type_name, reading_from_data_value, value_to_variant};
use crate::error::DriverError;
use async_trait::async_trait;
use domain::PointValueData;
use opcua::client::{
    ClientBuilder, IdentityToken, MonitoredItem, Password, Session, SubscriptionCallbacks,
};
use opcua::crypto::SecurityPolicy as UaSecurityPolicy;
use opcua::types::{
    enums::MonitoringMode, AttributeId, BrowseDescription, BrowseDirection, BrowseResultMask,
    ByteString, DataValue, MessageSecurityMode, MonitoredItemCreateRequest, MonitoringParameters,
    NodeClass, NodeId, ReadValueId, ReferenceDescription, ReferenceTypeId, StatusCode,
    TimestampsToReturn, Variant, WriteValue,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

fn status_error(code: StatusCode) -> DriverError {
    DriverError::Status {
        code: code.bits(),
        message: code.to_string(),
    }
}

fn ua_policy(policy: SecurityPolicy) -> UaSecurityPolicy {
    match policy {
        SecurityPolicy::None => UaSecurityPolicy::None,
        SecurityPolicy::Basic128Rsa15 => UaSecurityPolicy::Basic128Rsa15,
        SecurityPolicy::Basic256 => UaSecurityPolicy::Basic256,
        SecurityPolicy::Basic256Sha256 => UaSecurityPolicy::Basic256Sha256,
        SecurityPolicy::Aes128Sha256RsaOaep => UaSecurityPolicy::Aes128Sha256RsaOaep,
        SecurityPolicy::Aes256Sha256RsaPss => UaSecurityPolicy::Aes256Sha256RsaPss,
    }
}

fn ua_mode(mode: SecurityMode) -> MessageSecurityMode {
    match mode {
        SecurityMode::None => MessageSecurityMode::None,
        SecurityMode::Sign => MessageSecurityMode::Sign,
        SecurityMode::SignAndEncrypt => MessageSecurityMode::SignAndEncrypt,
    }
}

fn parse_node_id(text: &str) -> Result<NodeId, DriverError> {
    NodeId::from_str(text.trim())
        .map_err(|_| DriverError::ConfigParse(format!("invalid node id: {text}")))
}

/// 每次连接创建独立的 async-opcua 客户端
#[derive(Debug, Clone)]
pub struct AsyncOpcuaConnector {
    application_name: String,
    connect_timeout: Duration,
}

impl AsyncOpcuaConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            application_name: "gw-protocol".to_string(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl UaConnector for AsyncOpcuaConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn UaSession>, DriverError> {
        let secure = endpoint.security_policy != SecurityPolicy::None
            || endpoint.security_mode != SecurityMode::None;
        let mut client = ClientBuilder::new()
            .application_name(self.application_name.as_str())
            .application_uri(format!("urn:{}", self.application_name))
            .pki_dir("./pki")
            .session_retry_limit(0)
            .keep_alive_interval(KEEP_ALIVE_INTERVAL)
            .trust_server_certs(secure)
            .create_sample_keypair(secure)
            .client()
            .map_err(|e| DriverError::Connection(format!("opc-ua client config: {}", e.join(", "))))?;

        let identity = match (&endpoint.username, &endpoint.password) {
            (Some(user), password) if !user.is_empty() => IdentityToken::UserName(
                user.clone(),
                Password::new(password.clone().unwrap_or_default()),
            ),
            _ => IdentityToken::Anonymous,
        };

        let url = endpoint.url.trim();
        let endpoints = client
            .get_server_endpoints_from_url(url)
            .await
            .map_err(|e| DriverError::Connection(format!("get endpoints from {url}: {e}")))?;

        let desired_policy = ua_policy(endpoint.security_policy);
        let desired_mode = ua_mode(endpoint.security_mode);
        let selected = endpoints
            .into_iter()
            .find(|ep| {
                ep.security_mode == desired_mode
                    && UaSecurityPolicy::from_uri(ep.security_policy_uri.as_ref()) == desired_policy
            })
            .ok_or_else(|| {
                DriverError::Connection(format!(
                    "no endpoint at {url} matches policy {:?} and mode {:?}",
                    endpoint.security_policy, endpoint.security_mode
                ))
            })?;

        let (session, event_loop) = client
            .connect_to_endpoint_directly(selected, identity)
            .map_err(|e| DriverError::Connection(format!("connect {url}: {e}")))?;
        let event_loop = event_loop.spawn();

        let connected = tokio::time::timeout(self.connect_timeout, session.wait_for_connection())
            .await
            .unwrap_or(false);
        if !connected {
            session.disable_reconnects();
            event_loop.abort();
            return Err(DriverError::Connection(format!(
                "session to {url} not activated within {} ms",
                self.connect_timeout.as_millis()
            )));
        }

        tracing::info!(endpoint = url, policy = ?endpoint.security_policy, mode = ?endpoint.security_mode, "opc-ua session established");
        Ok(Arc::new(AsyncOpcuaSession { session, event_loop }))
    }
}

/// 已激活的会话及其事件循环
pub struct AsyncOpcuaSession {
    session: Arc<Session>,
    event_loop: JoinHandle<StatusCode>,
}

impl AsyncOpcuaSession {
    async fn browse_next(&self, mut continuation: ByteString, out: &mut Vec<ReferenceDescription>) -> Result<(), DriverError> {
        while !continuation.is_null() {
            let results = self
                .session
                .browse_next(false, &[continuation.clone()])
                .await
                .map_err(status_error)?;
            let Some(result) = results.into_iter().next() else {
                break;
            };
            out.extend(result.references.unwrap_or_default());
            continuation = result.continuation_point;
        }
        Ok(())
    }
}

fn browse_entry(reference: ReferenceDescription) -> BrowseEntry {
    let kind = match reference.node_class {
        NodeClass::Object => NodeKind::Object,
        NodeClass::Variable => NodeKind::Variable,
        _ => NodeKind::Other,
    };
    BrowseEntry {
        node_id: reference.node_id.node_id.to_string(),
        browse_name: reference.browse_name.name.as_ref().to_string(),
        display_name: reference.display_name.text.as_ref().to_string(),
        kind,
    }
}

#[async_trait]
impl UaSession for AsyncOpcuaSession {
    async fn read_values(&self, nodes: &[String]) -> Result<Vec<UaReading>, DriverError> {
        let mut readings: Vec<Option<UaReading>> = vec![None; nodes.len()];
        let mut positions = Vec::with_capacity(nodes.len());
        let mut requests = Vec::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            match parse_node_id(node) {
                Ok(id) => {
                    positions.push(i);
                    requests.push(ReadValueId::new_value(id));
                }
                Err(_) => {
                    readings[i] = Some(UaReading::bad(StatusCode::BadNodeIdInvalid.bits()));
                }
            }
        }
        if !requests.is_empty() {
            let values = self
                .session
                .read(&requests, TimestampsToReturn::Both, 0.0)
                .await
                .map_err(status_error)?;
            for (pos, dv) in positions.into_iter().zip(values.iter()) {
                readings[pos] = Some(reading_from_data_value(dv));
            }
        }
        Ok(readings
            .into_iter()
            .map(|r| r.unwrap_or_else(|| UaReading::bad(StatusCode::BadNoData.bits())))
            .collect())
    }

    async fn write_value(&self, node: &str, value: &PointValueData) -> Result<(), DriverError> {
        let node_id = parse_node_id(node)?;
        let results = self
            .session
            .write(&[WriteValue::value_attr(node_id, value_to_variant(value))])
            .await
            .map_err(status_error)?;
        match results.into_iter().next() {
            Some(status) if status.is_good() => Ok(()),
            Some(status) => Err(status_error(status)),
            None => Err(DriverError::DataParse(format!("empty write response for {node}"))),
        }
    }

    async fn read_data_types(&self, nodes: &[String]) -> Result<Vec<Option<String>>, DriverError> {
        let mut out = vec![None; nodes.len()];
        let mut positions = Vec::with_capacity(nodes.len());
        let mut requests = Vec::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if let Ok(id) = parse_node_id(node) {
                positions.push(i);
                requests.push(ReadValueId {
                    node_id: id,
                    attribute_id: AttributeId::DataType as u32,
                    ..Default::default()
                });
            }
        }
        if requests.is_empty() {
            return Ok(out);
        }
        let values: Vec<DataValue> = self
            .session
            .read(&requests, TimestampsToReturn::Neither, 0.0)
            .await
            .map_err(status_error)?;
        for (pos, dv) in positions.into_iter().zip(values.iter()) {
            if let Some(Variant::NodeId(id)) = dv.value.as_ref() {
                out[pos] = Some(data_type_name(id));
            }
        }
        Ok(out)
    }

    async fn browse(&self, node: &str) -> Result<Vec<BrowseEntry>, DriverError> {
        let node_id = parse_node_id(node)?;
        let description = BrowseDescription {
            node_id,
            browse_direction: BrowseDirection::Forward,
            reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
            include_subtypes: true,
            node_class_mask: 0,
            result_mask: BrowseResultMask::All as u32,
        };
        let results = self
            .session
            .browse(&[description], 0, None)
            .await
            .map_err(status_error)?;
        let Some(result) = results.into_iter().next() else {
            return Ok(Vec::new());
        };
        if !result.status_code.is_good() {
            return Err(status_error(result.status_code));
        }
        let mut references = result.references.unwrap_or_default();
        self.browse_next(result.continuation_point, &mut references).await?;
        Ok(references.into_iter().map(browse_entry).collect())
    }

    async fn subscribe(
        &self,
        request: SubscriptionRequest,
        sink: mpsc::Sender<Notification>,
    ) -> Result<u32, DriverError> {
        let mut reqs = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let Ok(node_id) = parse_node_id(&item.node_id) else {
                tracing::warn!(node_id = %item.node_id, "skipping invalid node id in subscription");
                continue;
            };
            reqs.push(MonitoredItemCreateRequest {
                item_to_monitor: ReadValueId::new_value(node_id),
                monitoring_mode: MonitoringMode::Reporting,
                requested_parameters: MonitoringParameters {
                    client_handle: item.handle,
                    sampling_interval: request.sampling_interval_ms,
                    filter: Default::default(),
                    queue_size: request.queue_size,
                    discard_oldest: true,
                },
            });
        }

        // 同一节点可能被多个点位监视，按客户端句柄区分
        let callbacks = SubscriptionCallbacks::new(
            |_status| {},
            move |dv: DataValue, item: &MonitoredItem| {
                let handle = item.client_handle();
                let notification = Notification {
                    handle,
                    reading: reading_from_data_value(&dv),
                };
                if let Err(TrySendError::Full(_)) = sink.try_send(notification) {
                    gw_telemetry::record_notification_dropped();
                    tracing::warn!(handle, "opc-ua notification queue full, dropping value");
                }
            },
            |_event, _item| {},
        );

        let subscription_id = self
            .session
            .create_subscription(request.publish_interval, 60, 20, 0, 0, true, callbacks)
            .await
            .map_err(status_error)?;
        let session = self.session.clone();
        let created = CreatedSubscription::new(subscription_id, move |id| {
            tracing::warn!(subscription_id = id, "subscription setup abandoned, deleting");
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(status) = session.delete_subscription(id).await {
                        tracing::warn!(subscription_id = id, %status, "failed to delete abandoned subscription");
                    }
                });
            }
        });

        if !reqs.is_empty() {
            let results = match self
                .session
                .create_monitored_items(subscription_id, TimestampsToReturn::Both, reqs)
                .await
            {
                Ok(results) => results,
                Err(status) => {
                    let id = created.keep();
                    if let Err(err) = self.session.delete_subscription(id).await {
                        tracing::warn!(subscription_id = id, status = %err, "failed to delete subscription");
                    }
                    return Err(status_error(status));
                }
            };
            for res in results {
                let status = res.result.status_code;
                if !status.is_good() {
                    tracing::warn!(
                        subscription_id,
                        handle = res.requested_parameters.client_handle,
                        %status,
                        "monitored item rejected"
                    );
                }
            }
        }
        Ok(created.keep())
    }

    async fn unsubscribe(&self, subscription_id: u32) -> Result<(), DriverError> {
        self.session
            .delete_subscription(subscription_id)
            .await
            .map(|_| ())
            .map_err(status_error)
    }

    fn is_connected(&self) -> bool {
        !self.event_loop.is_finished()
    }

    async fn close(&self) {
        self.session.disable_reconnects();
        let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, self.session.disconnect()).await;
        self.event_loop.abort();
    }
}

/// 已在服务端创建、尚未交给调用方的订阅
///
/// 在 `keep` 之前被丢弃（出错返回、超时、取消）时执行清理，避免服务端残留订阅。
struct CreatedSubscription<F: FnOnce(u32)> {
    id: u32,
    cleanup: Option<F>,
}

impl<F: FnOnce(u32)> CreatedSubscription<F> {
    fn new(id: u32, cleanup: F) -> Self {
        Self {
            id,
            cleanup: Some(cleanup),
        }
    }

    fn keep(mut self) -> u32 {
        self.cleanup = None;
        self.id
    }
}

impl<F: FnOnce(u32)> Drop for CreatedSubscription<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DriverContext;
    use parking_lot::Mutex;

    #[test]
    fn dropped_subscription_is_cleaned_up() {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        {
            let deleted = deleted.clone();
            let _created = CreatedSubscription::new(7, move |id| deleted.lock().push(id));
        }
        assert_eq!(*deleted.lock(), vec![7]);

        let sink = deleted.clone();
        let created = CreatedSubscription::new(8, move |id| sink.lock().push(id));
        assert_eq!(created.keep(), 8);
        assert_eq!(*deleted.lock(), vec![7]);
    }

    #[tokio::test]
    async fn timed_out_setup_releases_subscription() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = DriverContext::new(Duration::from_millis(50));
        let setup = async move {
            let created = CreatedSubscription::new(9, move |id| {
                let _ = tx.send(id);
            });
            // 监视项创建迟迟不返回
            std::future::pending::<()>().await;
            Ok::<_, DriverError>(created.keep())
        };
        assert!(matches!(ctx.run(setup).await, Err(DriverError::Timeout(_))));
        assert_eq!(rx.recv().await, Some(9));
    }

    #[tokio::test]
    async fn cancelled_setup_releases_subscription() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = DriverContext::new(Duration::from_secs(5));
        ctx.cancel.cancel();
        let setup = async move {
            let created = CreatedSubscription::new(10, move |id| {
                let _ = tx.send(id);
            });
            std::future::pending::<()>().await;
            Ok::<_, DriverError>(created.keep())
        };
        assert!(matches!(ctx.run(setup).await, Err(DriverError::Cancelled)));
        assert_eq!(rx.recv().await, Some(10));
    }
}
