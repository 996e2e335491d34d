//! BACnet/IP UDP 客户端
//!
//! 一个驱动实例持有一个 socket。接收任务统一收包并按 invoke ID 分发应答：
//!
//! ```text
//! confirmed() ──send_to──► 设备
//!     │ 注册 pending[invoke_id] = oneshot
//!     ▼
//! receive_loop ──► ACK / Error / Reject / Abort ──► pending.remove(invoke_id).send()
//!              └─► I-Am ──► broadcast::Sender<DiscoveredDevice>
//! ```
//!
//! 超时后只做一次备用路径重试（非标准端口的设备改走 47808，否则原路重发），
//! 重试仍失败则把超时交给调用方。两次尝试共用调用方给出的时间预算：
//! 首次最多占一半，重试使用剩余部分，单次都不超过客户端超时。

use super::codec::{
    self, decode_apdu, decode_frame, decode_i_am, Apdu, BacnetValue, CodecError, ObjectId,
    ReadPropertyAck, BACNET_PORT,
};
use crate::error::DriverError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

const RECV_BUFFER: usize = 1500;

/// 应答内容（错误类 PDU 已转换为 `DriverError`）
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    SimpleAck,
    ComplexAck { service: u8, payload: Vec<u8> },
}

/// 收到的 I-Am
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub instance: u32,
    pub addr: SocketAddr,
    /// 经路由器转发时的源网络号
    pub network: Option<u16>,
    pub max_apdu: u32,
    pub segmentation: u32,
    pub vendor_id: u32,
}

/// Who-Is 目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Broadcast(SocketAddr),
    Unicast(SocketAddr),
}

type Pending = Arc<Mutex<HashMap<u8, oneshot::Sender<Result<Response, DriverError>>>>>;

pub struct BacnetClient {
    socket: Arc<UdpSocket>,
    pending: Pending,
    next_invoke: AtomicU8,
    i_am_tx: broadcast::Sender<DiscoveredDevice>,
    shutdown: CancellationToken,
    timeout: Duration,
}

/// 请求结束（含取消、超时）时清理 pending 表项
struct PendingSlot<'a> {
    pending: &'a Pending,
    invoke_id: u8,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.invoke_id);
    }
}

impl BacnetClient {
    /// 绑定本地地址并启动接收任务；端口被占用时退回临时端口
    pub async fn bind(local: SocketAddr, timeout: Duration) -> Result<Arc<Self>, DriverError> {
        let socket = match UdpSocket::bind(local).await {
            Ok(socket) => socket,
            Err(err) if local.port() != 0 => {
                tracing::warn!(%local, error = %err, "bacnet port busy, using ephemeral port");
                UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?
            }
            Err(err) => return Err(err.into()),
        };
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);
        let (i_am_tx, _) = broadcast::channel(256);
        let client = Arc::new(Self {
            socket: socket.clone(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_invoke: AtomicU8::new(0),
            i_am_tx: i_am_tx.clone(),
            shutdown: CancellationToken::new(),
            timeout,
        });
        tokio::spawn(receive_loop(
            socket,
            client.pending.clone(),
            i_am_tx,
            client.shutdown.clone(),
        ));
        tracing::info!(local = ?client.local_addr().ok(), "bacnet client bound");
        Ok(client)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DriverError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 停止接收任务，所有等待中的请求以 `ChannelClosed` 结束
    pub fn close(&self) {
        self.shutdown.cancel();
        self.pending.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn allocate_invoke_id(&self) -> Result<u8, DriverError> {
        let pending = self.pending.lock();
        for _ in 0..=u8::MAX {
            let id = self.next_invoke.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(DriverError::Connection(
            "no free invoke id (256 requests in flight)".to_string(),
        ))
    }

    async fn transact(
        &self,
        target: SocketAddr,
        wait: Duration,
        encode: &(dyn Fn(u8) -> Result<Vec<u8>, CodecError> + Sync),
    ) -> Result<Response, DriverError> {
        if self.is_closed() {
            return Err(DriverError::NotConnected);
        }
        let invoke_id = self.allocate_invoke_id()?;
        let packet = encode(invoke_id)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(invoke_id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            invoke_id,
        };
        self.socket.send_to(&packet, target).await?;
        tracing::trace!(%target, invoke_id, "bacnet request sent");
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DriverError::ChannelClosed),
            Err(_) => Err(DriverError::Timeout(format!(
                "no reply from {target} (invoke_id={invoke_id})"
            ))),
        }
    }

    /// 带一次备用路径重试的确认请求；返回应答与实际应答的地址
    ///
    /// `budget` 是整个调用（含重试）允许的时长，通常取 `DriverContext::timeout`。
    pub async fn confirmed(
        &self,
        target: SocketAddr,
        budget: Duration,
        encode: &(dyn Fn(u8) -> Result<Vec<u8>, CodecError> + Sync),
    ) -> Result<(Response, SocketAddr), DriverError> {
        let started = Instant::now();
        let (first, _) = attempt_waits(self.timeout, budget);
        match self.transact(target, first, encode).await {
            Err(DriverError::Timeout(reason)) => {
                gw_telemetry::record_bacnet_timeout();
                let (_, retry) = attempt_waits(self.timeout, budget.saturating_sub(started.elapsed()));
                if retry.is_zero() {
                    return Err(DriverError::Timeout(reason));
                }
                let alternate = alternate_path(target);
                tracing::debug!(%target, %alternate, %reason, ?retry, "bacnet request timed out, retrying");
                match self.transact(alternate, retry, encode).await {
                    Ok(response) => Ok((response, alternate)),
                    Err(err) => {
                        if matches!(err, DriverError::Timeout(_)) {
                            gw_telemetry::record_bacnet_timeout();
                        }
                        Err(err)
                    }
                }
            }
            other => other.map(|response| (response, target)),
        }
    }

    pub async fn read_property(
        &self,
        target: SocketAddr,
        object: ObjectId,
        property: u32,
        array_index: Option<u32>,
        budget: Duration,
    ) -> Result<(ReadPropertyAck, SocketAddr), DriverError> {
        let encode = |invoke_id: u8| -> Result<Vec<u8>, CodecError> {
            Ok(codec::encode_read_property(invoke_id, object, property, array_index))
        };
        let (response, answered) = self.confirmed(target, budget, &encode).await?;
        match response {
            Response::ComplexAck { payload, .. } => {
                Ok((codec::decode_read_property_ack(&payload)?, answered))
            }
            Response::SimpleAck => Err(DriverError::DataParse(
                "ReadProperty answered with SimpleACK".to_string(),
            )),
        }
    }

    pub async fn write_property(
        &self,
        target: SocketAddr,
        object: ObjectId,
        property: u32,
        array_index: Option<u32>,
        value: &BacnetValue,
        priority: Option<u8>,
        budget: Duration,
    ) -> Result<SocketAddr, DriverError> {
        let encode = |invoke_id: u8| -> Result<Vec<u8>, CodecError> {
            codec::encode_write_property(invoke_id, object, property, array_index, value, priority)
        };
        let (response, answered) = self.confirmed(target, budget, &encode).await?;
        match response {
            Response::SimpleAck => Ok(answered),
            Response::ComplexAck { service, .. } => Err(DriverError::DataParse(format!(
                "WriteProperty answered with ComplexACK (service 0x{service:02X})"
            ))),
        }
    }

    /// 发送 Who-Is 并在窗口期内收集 I-Am（按实例号去重）
    ///
    /// `stop_at` 给定时，收到该实例的 I-Am 立即返回。
    pub async fn who_is(
        &self,
        range: Option<(u32, u32)>,
        destinations: &[Destination],
        window: Duration,
        stop_at: Option<u32>,
    ) -> Result<Vec<DiscoveredDevice>, DriverError> {
        let mut rx = self.i_am_tx.subscribe();
        for destination in destinations {
            let (addr, broadcast) = match destination {
                Destination::Broadcast(addr) => (*addr, true),
                Destination::Unicast(addr) => (*addr, false),
            };
            let packet = codec::encode_who_is(range, broadcast);
            if let Err(err) = self.socket.send_to(&packet, addr).await {
                // 广播被拒（无路由、权限）时继续尝试其余目标
                tracing::warn!(%addr, error = %err, "who-is send failed");
            }
        }

        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let device = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => break,
                Ok(Ok(device)) => device,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "i-am backlog overflow");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
            };
            if let Some((low, high)) = range {
                if device.instance < low || device.instance > high {
                    continue;
                }
            }
            if !seen.insert(device.instance) {
                continue;
            }
            let found = stop_at == Some(device.instance);
            devices.push(device);
            if found {
                break;
            }
        }
        Ok(devices)
    }
}

impl Drop for BacnetClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// 预算内的等待时长：(首次尝试, 重试)
///
/// 首次最多用掉一半预算，保证重试还有机会在调用方超时前完成。
fn attempt_waits(per_request: Duration, budget: Duration) -> (Duration, Duration) {
    (per_request.min(budget / 2), per_request.min(budget))
}

/// 重试路径：非标准端口改走 47808，标准端口原路重发
pub fn alternate_path(target: SocketAddr) -> SocketAddr {
    if target.port() == BACNET_PORT {
        target
    } else {
        SocketAddr::new(target.ip(), BACNET_PORT)
    }
}

/// 由接口地址与前缀长度计算定向广播地址；未指定接口时使用受限广播
pub fn broadcast_address(interface: Ipv4Addr, prefix: u8, port: u16) -> SocketAddr {
    if interface.is_unspecified() || prefix == 0 || prefix >= 32 {
        return SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port));
    }
    let mask = u32::MAX << (32 - u32::from(prefix));
    let directed = u32::from(interface) | !mask;
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(directed), port))
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    pending: Pending,
    i_am_tx: broadcast::Sender<DiscoveredDevice>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(received) => received,
                Err(err) => {
                    // Windows 上对端不可达会以 ICMP 错误的形式出现在 recv 上
                    tracing::debug!(error = %err, "bacnet recv error");
                    continue;
                }
            },
        };
        dispatch(&buf[..len], from, &pending, &i_am_tx);
    }
    tracing::debug!("bacnet receive loop stopped");
}

fn dispatch(
    datagram: &[u8],
    from: SocketAddr,
    pending: &Pending,
    i_am_tx: &broadcast::Sender<DiscoveredDevice>,
) {
    let frame = match decode_frame(datagram) {
        Ok(frame) => frame,
        Err(CodecError::NetworkMessage(message)) => {
            tracing::trace!(%from, message, "network layer message ignored");
            return;
        }
        Err(err) => {
            tracing::debug!(%from, error = %err, "undecodable bacnet frame");
            return;
        }
    };
    let source = frame.forwarded_from.map(SocketAddr::V4).unwrap_or(from);
    let apdu = match decode_apdu(frame.apdu) {
        Ok(apdu) => apdu,
        Err(err) => {
            tracing::debug!(%source, error = %err, "undecodable apdu");
            return;
        }
    };

    let outcome = match apdu {
        Apdu::UnconfirmedRequest {
            service: codec::service::I_AM,
            payload,
        } => {
            match decode_i_am(payload) {
                Ok(i_am) => {
                    let _ = i_am_tx.send(DiscoveredDevice {
                        instance: i_am.device.instance,
                        addr: source,
                        network: frame.npdu.source.as_ref().map(|s| s.network),
                        max_apdu: i_am.max_apdu,
                        segmentation: i_am.segmentation,
                        vendor_id: i_am.vendor_id,
                    });
                }
                Err(err) => tracing::debug!(%source, error = %err, "malformed i-am"),
            }
            return;
        }
        Apdu::UnconfirmedRequest { .. } | Apdu::ConfirmedRequest { .. } | Apdu::SegmentAck { .. } => {
            return;
        }
        Apdu::SimpleAck { invoke_id, .. } => (invoke_id, Ok(Response::SimpleAck)),
        Apdu::ComplexAck {
            invoke_id,
            segmented: true,
            ..
        } => (
            invoke_id,
            Err(DriverError::Unsupported(
                "segmented response (reduce request size)".to_string(),
            )),
        ),
        Apdu::ComplexAck {
            invoke_id,
            service,
            payload,
            ..
        } => (
            invoke_id,
            Ok(Response::ComplexAck {
                service,
                payload: payload.to_vec(),
            }),
        ),
        Apdu::Error {
            invoke_id,
            class,
            code,
            ..
        } => (
            invoke_id,
            Err(DriverError::Protocol {
                invoke_id,
                class,
                code,
            }),
        ),
        Apdu::Reject { invoke_id, reason } => {
            (invoke_id, Err(DriverError::Reject { invoke_id, reason }))
        }
        Apdu::Abort {
            invoke_id, reason, ..
        } => (invoke_id, Err(DriverError::Abort { invoke_id, reason })),
    };

    let (invoke_id, result) = outcome;
    match pending.lock().remove(&invoke_id) {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => tracing::debug!(%source, invoke_id, "reply for unknown invoke id"),
    }
}
