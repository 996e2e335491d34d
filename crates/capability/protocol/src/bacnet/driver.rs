//! BACnet/IP 驱动
//!
//! 点位地址格式 `Type:Instance[:Property[:Index]]`，例如 `analog-input:1`、`AV:3:85`、`2:7`。
//! 属性缺省为 Present_Value (85)。
//!
//! 读路径的自我保护：
//! - 单点连续 3 次失败进入冷却期，冷却期内直接报 Bad，不再打扰慢设备
//! - 整批全部超时时返回 `Timeout`，并在后台对该设备重新发现（每设备受恢复间隔限流）
//! - 非标准端口的设备超时后改走 47808，成功后更新设备地址

use super::client::{BacnetClient, Destination, DiscoveredDevice, broadcast_address};
use super::codec::{
    self, BacnetValue, ObjectId, BACNET_PORT, MAX_INSTANCE, OBJECT_TYPE_DEVICE,
};
use crate::cast::cast_value;
use crate::driver::{Driver, ObjectScanner, Scanner};
use crate::error::DriverError;
use crate::types::{now_epoch_ms, DriverContext, DriverTuning, HealthStatus};
use async_trait::async_trait;
use domain::{map_str, map_u64, DataType, DriverConfig, Point, PointValue, PointValueData};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 连续失败多少次后进入冷却
const FAILURES_BEFORE_COOLDOWN: u32 = 3;
const DEFAULT_PRIORITY: u8 = 16;
/// 逐索引读取对象列表时接受的最大长度
const MAX_OBJECT_LIST_LEN: u64 = u16::MAX as u64;

/// 解析后的点位地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointAddress {
    pub object: ObjectId,
    pub property: u32,
    pub array_index: Option<u32>,
}

/// 解析 `Type:Instance[:Property[:Index]]`
pub fn parse_point_address(address: &str) -> Result<PointAddress, DriverError> {
    let invalid = |why: &str| DriverError::ConfigParse(format!("bacnet address '{address}': {why}"));
    let parts: Vec<&str> = address.split(':').map(str::trim).collect();
    if !(2..=4).contains(&parts.len()) {
        return Err(invalid("expected Type:Instance[:Property[:Index]]"));
    }
    let object_type =
        codec::parse_object_type(parts[0]).ok_or_else(|| invalid("unknown object type"))?;
    let instance: u32 = parts[1].parse().map_err(|_| invalid("bad instance"))?;
    let object = ObjectId::new(object_type, instance).map_err(|e| invalid(&e.to_string()))?;
    let property = match parts.get(2) {
        Some(p) => codec::parse_property(p).ok_or_else(|| invalid("unknown property"))?,
        None => codec::property::PRESENT_VALUE,
    };
    let array_index = parts
        .get(3)
        .map(|i| i.parse::<u32>().map_err(|_| invalid("bad array index")))
        .transpose()?;
    Ok(PointAddress {
        object,
        property,
        array_index,
    })
}

/// 通道配置
#[derive(Debug, Clone, PartialEq)]
struct BacnetSettings {
    interface: SocketAddr,
    broadcast: SocketAddr,
    device_id: Option<u32>,
    target: Option<SocketAddr>,
    probes: Vec<SocketAddr>,
}

fn parse_endpoint(text: &str, default_port: u16) -> Option<SocketAddr> {
    let text = text.trim();
    if let Ok(addr) = text.parse::<SocketAddr>() {
        return Some(addr);
    }
    text.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, default_port))
}

fn port_value(map: &Map<String, Value>, key: &str, default: u16) -> Result<u16, DriverError> {
    match map_u64(map, key) {
        Some(port) => u16::try_from(port)
            .map_err(|_| DriverError::ConfigParse(format!("{key} out of range: {port}"))),
        None => Ok(default),
    }
}

impl BacnetSettings {
    fn from_map(map: &Map<String, Value>) -> Result<Self, DriverError> {
        let interface_ip = match map_str(map, "interface_ip") {
            Some(ip) => ip
                .parse::<Ipv4Addr>()
                .map_err(|_| DriverError::ConfigParse(format!("invalid interface_ip: {ip}")))?,
            None => Ipv4Addr::UNSPECIFIED,
        };
        let interface_port = port_value(map, "interface_port", BACNET_PORT)?;
        let port = port_value(map, "port", BACNET_PORT)?;

        // 既接受前缀长度 24，也接受 "192.168.1.0/24"
        let prefix = match map_str(map, "subnet_cidr") {
            Some(cidr) => {
                let bits = cidr.rsplit('/').next().unwrap_or(&cidr);
                bits.parse::<u8>()
                    .ok()
                    .filter(|p| *p <= 32)
                    .ok_or_else(|| DriverError::ConfigParse(format!("invalid subnet_cidr: {cidr}")))?
            }
            None => 24,
        };

        let device_id = match map_u64(map, "device_id") {
            Some(id) if id <= u64::from(MAX_INSTANCE) => Some(id as u32),
            Some(id) => {
                return Err(DriverError::ConfigParse(format!(
                    "device_id out of range: {id}"
                )))
            }
            None => None,
        };

        let target = match map_str(map, "ip") {
            Some(ip) => Some(
                parse_endpoint(&ip, port)
                    .ok_or_else(|| DriverError::ConfigParse(format!("invalid ip: {ip}")))?,
            ),
            None => None,
        };

        let probe_texts: Vec<String> = match map.get("probe_addresses") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(list)) => list.split(',').map(str::to_string).collect(),
            _ => Vec::new(),
        };
        let mut probes = Vec::with_capacity(probe_texts.len());
        for text in probe_texts.iter().filter(|t| !t.trim().is_empty()) {
            probes.push(parse_endpoint(text, BACNET_PORT).ok_or_else(|| {
                DriverError::ConfigParse(format!("invalid probe address: {text}"))
            })?);
        }

        Ok(Self {
            interface: SocketAddr::new(IpAddr::V4(interface_ip), interface_port),
            broadcast: broadcast_address(interface_ip, prefix, port),
            device_id,
            target,
            probes,
        })
    }

    /// 发现顺序：广播，然后定向到配置地址与探测地址
    fn destinations(&self) -> Vec<Destination> {
        let mut out = vec![Destination::Broadcast(self.broadcast)];
        out.extend(self.target.map(Destination::Unicast));
        out.extend(self.probes.iter().copied().map(Destination::Unicast));
        out
    }
}

#[derive(Debug, Default)]
struct PointHealth {
    failures: u32,
    cooldown_until: Option<Instant>,
}

/// 后台恢复任务也要访问的状态
#[derive(Default)]
struct SharedState {
    devices: Mutex<HashMap<u32, DiscoveredDevice>>,
    points: Mutex<HashMap<String, PointHealth>>,
    last_recovery: Mutex<HashMap<u32, Instant>>,
    known_objects: Mutex<HashMap<u32, BTreeSet<ObjectId>>>,
    health: Mutex<Option<HealthStatus>>,
}

impl SharedState {
    fn remember(&self, device: DiscoveredDevice) {
        self.devices.lock().insert(device.instance, device);
    }

    fn device_addr(&self, instance: u32) -> Option<SocketAddr> {
        self.devices.lock().get(&instance).map(|d| d.addr)
    }

    fn update_addr(&self, instance: u32, addr: SocketAddr) {
        let mut devices = self.devices.lock();
        let entry = devices.entry(instance).or_insert_with(|| DiscoveredDevice {
            instance,
            addr,
            network: None,
            max_apdu: 1476,
            segmentation: 3,
            vendor_id: 0,
        });
        if entry.addr != addr {
            tracing::info!(device_id = instance, old = %entry.addr, new = %addr, "bacnet device address corrected");
            entry.addr = addr;
        }
    }

    fn in_cooldown(&self, point_id: &str) -> bool {
        let mut points = self.points.lock();
        let Some(health) = points.get_mut(point_id) else {
            return false;
        };
        match health.cooldown_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                health.cooldown_until = None;
                health.failures = 0;
                false
            }
            None => false,
        }
    }

    fn record_success(&self, point_id: &str) {
        self.points.lock().remove(point_id);
    }

    /// 记录一次失败，返回是否因此进入冷却
    fn record_failure(&self, point_id: &str, cooldown: Duration) -> bool {
        let mut points = self.points.lock();
        let health = points.entry(point_id.to_string()).or_default();
        health.failures += 1;
        if health.failures >= FAILURES_BEFORE_COOLDOWN {
            health.cooldown_until = Some(Instant::now() + cooldown);
            true
        } else {
            false
        }
    }

    fn set_health(&self, status: HealthStatus) {
        *self.health.lock() = Some(status);
    }
}

/// BACnet/IP 驱动
pub struct BacnetDriver {
    tuning: DriverTuning,
    config: RwLock<Map<String, Value>>,
    settings: RwLock<BacnetSettings>,
    client: RwLock<Option<Arc<BacnetClient>>>,
    state: Arc<SharedState>,
}

impl BacnetDriver {
    pub fn new(tuning: DriverTuning) -> Self {
        let config = Map::new();
        let settings = BacnetSettings::from_map(&config).unwrap_or_else(|_| BacnetSettings {
            interface: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), BACNET_PORT),
            broadcast: broadcast_address(Ipv4Addr::UNSPECIFIED, 24, BACNET_PORT),
            device_id: None,
            target: None,
            probes: Vec::new(),
        });
        Self {
            tuning,
            config: RwLock::new(config),
            settings: RwLock::new(settings),
            client: RwLock::new(None),
            state: Arc::new(SharedState::default()),
        }
    }

    fn client(&self) -> Result<Arc<BacnetClient>, DriverError> {
        self.client
            .read()
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
            .ok_or(DriverError::NotConnected)
    }

    fn point_device(&self, point: &Point, settings: &BacnetSettings) -> Option<u32> {
        point
            .device_id
            .trim()
            .parse::<u32>()
            .ok()
            .or(settings.device_id)
    }

    fn resolve(&self, device: Option<u32>, settings: &BacnetSettings) -> Option<SocketAddr> {
        match device {
            Some(instance) => self.state.device_addr(instance).or_else(|| {
                (settings.device_id == Some(instance))
                    .then_some(settings.target)
                    .flatten()
            }),
            None => settings.target,
        }
    }

    async fn discover(
        &self,
        ctx: &DriverContext,
        client: &BacnetClient,
        instance: u32,
        settings: &BacnetSettings,
    ) -> Result<Option<DiscoveredDevice>, DriverError> {
        let destinations = settings.destinations();
        let found = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(DriverError::Cancelled),
            res = client.who_is(
                Some((instance, instance)),
                &destinations,
                self.tuning.bacnet_discovery_window,
                Some(instance),
            ) => res?,
        };
        let device = found.into_iter().find(|d| d.instance == instance);
        if let Some(device) = &device {
            tracing::info!(device_id = instance, addr = %device.addr, "bacnet device discovered");
            self.state.remember(device.clone());
        }
        Ok(device)
    }

    /// 后台重新发现设备，按设备限流
    fn schedule_recovery(&self, client: Arc<BacnetClient>, instance: u32, settings: &BacnetSettings) {
        {
            let mut last = self.state.last_recovery.lock();
            if let Some(at) = last.get(&instance) {
                if at.elapsed() < self.tuning.bacnet_recovery_interval {
                    return;
                }
            }
            last.insert(instance, Instant::now());
        }
        let state = self.state.clone();
        let destinations = settings.destinations();
        let window = self.tuning.bacnet_discovery_window;
        tracing::info!(device_id = instance, "bacnet rediscovery scheduled");
        tokio::spawn(async move {
            match client
                .who_is(Some((instance, instance)), &destinations, window, Some(instance))
                .await
            {
                Ok(found) => match found.into_iter().find(|d| d.instance == instance) {
                    Some(device) => {
                        tracing::info!(device_id = instance, addr = %device.addr, "bacnet device recovered");
                        state.remember(device);
                        state.set_health(HealthStatus::Good);
                    }
                    None => tracing::warn!(device_id = instance, "bacnet rediscovery found nothing"),
                },
                Err(err) => tracing::warn!(device_id = instance, error = %err, "bacnet rediscovery failed"),
            }
        });
    }

    async fn read_one(
        &self,
        ctx: &DriverContext,
        client: &BacnetClient,
        device: Option<u32>,
        target: SocketAddr,
        address: PointAddress,
    ) -> Result<Vec<BacnetValue>, DriverError> {
        let (ack, answered) = ctx
            .run(client.read_property(
                target,
                address.object,
                address.property,
                address.array_index,
                ctx.timeout,
            ))
            .await?;
        if answered != target {
            if let Some(instance) = device {
                self.state.update_addr(instance, answered);
            }
        }
        Ok(ack.values)
    }

    /// 尽力读取一个属性，失败返回 None
    async fn read_optional(
        &self,
        ctx: &DriverContext,
        client: &BacnetClient,
        target: SocketAddr,
        object: ObjectId,
        property: u32,
    ) -> Option<Vec<BacnetValue>> {
        let address = PointAddress {
            object,
            property,
            array_index: None,
        };
        match self.read_one(ctx, client, None, target, address).await {
            Ok(values) => Some(values),
            Err(err) => {
                tracing::debug!(%object, property, error = %err, "optional property read failed");
                None
            }
        }
    }

    async fn read_text(
        &self,
        ctx: &DriverContext,
        client: &BacnetClient,
        target: SocketAddr,
        object: ObjectId,
        property: u32,
    ) -> Option<String> {
        self.read_optional(ctx, client, target, object, property)
            .await
            .and_then(|values| values.first().and_then(|v| v.as_text().map(str::to_string)))
    }

    /// 读取设备对象列表；整表读取失败（常见于需要分段）时逐个索引读取
    async fn read_object_list(
        &self,
        ctx: &DriverContext,
        client: &BacnetClient,
        target: SocketAddr,
        device: ObjectId,
    ) -> Result<Vec<ObjectId>, DriverError> {
        let whole = PointAddress {
            object: device,
            property: codec::property::OBJECT_LIST,
            array_index: None,
        };
        let err = match self.read_one(ctx, client, Some(device.instance), target, whole).await {
            Ok(values) => return Ok(values.iter().filter_map(BacnetValue::as_object_id).collect()),
            Err(DriverError::Cancelled) => return Err(DriverError::Cancelled),
            Err(err) => err,
        };
        tracing::info!(%device, error = %err, "object list read failed, falling back to indexed reads");

        let length_ref = PointAddress {
            array_index: Some(0),
            ..whole
        };
        let length = self
            .read_one(ctx, client, Some(device.instance), target, length_ref)
            .await?
            .first()
            .and_then(BacnetValue::as_u64)
            .ok_or_else(|| DriverError::DataParse("object list length is not unsigned".to_string()))?;
        let length = u32::try_from(length)
            .ok()
            .filter(|&n| u64::from(n) <= MAX_OBJECT_LIST_LEN)
            .ok_or_else(|| {
                DriverError::DataParse(format!(
                    "object list length {length} exceeds {MAX_OBJECT_LIST_LEN}"
                ))
            })?;

        let mut objects = Vec::with_capacity(length as usize);
        for index in 1..=length {
            let item = PointAddress {
                array_index: Some(index),
                ..whole
            };
            match self.read_one(ctx, client, Some(device.instance), target, item).await {
                Ok(values) => objects.extend(values.iter().filter_map(BacnetValue::as_object_id)),
                Err(DriverError::Cancelled) => return Err(DriverError::Cancelled),
                Err(err) => tracing::debug!(%device, index, error = %err, "object list entry skipped"),
            }
        }
        Ok(objects)
    }
}

/// BACnet 原始值的自然映射
pub fn natural_value(values: &[BacnetValue]) -> PointValueData {
    let Some(first) = values.first() else {
        return PointValueData::Null;
    };
    match first {
        BacnetValue::Null => PointValueData::Null,
        BacnetValue::Boolean(b) => PointValueData::Bool(*b),
        BacnetValue::Unsigned(v) => match u32::try_from(*v) {
            Ok(v) => PointValueData::U32(v),
            Err(_) => PointValueData::U64(*v),
        },
        BacnetValue::Signed(v) => match i32::try_from(*v) {
            Ok(v) => PointValueData::I32(v),
            Err(_) => PointValueData::I64(*v),
        },
        BacnetValue::Real(v) => PointValueData::F32(*v),
        BacnetValue::Double(v) => PointValueData::F64(*v),
        BacnetValue::Enumerated(v) => PointValueData::U32(*v),
        BacnetValue::CharacterString(s) => PointValueData::String(s.clone()),
        BacnetValue::OctetString(bytes) => {
            PointValueData::String(bytes.iter().map(|b| format!("{b:02x}")).collect())
        }
        BacnetValue::BitString { unused_bits, bytes } => {
            let total = bytes.len() * 8 - (*unused_bits as usize).min(bytes.len() * 8);
            let bits = (0..total)
                .map(|i| if bytes[i / 8] & (0x80 >> (i % 8)) != 0 { '1' } else { '0' })
                .collect();
            PointValueData::String(bits)
        }
        BacnetValue::Date([year, month, day, _]) => PointValueData::String(format!(
            "{:04}-{:02}-{:02}",
            1900 + u32::from(*year),
            month,
            day
        )),
        BacnetValue::Time([hour, minute, second, hundredths]) => PointValueData::String(format!(
            "{hour:02}:{minute:02}:{second:02}.{hundredths:02}"
        )),
        BacnetValue::ObjectId(id) => PointValueData::String(id.to_string()),
    }
}

/// 按点位声明类型整形读数；无法转换时保留自然值
pub fn shape_value(values: &[BacnetValue], data_type: DataType) -> PointValueData {
    let natural = natural_value(values);
    match (&natural, data_type) {
        (PointValueData::Null, _) => natural,
        (PointValueData::String(_), DataType::String) => natural,
        (_, DataType::String) => PointValueData::String(natural.to_string()),
        (PointValueData::String(_), _) => natural,
        _ => cast_value(&natural.to_json(), data_type).unwrap_or(natural),
    }
}

/// 拆出写入值与优先级；`{"value": v, "priority": p}` 或裸值
pub fn split_write_request(value: &Value) -> Result<(&Value, u8), DriverError> {
    let Value::Object(obj) = value else {
        return Ok((value, DEFAULT_PRIORITY));
    };
    let Some(inner) = obj.get("value") else {
        return Ok((value, DEFAULT_PRIORITY));
    };
    let priority = match obj.get("priority") {
        None | Some(Value::Null) => DEFAULT_PRIORITY,
        Some(p) => map_u64(obj, "priority")
            .filter(|p| (1..=16).contains(p))
            .map(|p| p as u8)
            .ok_or_else(|| DriverError::conversion(p, "priority (1-16)"))?,
    };
    Ok((inner, priority))
}

fn is_analog(object_type: u16) -> bool {
    matches!(object_type, 0..=2)
}

fn is_binary(object_type: u16) -> bool {
    matches!(object_type, 3..=5)
}

fn is_multi_state(object_type: u16) -> bool {
    matches!(object_type, 13 | 14 | 19)
}

/// 按对象类别编码写入值
pub fn encode_write_value(
    object_type: u16,
    data_type: DataType,
    raw: &Value,
) -> Result<BacnetValue, DriverError> {
    if raw.is_null() {
        return Ok(BacnetValue::Null);
    }
    if is_analog(object_type) {
        return match cast_value(raw, DataType::Float32)? {
            PointValueData::F32(v) => Ok(BacnetValue::Real(v)),
            other => Err(DriverError::conversion(other, DataType::Float32)),
        };
    }
    if is_binary(object_type) {
        return match cast_value(raw, DataType::Bool)? {
            PointValueData::Bool(b) => Ok(BacnetValue::Enumerated(u32::from(b))),
            other => Err(DriverError::conversion(other, DataType::Bool)),
        };
    }
    if is_multi_state(object_type) {
        return match cast_value(raw, DataType::UInt32)? {
            PointValueData::U32(v) => Ok(BacnetValue::Unsigned(u64::from(v))),
            other => Err(DriverError::conversion(other, DataType::UInt32)),
        };
    }
    Ok(match cast_value(raw, data_type)? {
        PointValueData::Null => BacnetValue::Null,
        PointValueData::Bool(b) => BacnetValue::Boolean(b),
        PointValueData::I8(v) => BacnetValue::Signed(i64::from(v)),
        PointValueData::I16(v) => BacnetValue::Signed(i64::from(v)),
        PointValueData::I32(v) => BacnetValue::Signed(i64::from(v)),
        PointValueData::I64(v) => BacnetValue::Signed(v),
        PointValueData::U8(v) => BacnetValue::Unsigned(u64::from(v)),
        PointValueData::U16(v) => BacnetValue::Unsigned(u64::from(v)),
        PointValueData::U32(v) => BacnetValue::Unsigned(u64::from(v)),
        PointValueData::U64(v) => BacnetValue::Unsigned(v),
        PointValueData::F32(v) => BacnetValue::Real(v),
        PointValueData::F64(v) => BacnetValue::Double(v),
        PointValueData::String(s) => BacnetValue::CharacterString(s),
    })
}

fn segmentation_name(code: u32) -> &'static str {
    match code {
        0 => "segmented-both",
        1 => "segmented-transmit",
        2 => "segmented-receive",
        _ => "no-segmentation",
    }
}

#[async_trait]
impl Driver for BacnetDriver {
    fn init(&mut self, config: &DriverConfig) -> Result<(), DriverError> {
        let settings = BacnetSettings::from_map(&config.config)?;
        tracing::debug!(channel_id = %config.channel_id, ?settings, "bacnet driver initialised");
        *self.settings.write() = settings;
        *self.config.write() = config.config.clone();
        Ok(())
    }

    async fn connect(&self, ctx: &DriverContext) -> Result<(), DriverError> {
        if self.client().is_ok() {
            return Ok(());
        }
        let settings = self.settings.read().clone();
        let client = ctx
            .run(BacnetClient::bind(settings.interface, self.tuning.bacnet_timeout))
            .await?;
        *self.client.write() = Some(client.clone());

        let Some(instance) = settings.device_id else {
            self.state.set_health(HealthStatus::Good);
            return Ok(());
        };
        match self.discover(ctx, &client, instance, &settings).await {
            Ok(Some(_)) => self.state.set_health(HealthStatus::Good),
            Ok(None) => match settings.target {
                Some(target) => {
                    tracing::warn!(device_id = instance, %target, "no I-Am received, using configured address");
                    self.state.update_addr(instance, target);
                    self.state.set_health(HealthStatus::Unknown);
                }
                None => {
                    tracing::warn!(device_id = instance, "bacnet device not discovered, will retry on read");
                    self.state.set_health(HealthStatus::Bad);
                }
            },
            Err(DriverError::Cancelled) => return Err(DriverError::Cancelled),
            Err(err) => {
                tracing::warn!(device_id = instance, error = %err, "bacnet discovery failed");
                self.state.set_health(HealthStatus::Bad);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        if let Some(client) = self.client.write().take() {
            client.close();
            tracing::info!("bacnet driver disconnected");
        }
        *self.state.health.lock() = None;
        Ok(())
    }

    fn health(&self) -> HealthStatus {
        if self.client().is_err() {
            return HealthStatus::Unknown;
        }
        (*self.state.health.lock()).unwrap_or(HealthStatus::Unknown)
    }

    async fn set_device_config(&self, config: &Map<String, Value>) -> Result<(), DriverError> {
        let mut merged = self.config.read().clone();
        merged.extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
        let settings = BacnetSettings::from_map(&merged)?;
        *self.settings.write() = settings;
        *self.config.write() = merged;
        Ok(())
    }

    async fn read_points(
        &self,
        ctx: &DriverContext,
        points: &[Point],
    ) -> Result<HashMap<String, PointValue>, DriverError> {
        let client = self.client()?;
        let settings = self.settings.read().clone();
        let ts = now_epoch_ms();
        let mut results = HashMap::with_capacity(points.len());
        let mut attempted = 0usize;
        let mut timeouts = 0usize;
        let mut unresolved = Vec::new();
        let mut timed_out_devices = Vec::new();

        for point in points {
            let device = self.point_device(point, &settings);
            let Some(target) = self.resolve(device, &settings) else {
                unresolved.extend(device);
                results.insert(point.id.clone(), PointValue::bad(&point.id, ts));
                continue;
            };
            if self.state.in_cooldown(&point.id) {
                tracing::debug!(point_id = %point.id, "bacnet point cooling down");
                results.insert(point.id.clone(), PointValue::bad(&point.id, ts));
                continue;
            }
            let address = match parse_point_address(&point.address) {
                Ok(address) => address,
                Err(err) => {
                    tracing::warn!(point_id = %point.id, error = %err, "invalid bacnet point address");
                    results.insert(point.id.clone(), PointValue::bad(&point.id, ts));
                    continue;
                }
            };

            attempted += 1;
            match self.read_one(ctx, &client, device, target, address).await {
                Ok(values) => {
                    self.state.record_success(&point.id);
                    let value = shape_value(&values, point.data_type);
                    results.insert(point.id.clone(), PointValue::good(&point.id, value, ts));
                }
                Err(DriverError::Cancelled) => return Err(DriverError::Cancelled),
                Err(err) => {
                    if matches!(err, DriverError::Timeout(_)) {
                        timeouts += 1;
                        timed_out_devices.extend(device);
                    }
                    let cooling =
                        self.state.record_failure(&point.id, self.tuning.bacnet_point_cooldown);
                    tracing::warn!(
                        point_id = %point.id,
                        address = %point.address,
                        error = %err,
                        cooling,
                        "bacnet point read failed"
                    );
                    results.insert(point.id.clone(), PointValue::bad(&point.id, ts));
                }
            }
        }

        let bad = results.values().filter(|v| !v.is_good()).count();
        gw_telemetry::record_points_read(results.len(), bad);

        if attempted > 0 && timeouts == attempted {
            self.state.set_health(HealthStatus::Bad);
            timed_out_devices.sort_unstable();
            timed_out_devices.dedup();
            for instance in timed_out_devices {
                self.schedule_recovery(client.clone(), instance, &settings);
            }
            return Err(DriverError::Timeout(format!(
                "all {attempted} bacnet reads timed out"
            )));
        }
        if attempted == 0 && !unresolved.is_empty() {
            unresolved.sort_unstable();
            unresolved.dedup();
            for instance in &unresolved {
                self.schedule_recovery(client.clone(), *instance, &settings);
            }
            return Err(DriverError::Connection(format!(
                "bacnet device(s) {unresolved:?} not discovered"
            )));
        }
        if bad < results.len() {
            self.state.set_health(HealthStatus::Good);
        }
        Ok(results)
    }

    async fn write_point(
        &self,
        ctx: &DriverContext,
        point: &Point,
        value: &Value,
    ) -> Result<(), DriverError> {
        let client = self.client()?;
        let settings = self.settings.read().clone();
        let device = self.point_device(point, &settings);
        let result = async {
            let target = self.resolve(device, &settings).ok_or_else(|| {
                DriverError::Connection(format!("bacnet device {device:?} not discovered"))
            })?;
            let address = parse_point_address(&point.address)?;
            let (raw, priority) = split_write_request(value)?;
            let encoded = encode_write_value(address.object.object_type, point.data_type, raw)?;
            let answered = ctx
                .run(client.write_property(
                    target,
                    address.object,
                    address.property,
                    address.array_index,
                    &encoded,
                    Some(priority),
                    ctx.timeout,
                ))
                .await?;
            if answered != target {
                if let Some(instance) = device {
                    self.state.update_addr(instance, answered);
                }
            }
            Ok::<_, DriverError>((encoded, priority))
        }
        .await;

        match result {
            Ok((encoded, priority)) => {
                gw_telemetry::record_write_success();
                tracing::info!(point_id = %point.id, address = %point.address, value = ?encoded, priority, "bacnet write ok");
                Ok(())
            }
            Err(err) => {
                gw_telemetry::record_write_failure();
                tracing::warn!(point_id = %point.id, address = %point.address, error = %err, "bacnet write failed");
                Err(err)
            }
        }
    }

    fn as_scanner(&self) -> Option<&dyn Scanner> {
        Some(self)
    }

    fn as_object_scanner(&self) -> Option<&dyn ObjectScanner> {
        Some(self)
    }
}

fn limit(params: &Map<String, Value>, key: &str) -> Result<Option<u32>, DriverError> {
    match map_u64(params, key) {
        Some(v) if v <= u64::from(MAX_INSTANCE) => Ok(Some(v as u32)),
        Some(v) => Err(DriverError::ConfigParse(format!("{key} out of range: {v}"))),
        None if params.get(key).is_some_and(|v| !v.is_null()) => Err(DriverError::ConfigParse(
            format!("{key} must be an integer"),
        )),
        None => Ok(None),
    }
}

#[async_trait]
impl Scanner for BacnetDriver {
    async fn scan(
        &self,
        ctx: &DriverContext,
        params: &Map<String, Value>,
    ) -> Result<Value, DriverError> {
        let scan_id = gw_telemetry::new_scan_id();
        let client = self.client()?;
        let settings = self.settings.read().clone();
        let range = match (limit(params, "low_limit")?, limit(params, "high_limit")?) {
            (None, None) => None,
            (low, high) => {
                let (low, high) = (low.unwrap_or(0), high.unwrap_or(MAX_INSTANCE));
                if low > high {
                    return Err(DriverError::ConfigParse(format!(
                        "low_limit {low} greater than high_limit {high}"
                    )));
                }
                Some((low, high))
            }
        };
        let window = map_u64(params, "timeout_ms")
            .map(Duration::from_millis)
            .unwrap_or(self.tuning.bacnet_discovery_window);
        tracing::info!(%scan_id, ?range, window_ms = window.as_millis() as u64, "bacnet scan started");

        let destinations = settings.destinations();
        let mut devices = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(DriverError::Cancelled),
            res = client.who_is(range, &destinations, window, None) => res?,
        };
        devices.sort_by_key(|d| d.instance);

        let mut records = Vec::with_capacity(devices.len());
        for device in devices {
            self.state.remember(device.clone());
            let object = ObjectId::new(OBJECT_TYPE_DEVICE, device.instance)?;
            let vendor_name = self
                .read_text(ctx, &client, device.addr, object, codec::property::VENDOR_NAME)
                .await;
            let model_name = self
                .read_text(ctx, &client, device.addr, object, codec::property::MODEL_NAME)
                .await;
            let object_name = self
                .read_text(ctx, &client, device.addr, object, codec::property::OBJECT_NAME)
                .await;
            records.push(json!({
                "device_id": device.instance,
                "ip": device.addr.ip().to_string(),
                "port": device.addr.port(),
                "network_number": device.network,
                "vendor_id": device.vendor_id,
                "vendor_name": vendor_name,
                "model_name": model_name,
                "object_name": object_name,
                "max_apdu": device.max_apdu,
                "segmentation": segmentation_name(device.segmentation),
                "status": "online",
            }));
        }
        tracing::info!(%scan_id, devices = records.len(), "bacnet scan finished");
        Ok(Value::Array(records))
    }
}

#[async_trait]
impl ObjectScanner for BacnetDriver {
    async fn scan_objects(
        &self,
        ctx: &DriverContext,
        params: &Map<String, Value>,
    ) -> Result<Value, DriverError> {
        let scan_id = gw_telemetry::new_scan_id();
        let client = self.client()?;
        let settings = self.settings.read().clone();
        let instance = limit(params, "device_id")?
            .or(settings.device_id)
            .ok_or_else(|| DriverError::ConfigParse("device_id is required".to_string()))?;
        tracing::info!(%scan_id, device_id = instance, "bacnet object scan started");

        let target = match self.resolve(Some(instance), &settings) {
            Some(target) => target,
            None => self
                .discover(ctx, &client, instance, &settings)
                .await?
                .map(|d| d.addr)
                .ok_or_else(|| DriverError::NotFound(format!("bacnet device {instance}")))?,
        };
        let device = ObjectId::device(instance)?;
        let objects = self.read_object_list(ctx, &client, target, device).await?;

        let previous = self.state.known_objects.lock().get(&instance).cloned();
        let current: BTreeSet<ObjectId> = objects.iter().copied().collect();
        let mut records = Vec::with_capacity(objects.len());
        for object in &objects {
            let name = self
                .read_text(ctx, &client, target, *object, codec::property::OBJECT_NAME)
                .await;
            let description = self
                .read_text(ctx, &client, target, *object, codec::property::DESCRIPTION)
                .await;
            let present_value = self
                .read_optional(ctx, &client, target, *object, codec::property::PRESENT_VALUE)
                .await
                .map(|values| natural_value(&values).to_json());
            let units = self
                .read_optional(ctx, &client, target, *object, codec::property::UNITS)
                .await
                .and_then(|values| values.first().and_then(BacnetValue::as_u64));
            let diff_status = match &previous {
                Some(known) if known.contains(object) => "existing",
                _ => "new",
            };
            records.push(json!({
                "address": object.to_string(),
                "object_type": object.object_type,
                "object_type_name": codec::object_type_name(object.object_type),
                "instance": object.instance,
                "object_name": name,
                "description": description,
                "present_value": present_value,
                "units": units,
                "diff_status": diff_status,
            }));
        }
        if let Some(known) = &previous {
            for removed in known.difference(&current) {
                records.push(json!({
                    "address": removed.to_string(),
                    "object_type": removed.object_type,
                    "object_type_name": codec::object_type_name(removed.object_type),
                    "instance": removed.instance,
                    "diff_status": "removed",
                }));
            }
        }
        self.state.known_objects.lock().insert(instance, current);
        tracing::info!(%scan_id, device_id = instance, objects = objects.len(), "bacnet object scan finished");
        Ok(Value::Array(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn point_address_forms() {
        let a = parse_point_address("analog-input:1").unwrap();
        assert_eq!(a.object, ObjectId::new(0, 1).unwrap());
        assert_eq!(a.property, 85);
        assert_eq!(a.array_index, None);

        let b = parse_point_address("AV:3:object-name").unwrap();
        assert_eq!(b.object.object_type, 2);
        assert_eq!(b.property, 77);

        let c = parse_point_address("8:1001:76:0").unwrap();
        assert_eq!(c.object.object_type, OBJECT_TYPE_DEVICE);
        assert_eq!(c.array_index, Some(0));

        assert!(parse_point_address("analog-input").is_err());
        assert!(parse_point_address("toaster:1").is_err());
        assert!(parse_point_address("ai:4194304").is_err());
        assert!(matches!(
            parse_point_address("ai:x"),
            Err(DriverError::ConfigParse(_))
        ));
    }

    #[test]
    fn write_request_priority() {
        let v = json!(21.5);
        assert_eq!(split_write_request(&v).unwrap(), (&json!(21.5), 16));
        let v = json!({"value": 1, "priority": 8});
        assert_eq!(split_write_request(&v).unwrap(), (&json!(1), 8));
        let v = json!({"value": null});
        assert_eq!(split_write_request(&v).unwrap(), (&Value::Null, 16));
        assert!(split_write_request(&json!({"value": 1, "priority": 0})).is_err());
        assert!(split_write_request(&json!({"value": 1, "priority": "high"})).is_err());
    }

    #[test]
    fn write_encoding_follows_object_class() {
        assert_eq!(
            encode_write_value(1, DataType::Int32, &json!("42.5")).unwrap(),
            BacnetValue::Real(42.5)
        );
        assert_eq!(
            encode_write_value(4, DataType::Float32, &json!(true)).unwrap(),
            BacnetValue::Enumerated(1)
        );
        assert_eq!(
            encode_write_value(19, DataType::Float32, &json!(3)).unwrap(),
            BacnetValue::Unsigned(3)
        );
        assert_eq!(
            encode_write_value(2, DataType::Float32, &Value::Null).unwrap(),
            BacnetValue::Null
        );
        assert_eq!(
            encode_write_value(40, DataType::String, &json!("hello")).unwrap(),
            BacnetValue::CharacterString("hello".to_string())
        );
        assert!(matches!(
            encode_write_value(0, DataType::Float32, &json!("warm")),
            Err(DriverError::Conversion { .. })
        ));
    }

    #[test]
    fn read_values_are_shaped_by_data_type() {
        assert_eq!(
            shape_value(&[BacnetValue::Real(21.5)], DataType::Float32),
            PointValueData::F32(21.5)
        );
        assert_eq!(
            shape_value(&[BacnetValue::Enumerated(1)], DataType::Bool),
            PointValueData::Bool(true)
        );
        assert_eq!(
            shape_value(&[BacnetValue::Unsigned(7)], DataType::Int16),
            PointValueData::I16(7)
        );
        assert_eq!(
            shape_value(&[BacnetValue::CharacterString("AHU-1".into())], DataType::Float32),
            PointValueData::String("AHU-1".to_string())
        );
        assert_eq!(shape_value(&[], DataType::Float32), PointValueData::Null);
        assert_eq!(
            natural_value(&[BacnetValue::BitString {
                unused_bits: 4,
                bytes: vec![0b0100_0000]
            }]),
            PointValueData::String("0100".to_string())
        );
    }

    #[test]
    fn settings_from_channel_config() {
        let config = json!({
            "interface_ip": "192.168.1.20",
            "interface_port": 0,
            "subnet_cidr": "192.168.1.0/24",
            "device_id": 1001,
            "ip": "192.168.1.50",
            "port": 47809,
            "probe_addresses": ["192.168.1.51", "192.168.1.52:47810"],
        });
        let settings = BacnetSettings::from_map(config.as_object().unwrap()).unwrap();
        assert_eq!(settings.broadcast, "192.168.1.255:47809".parse().unwrap());
        assert_eq!(settings.device_id, Some(1001));
        assert_eq!(settings.target, Some("192.168.1.50:47809".parse().unwrap()));
        assert_eq!(
            settings.destinations(),
            vec![
                Destination::Broadcast("192.168.1.255:47809".parse().unwrap()),
                Destination::Unicast("192.168.1.50:47809".parse().unwrap()),
                Destination::Unicast("192.168.1.51:47808".parse().unwrap()),
                Destination::Unicast("192.168.1.52:47810".parse().unwrap()),
            ]
        );

        let bad = json!({"device_id": 4_194_304});
        assert!(BacnetSettings::from_map(bad.as_object().unwrap()).is_err());
        let bad = json!({"interface_ip": "nope"});
        assert!(BacnetSettings::from_map(bad.as_object().unwrap()).is_err());
    }

    #[test]
    fn cooldown_after_three_failures() {
        let state = SharedState::default();
        let cooldown = Duration::from_secs(10);
        assert!(!state.record_failure("p1", cooldown));
        assert!(!state.record_failure("p1", cooldown));
        assert!(state.record_failure("p1", cooldown));
        assert!(state.in_cooldown("p1"));
        state.record_success("p1");
        assert!(!state.in_cooldown("p1"));

        let state = SharedState::default();
        for _ in 0..3 {
            state.record_failure("p2", Duration::ZERO);
        }
        // 冷却期已过：计数清零
        assert!(!state.in_cooldown("p2"));
        assert!(!state.record_failure("p2", cooldown));
    }
}
