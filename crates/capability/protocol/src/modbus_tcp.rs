//! Modbus TCP / RTU over TCP 驱动
//!
//! 点位地址使用经典五位（或六位）写法：
//!
//! | 前缀 | 区域 | 功能码 |
//! |------|------|--------|
//! | `0xxxx` | 线圈 | 01 / 05 / 15 |
//! | `1xxxx` | 离散输入 | 02 |
//! | `3xxxx` | 输入寄存器 | 04 |
//! | `4xxxx` | 保持寄存器 | 03 / 06 / 16 |
//!
//! 协议地址 = 数字部分 - `start_address`（默认 1，即 `40001` 对应保持寄存器 0）。
//!
//! ## 通道配置
//!
//! ```json
//! { "host": "192.168.1.100", "port": 502, "slave_id": 1, "start_address": 1, "byte_order": "CDAB" }
//! ```

use crate::cast::cast_value;
use crate::driver::Driver;
use crate::error::DriverError;
use crate::types::{now_epoch_ms, DriverContext, HealthStatus};
use async_trait::async_trait;
use domain::{map_str, map_u64, DataType, DriverConfig, Point, PointValue, PointValueData};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio_modbus::client::{rtu, tcp, Client as _, Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext as _};
use tokio_modbus::ExceptionCode;
use tracing::{debug, info, warn};

/// 注册名
pub const PROTOCOL_TCP: &str = "modbus-tcp";
pub const PROTOCOL_RTU_OVER_TCP: &str = "modbus-rtu-over-tcp";

const DEFAULT_PORT: u16 = 502;

/// 帧格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// MBAP 报文头
    Tcp,
    /// RTU 帧（含 CRC）经 TCP 透传，常见于串口服务器
    RtuOverTcp,
}

/// 多寄存器数值的字节序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Abcd,
    Cdab,
    Badc,
    Dcba,
}

impl FromStr for ByteOrder {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ABCD" | "BIG" | "BIG_ENDIAN" => Ok(Self::Abcd),
            "CDAB" | "WORD_SWAP" => Ok(Self::Cdab),
            "BADC" | "BYTE_SWAP" => Ok(Self::Badc),
            "DCBA" | "LITTLE" | "LITTLE_ENDIAN" => Ok(Self::Dcba),
            _ => Err(DriverError::ConfigParse(format!("unknown byte_order: {s}"))),
        }
    }
}

impl ByteOrder {
    fn swaps_words(&self) -> bool {
        matches!(self, Self::Cdab | Self::Dcba)
    }

    fn swaps_bytes(&self) -> bool {
        matches!(self, Self::Badc | Self::Dcba)
    }

    /// 线上寄存器顺序与 ABCD 顺序互相转换（该变换是自反的）
    fn reorder(&self, registers: &[u16]) -> Vec<u16> {
        let mut words: Vec<u16> = registers.to_vec();
        if self.swaps_words() {
            words.reverse();
        }
        if self.swaps_bytes() {
            for w in &mut words {
                *w = w.swap_bytes();
            }
        }
        words
    }
}

/// 寄存器区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl RegisterKind {
    fn is_bit(&self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    fn is_writable(&self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }
}

/// 解析后的点位地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusAddress {
    pub kind: RegisterKind,
    /// 协议地址（0 起）
    pub offset: u16,
}

/// 解析经典地址 `40001` / `400001` / `30010` / `10001` / `00001`
pub fn parse_address(address: &str, start_address: u16) -> Result<ModbusAddress, DriverError> {
    let text = address.trim();
    let invalid = || DriverError::ConfigParse(format!("invalid modbus address: {address}"));
    if text.len() < 2 || !text.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let kind = match &text[..1] {
        "0" => RegisterKind::Coil,
        "1" => RegisterKind::DiscreteInput,
        "3" => RegisterKind::InputRegister,
        "4" => RegisterKind::HoldingRegister,
        _ => return Err(invalid()),
    };
    let number: u32 = text[1..].parse().map_err(|_| invalid())?;
    let offset = number
        .checked_sub(u32::from(start_address))
        .ok_or_else(invalid)?;
    let offset = u16::try_from(offset).map_err(|_| invalid())?;
    Ok(ModbusAddress { kind, offset })
}

/// 将寄存器解析为声明的数据类型
pub fn decode_registers(
    registers: &[u16],
    data_type: DataType,
    order: ByteOrder,
) -> Result<PointValueData, DriverError> {
    let count = usize::from(data_type.register_count());
    if registers.len() < count {
        return Err(DriverError::DataParse(format!(
            "need {count} registers for {}, got {}",
            data_type.as_str(),
            registers.len()
        )));
    }
    let words = order.reorder(&registers[..count]);
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    let arr4 = || [bytes[0], bytes[1], bytes[2], bytes[3]];
    let arr8 = || {
        let mut a = [0u8; 8];
        a.copy_from_slice(&bytes[..8]);
        a
    };

    let value = match data_type {
        DataType::Bool => PointValueData::Bool(words[0] != 0),
        DataType::Int8 => PointValueData::I8(bytes[1] as i8),
        DataType::UInt8 => PointValueData::U8(bytes[1]),
        DataType::Int16 => PointValueData::I16(words[0] as i16),
        DataType::UInt16 => PointValueData::U16(words[0]),
        DataType::Int32 => PointValueData::I32(i32::from_be_bytes(arr4())),
        DataType::UInt32 => PointValueData::U32(u32::from_be_bytes(arr4())),
        DataType::Float32 => PointValueData::F32(f32::from_be_bytes(arr4())),
        DataType::Int64 => PointValueData::I64(i64::from_be_bytes(arr8())),
        DataType::UInt64 => PointValueData::U64(u64::from_be_bytes(arr8())),
        DataType::Float64 => PointValueData::F64(f64::from_be_bytes(arr8())),
        DataType::String => {
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            PointValueData::String(String::from_utf8_lossy(&bytes[..end]).trim_end().to_string())
        }
    };
    Ok(value)
}

/// 将已转换的值编码为寄存器（与 [`decode_registers`] 对称）
pub fn encode_registers(value: &PointValueData, order: ByteOrder) -> Result<Vec<u16>, DriverError> {
    let bytes: Vec<u8> = match value {
        PointValueData::Null => {
            return Err(DriverError::conversion("null", "modbus register"));
        }
        PointValueData::Bool(b) => u16::from(*b).to_be_bytes().to_vec(),
        PointValueData::I8(v) => (*v as i16).to_be_bytes().to_vec(),
        PointValueData::U8(v) => u16::from(*v).to_be_bytes().to_vec(),
        PointValueData::I16(v) => v.to_be_bytes().to_vec(),
        PointValueData::U16(v) => v.to_be_bytes().to_vec(),
        PointValueData::I32(v) => v.to_be_bytes().to_vec(),
        PointValueData::U32(v) => v.to_be_bytes().to_vec(),
        PointValueData::F32(v) => v.to_be_bytes().to_vec(),
        PointValueData::I64(v) => v.to_be_bytes().to_vec(),
        PointValueData::U64(v) => v.to_be_bytes().to_vec(),
        PointValueData::F64(v) => v.to_be_bytes().to_vec(),
        PointValueData::String(s) => {
            let mut b = s.as_bytes().to_vec();
            if b.len() % 2 == 1 {
                b.push(0);
            }
            b
        }
    };
    let words: Vec<u16> = bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    Ok(order.reorder(&words))
}

/// 通道配置
#[derive(Debug, Clone, PartialEq)]
struct ModbusSettings {
    addr: SocketAddr,
    slave_id: u8,
    start_address: u16,
    byte_order: ByteOrder,
}

impl ModbusSettings {
    fn from_map(map: &Map<String, Value>) -> Result<Self, DriverError> {
        let host = map_str(map, "host")
            .or_else(|| map_str(map, "ip"))
            .ok_or_else(|| DriverError::ConfigParse("missing host".to_string()))?;
        let port = match map_u64(map, "port") {
            Some(p) => u16::try_from(p).map_err(|_| DriverError::ConfigParse(format!("invalid port: {p}")))?,
            None => DEFAULT_PORT,
        };
        let addr = format!("{host}:{port}")
            .parse::<SocketAddr>()
            .map_err(|e| DriverError::ConfigParse(format!("invalid socket address {host}:{port}: {e}")))?;
        let slave_id = match map_u64(map, "slave_id") {
            Some(id) => u8::try_from(id).map_err(|_| DriverError::ConfigParse(format!("invalid slave_id: {id}")))?,
            None => 1,
        };
        let start_address = match map_u64(map, "start_address") {
            Some(0) => 0,
            Some(1) | None => 1,
            Some(other) => {
                return Err(DriverError::ConfigParse(format!(
                    "start_address must be 0 or 1, got {other}"
                )))
            }
        };
        let byte_order = map_str(map, "byte_order")
            .map(|s| s.parse::<ByteOrder>())
            .transpose()?
            .unwrap_or_default();
        Ok(Self {
            addr,
            slave_id,
            start_address,
            byte_order,
        })
    }
}

/// 单次请求结果：外层为传输错误，内层为从站异常码
type ModbusResult<T> = Result<Result<T, ExceptionCode>, tokio_modbus::Error>;

fn flatten<T>(res: ModbusResult<T>) -> Result<T, DriverError> {
    match res {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(code)) => Err(DriverError::Modbus(format!("exception: {code:?}"))),
        Err(e) => Err(DriverError::Connection(e.to_string())),
    }
}

/// Modbus 驱动（TCP 与 RTU over TCP 共用）
pub struct ModbusTcpDriver {
    transport: Transport,
    settings: RwLock<Option<ModbusSettings>>,
    slave_id: AtomicU8,
    conn: tokio::sync::Mutex<Option<Context>>,
    health: Mutex<HealthStatus>,
}

impl ModbusTcpDriver {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            settings: RwLock::new(None),
            slave_id: AtomicU8::new(1),
            conn: tokio::sync::Mutex::new(None),
            health: Mutex::new(HealthStatus::Unknown),
        }
    }

    fn settings(&self) -> Result<ModbusSettings, DriverError> {
        self.settings
            .read()
            .clone()
            .ok_or_else(|| DriverError::ConfigParse("modbus driver not initialised".to_string()))
    }

    async fn open(&self, addr: SocketAddr) -> Result<Context, DriverError> {
        match self.transport {
            Transport::Tcp => tcp::connect(addr)
                .await
                .map_err(|e| DriverError::Connection(format!("modbus tcp connect {addr}: {e}"))),
            Transport::RtuOverTcp => {
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(|e| DriverError::Connection(format!("modbus rtu-over-tcp connect {addr}: {e}")))?;
                Ok(rtu::attach(stream))
            }
        }
    }

    async fn read_one(
        conn: &mut Context,
        addr: ModbusAddress,
        data_type: DataType,
        order: ByteOrder,
    ) -> Result<PointValueData, DriverError> {
        if addr.kind.is_bit() {
            let bits = match addr.kind {
                RegisterKind::Coil => flatten(conn.read_coils(addr.offset, 1).await)?,
                _ => flatten(conn.read_discrete_inputs(addr.offset, 1).await)?,
            };
            let bit = bits
                .first()
                .copied()
                .ok_or_else(|| DriverError::DataParse("empty bit response".to_string()))?;
            return cast_value(&Value::Bool(bit), data_type);
        }

        let count = data_type.register_count();
        let registers = match addr.kind {
            RegisterKind::HoldingRegister => {
                flatten(conn.read_holding_registers(addr.offset, count).await)?
            }
            _ => flatten(conn.read_input_registers(addr.offset, count).await)?,
        };
        debug!(offset = addr.offset, count, values = ?registers, "read modbus registers");
        decode_registers(&registers, data_type, order)
    }
}

#[async_trait]
impl Driver for ModbusTcpDriver {
    fn init(&mut self, config: &DriverConfig) -> Result<(), DriverError> {
        let settings = ModbusSettings::from_map(&config.config)?;
        self.slave_id.store(settings.slave_id, Ordering::Relaxed);
        *self.settings.write() = Some(settings);
        Ok(())
    }

    async fn connect(&self, ctx: &DriverContext) -> Result<(), DriverError> {
        let settings = self.settings()?;
        info!(addr = %settings.addr, transport = ?self.transport, "connecting to modbus server");
        let result = ctx.run(self.open(settings.addr)).await;
        match result {
            Ok(conn) => {
                *self.conn.lock().await = Some(conn);
                *self.health.lock() = HealthStatus::Good;
                info!(addr = %settings.addr, "connected to modbus server");
                Ok(())
            }
            Err(err) => {
                *self.health.lock() = HealthStatus::Bad;
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        let conn = self.conn.lock().await.take();
        if let Some(mut conn) = conn {
            if let Err(err) = conn.disconnect().await {
                debug!(error = %err, "modbus disconnect");
            }
        }
        *self.health.lock() = HealthStatus::Unknown;
        Ok(())
    }

    fn health(&self) -> HealthStatus {
        *self.health.lock()
    }

    fn set_slave_id(&self, slave_id: u8) -> Result<(), DriverError> {
        self.slave_id.store(slave_id, Ordering::Relaxed);
        Ok(())
    }

    async fn set_device_config(&self, config: &Map<String, Value>) -> Result<(), DriverError> {
        if let Some(id) = map_u64(config, "slave_id") {
            let id = u8::try_from(id).map_err(|_| DriverError::ConfigParse(format!("invalid slave_id: {id}")))?;
            self.set_slave_id(id)?;
        }
        Ok(())
    }

    async fn read_points(
        &self,
        ctx: &DriverContext,
        points: &[Point],
    ) -> Result<HashMap<String, PointValue>, DriverError> {
        let settings = self.settings()?;
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(DriverError::NotConnected)?;
        conn.set_slave(Slave(self.slave_id.load(Ordering::Relaxed)));

        let mut values = HashMap::with_capacity(points.len());
        let mut good = 0usize;
        let mut transport_error = None;
        for point in points {
            let now = now_epoch_ms();
            if transport_error.is_some() {
                values.insert(point.id.clone(), PointValue::bad(point.id.clone(), now));
                continue;
            }
            let addr = match parse_address(&point.address, settings.start_address) {
                Ok(addr) => addr,
                Err(err) => {
                    warn!(point_id = %point.id, error = %err, "invalid modbus point address");
                    values.insert(point.id.clone(), PointValue::bad(point.id.clone(), now));
                    continue;
                }
            };
            match ctx
                .run(Self::read_one(conn, addr, point.data_type, settings.byte_order))
                .await
            {
                Ok(value) => {
                    good += 1;
                    values.insert(point.id.clone(), PointValue::good(point.id.clone(), value, now));
                }
                Err(err) => {
                    warn!(point_id = %point.id, address = %point.address, error = %err, "failed to poll modbus point");
                    if matches!(err, DriverError::Connection(_) | DriverError::Timeout(_)) {
                        transport_error = Some(err);
                    }
                    values.insert(point.id.clone(), PointValue::bad(point.id.clone(), now));
                }
            }
        }

        if let Some(err) = transport_error {
            // 传输层故障后丢弃连接，等待上层重连
            *guard = None;
            *self.health.lock() = HealthStatus::Bad;
            if good == 0 {
                return Err(err);
            }
        }
        gw_telemetry::record_points_read(values.len(), values.len() - good);
        Ok(values)
    }

    async fn write_point(
        &self,
        ctx: &DriverContext,
        point: &Point,
        value: &Value,
    ) -> Result<(), DriverError> {
        let settings = self.settings()?;
        let addr = parse_address(&point.address, settings.start_address)?;
        if !addr.kind.is_writable() {
            gw_telemetry::record_write_failure();
            return Err(DriverError::Unsupported(format!(
                "{:?} at {} is read-only",
                addr.kind, point.address
            )));
        }
        let data = cast_value(value, point.data_type).inspect_err(|_| gw_telemetry::record_write_failure())?;

        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(DriverError::NotConnected)?;
        conn.set_slave(Slave(self.slave_id.load(Ordering::Relaxed)));

        let result = match addr.kind {
            RegisterKind::Coil => {
                let bit = match cast_value(value, DataType::Bool)? {
                    PointValueData::Bool(b) => b,
                    _ => false,
                };
                ctx.run(async { flatten(conn.write_single_coil(addr.offset, bit).await) })
                    .await
            }
            _ => {
                let registers = encode_registers(&data, settings.byte_order)?;
                if registers.len() == 1 {
                    ctx.run(async { flatten(conn.write_single_register(addr.offset, registers[0]).await) })
                        .await
                } else {
                    ctx.run(async { flatten(conn.write_multiple_registers(addr.offset, &registers).await) })
                        .await
                }
            }
        };

        match result {
            Ok(()) => {
                gw_telemetry::record_write_success();
                info!(point_id = %point.id, address = %point.address, value = %data, "modbus write ok");
                Ok(())
            }
            Err(err) => {
                gw_telemetry::record_write_failure();
                warn!(point_id = %point.id, address = %point.address, error = %err, "modbus write failed");
                if matches!(err, DriverError::Connection(_)) {
                    *guard = None;
                    *self.health.lock() = HealthStatus::Bad;
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classic_addresses() {
        let hr = parse_address("40001", 1).unwrap();
        assert_eq!(hr, ModbusAddress { kind: RegisterKind::HoldingRegister, offset: 0 });
        let ir = parse_address("30010", 1).unwrap();
        assert_eq!(ir, ModbusAddress { kind: RegisterKind::InputRegister, offset: 9 });
        let six = parse_address("400101", 1).unwrap();
        assert_eq!(six.offset, 100);
        let zero_based = parse_address("40001", 0).unwrap();
        assert_eq!(zero_based.offset, 1);
        assert_eq!(parse_address("00005", 1).unwrap().kind, RegisterKind::Coil);
        assert_eq!(parse_address("10002", 1).unwrap().kind, RegisterKind::DiscreteInput);

        assert!(parse_address("40000", 1).is_err());
        assert!(parse_address("20001", 1).is_err());
        assert!(parse_address("4x001", 1).is_err());
        assert!(parse_address("4", 1).is_err());
    }

    #[test]
    fn test_parse_registers_int16() {
        // 正数
        let value = decode_registers(&[100], DataType::Int16, ByteOrder::Abcd).unwrap();
        assert_eq!(value, PointValueData::I16(100));

        // 负数
        let value = decode_registers(&[(-100i16) as u16], DataType::Int16, ByteOrder::Abcd).unwrap();
        assert_eq!(value, PointValueData::I16(-100));
    }

    #[test]
    fn float32_in_every_byte_order() {
        // 123.456f32 = 0x42F6E979
        let expected = PointValueData::F32(123.456);
        let cases = [
            (ByteOrder::Abcd, [0x42F6, 0xE979]),
            (ByteOrder::Cdab, [0xE979, 0x42F6]),
            (ByteOrder::Badc, [0xF642, 0x79E9]),
            (ByteOrder::Dcba, [0x79E9, 0xF642]),
        ];
        for (order, regs) in cases {
            assert_eq!(decode_registers(&regs, DataType::Float32, order).unwrap(), expected, "{order:?}");
            assert_eq!(encode_registers(&expected, order).unwrap(), regs.to_vec(), "{order:?}");
        }
    }

    #[test]
    fn wide_values_need_enough_registers() {
        assert!(decode_registers(&[1, 2], DataType::Float64, ByteOrder::Abcd).is_err());
        let value = decode_registers(&[0, 0, 0, 42], DataType::UInt64, ByteOrder::Abcd).unwrap();
        assert_eq!(value, PointValueData::U64(42));
        let value = decode_registers(&[0xFFFF, 0xFFFE], DataType::Int32, ByteOrder::Abcd).unwrap();
        assert_eq!(value, PointValueData::I32(-2));
    }

    #[test]
    fn string_registers_stop_at_nul() {
        let regs = [0x5055, 0x4D50, 0x0000, 0, 0, 0, 0, 0];
        let value = decode_registers(&regs, DataType::String, ByteOrder::Abcd).unwrap();
        assert_eq!(value, PointValueData::String("PUMP".to_string()));
    }

    #[test]
    fn test_parse_config() {
        let config = json!({"host": "192.168.1.100", "port": 1502, "slave_id": 7, "byte_order": "cdab"});
        let settings = ModbusSettings::from_map(config.as_object().unwrap()).unwrap();
        assert_eq!(settings.addr, "192.168.1.100:1502".parse().unwrap());
        assert_eq!(settings.slave_id, 7);
        assert_eq!(settings.start_address, 1);
        assert_eq!(settings.byte_order, ByteOrder::Cdab);

        let defaults = ModbusSettings::from_map(json!({"ip": "10.0.0.2"}).as_object().unwrap()).unwrap();
        assert_eq!(defaults.addr.port(), 502);
        assert!(ModbusSettings::from_map(json!({"host": "10.0.0.2", "start_address": 5}).as_object().unwrap()).is_err());
        assert!(ModbusSettings::from_map(&Map::new()).is_err());
    }

    #[tokio::test]
    async fn read_without_connection_fails() {
        let mut driver = ModbusTcpDriver::new(Transport::Tcp);
        let config = DriverConfig::new(PROTOCOL_TCP, json!({"host": "127.0.0.1"}).as_object().cloned().unwrap());
        driver.init(&config).unwrap();
        let points = [Point::new("p1", "40001", DataType::Int16)];
        let err = driver.read_points(&DriverContext::default(), &points).await.unwrap_err();
        assert!(matches!(err, DriverError::NotConnected));
        assert_eq!(driver.health(), HealthStatus::Unknown);
    }
}
