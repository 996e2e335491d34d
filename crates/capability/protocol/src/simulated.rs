//! 模拟驱动
//!
//! EtherNet/IP、三菱 SLMP、欧姆龙 FINS、S7、DLT645 暂无真实线协议实现，
//! 以模拟驱动注册：读数为随时间变化的正弦值（相位由点位 ID 决定），按数据类型整形；
//! 写入值被记录，之后的读取返回写入值。

use crate::cast::cast_value;
use crate::driver::Driver;
use crate::error::DriverError;
use crate::types::{now_epoch_ms, DriverContext, HealthStatus};
use async_trait::async_trait;
use domain::{DataType, DriverConfig, Point, PointValue, PointValueData};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::f64::consts::TAU;

/// 以模拟方式注册的协议
pub const SIMULATED_PROTOCOLS: [&str; 5] = [
    "ethernet-ip",
    "mitsubishi-slmp",
    "omron-fins",
    "s7",
    "dlt645",
];

/// 正弦周期（秒）
const PERIOD_SECS: f64 = 60.0;

pub struct SimulatedDriver {
    protocol: String,
    config: RwLock<Map<String, Value>>,
    connected: Mutex<bool>,
    written: Mutex<HashMap<String, PointValueData>>,
}

impl SimulatedDriver {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            config: RwLock::new(Map::new()),
            connected: Mutex::new(false),
            written: Mutex::new(HashMap::new()),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

/// FNV-1a 映射到 [0, 2π)
fn phase_of(id: &str) -> f64 {
    let hash = id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3));
    (hash % 3600) as f64 / 3600.0 * TAU
}

/// 某时刻的模拟值
pub fn simulated_value(point: &Point, ts_ms: i64) -> PointValueData {
    let t = ts_ms as f64 / 1000.0;
    let wave = (t / PERIOD_SECS * TAU + phase_of(&point.id)).sin();
    let raw = match point.data_type {
        DataType::Bool => json!(wave > 0.0),
        DataType::String => json!(format!("sim-{}", point.address)),
        DataType::Int8 => json!((wave * 100.0).round()),
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
            json!((50.0 + wave * 40.0).round())
        }
        DataType::Float32 | DataType::Float64 => json!(50.0 + wave * 25.0),
        _ => json!((wave * 1000.0).round()),
    };
    cast_value(&raw, point.data_type).unwrap_or(PointValueData::Null)
}

#[async_trait]
impl Driver for SimulatedDriver {
    fn init(&mut self, config: &DriverConfig) -> Result<(), DriverError> {
        *self.config.write() = config.config.clone();
        Ok(())
    }

    async fn connect(&self, _ctx: &DriverContext) -> Result<(), DriverError> {
        *self.connected.lock() = true;
        tracing::info!(protocol = %self.protocol, config = %serde_json::Value::Object(self.config.read().clone()), "simulated driver connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        *self.connected.lock() = false;
        tracing::info!(protocol = %self.protocol, "simulated driver disconnected");
        Ok(())
    }

    fn health(&self) -> HealthStatus {
        if *self.connected.lock() {
            HealthStatus::Good
        } else {
            HealthStatus::Unknown
        }
    }

    async fn set_device_config(&self, config: &Map<String, Value>) -> Result<(), DriverError> {
        let mut current = self.config.write();
        for (k, v) in config {
            current.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn read_points(
        &self,
        _ctx: &DriverContext,
        points: &[Point],
    ) -> Result<HashMap<String, PointValue>, DriverError> {
        if !*self.connected.lock() {
            return Err(DriverError::NotConnected);
        }
        let now = now_epoch_ms();
        let written = self.written.lock();
        let values: HashMap<String, PointValue> = points
            .iter()
            .map(|p| {
                let value = written
                    .get(&p.id)
                    .cloned()
                    .unwrap_or_else(|| simulated_value(p, now));
                (p.id.clone(), PointValue::good(p.id.clone(), value, now))
            })
            .collect();
        gw_telemetry::record_points_read(values.len(), 0);
        Ok(values)
    }

    async fn write_point(
        &self,
        _ctx: &DriverContext,
        point: &Point,
        value: &Value,
    ) -> Result<(), DriverError> {
        let data = match cast_value(value, point.data_type) {
            Ok(data) => data,
            Err(err) => {
                gw_telemetry::record_write_failure();
                return Err(err);
            }
        };
        tracing::info!(protocol = %self.protocol, point_id = %point.id, address = %point.address, value = %data, "simulated write");
        self.written.lock().insert(point.id.clone(), data);
        gw_telemetry::record_write_success();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_follow_data_type() {
        let ts = 1_700_000_000_000;
        let unsigned = simulated_value(&Point::new("u", "D100", DataType::UInt16), ts);
        assert!(matches!(unsigned, PointValueData::U16(v) if (10..=90).contains(&v)));
        let float = simulated_value(&Point::new("f", "DB1.DBD0", DataType::Float64), ts);
        assert!(matches!(float, PointValueData::F64(v) if (25.0..=75.0).contains(&v)));
        assert!(matches!(simulated_value(&Point::new("b", "M0.0", DataType::Bool), ts), PointValueData::Bool(_)));
        assert_eq!(
            simulated_value(&Point::new("s", "D200", DataType::String), ts),
            PointValueData::String("sim-D200".to_string())
        );
    }

    #[test]
    fn phase_depends_on_point_id() {
        let ts = 1_700_000_000_000;
        let a = simulated_value(&Point::new("temp-1", "D1", DataType::Float64), ts);
        let b = simulated_value(&Point::new("temp-2", "D1", DataType::Float64), ts);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn written_value_is_read_back() {
        let driver = SimulatedDriver::new("s7");
        let ctx = DriverContext::default();
        let point = Point::new("sp", "DB1.DBW2", DataType::Int16);

        assert!(matches!(driver.read_points(&ctx, &[point.clone()]).await, Err(DriverError::NotConnected)));
        driver.connect(&ctx).await.unwrap();
        driver.write_point(&ctx, &point, &json!("42")).await.unwrap();
        let values = driver.read_points(&ctx, &[point.clone()]).await.unwrap();
        assert_eq!(values["sp"].value, PointValueData::I16(42));
        assert!(driver.write_point(&ctx, &point, &json!("abc")).await.is_err());
    }
}
