use crate::UnknownDataType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 点位声明的数据类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
}

impl DataType {
    /// 规范名称（与配置中的首选写法一致）。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int8 => "sbyte",
            Self::UInt8 => "byte",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::String => "string",
        }
    }

    /// 是否为数值类型（整数或浮点）。
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::Bool | Self::String)
    }

    /// 寄存器型协议（Modbus 等）需要占用的 16 位寄存器数量。
    pub fn register_count(&self) -> u16 {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 | Self::Int16 | Self::UInt16 => 1,
            Self::Int32 | Self::UInt32 | Self::Float32 => 2,
            Self::Int64 | Self::UInt64 | Self::Float64 => 4,
            // 字符串默认按 8 个寄存器（16 字节）读取
            Self::String => 8,
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        Self::Float32
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = UnknownDataType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data_type = match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Self::Bool,
            "sbyte" | "int8" => Self::Int8,
            "byte" | "uint8" => Self::UInt8,
            "int16" => Self::Int16,
            "uint16" => Self::UInt16,
            "int32" | "int" => Self::Int32,
            "uint32" | "uint" => Self::UInt32,
            "int64" => Self::Int64,
            "uint64" => Self::UInt64,
            "float32" | "float" | "real" => Self::Float32,
            "float64" | "double" => Self::Float64,
            "string" => Self::String,
            _ => return Err(UnknownDataType(s.to_string())),
        };
        Ok(data_type)
    }
}

/// 点位值的数据类型。
#[derive(Debug, Clone, PartialEq)]
pub enum PointValueData {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
}

impl PointValueData {
    /// 转为 JSON 值，供上层流水线或探针输出使用。
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Null => Value::Null,
            Self::Bool(v) => Value::Bool(*v),
            Self::I8(v) => Value::from(*v),
            Self::I16(v) => Value::from(*v),
            Self::I32(v) => Value::from(*v),
            Self::I64(v) => Value::from(*v),
            Self::U8(v) => Value::from(*v),
            Self::U16(v) => Value::from(*v),
            Self::U32(v) => Value::from(*v),
            Self::U64(v) => Value::from(*v),
            // f32 先转十进制文本再解析，避免 123.45f32 变成 123.44999694824219
            Self::F32(v) => v
                .to_string()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::F64(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(v) => Value::String(v.clone()),
        }
    }

    /// 数值视图（布尔按 0/1），字符串与空值返回 None。
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Null | Self::String(_) => None,
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::I8(v) => Some(*v as f64),
            Self::I16(v) => Some(*v as f64),
            Self::I32(v) => Some(*v as f64),
            Self::I64(v) => Some(*v as f64),
            Self::U8(v) => Some(*v as f64),
            Self::U16(v) => Some(*v as f64),
            Self::U32(v) => Some(*v as f64),
            Self::U64(v) => Some(*v as f64),
            Self::F32(v) => Some(*v as f64),
            Self::F64(v) => Some(*v),
        }
    }
}

impl fmt::Display for PointValueData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
        }
    }
}

/// 读数质量标志。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Bad,
}

/// 可寻址的现场设备点位，由配置层拥有，驱动调用期间只读。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// 协议相关地址（BACnet `Type:Instance[:Property]`、OPC-UA NodeId、Modbus `40001`）
    pub address: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub device_id: String,
    #[serde(default = "default_writable")]
    pub writable: bool,
}

fn default_writable() -> bool {
    true
}

impl Point {
    pub fn new(id: impl Into<String>, address: impl Into<String>, data_type: DataType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address: address.into(),
            data_type,
            device_id: String::new(),
            writable: true,
        }
    }
}

/// 单次读取结果。
#[derive(Debug, Clone, PartialEq)]
pub struct PointValue {
    pub point_id: String,
    pub value: PointValueData,
    pub quality: Quality,
    pub ts_ms: i64,
}

impl PointValue {
    pub fn good(point_id: impl Into<String>, value: PointValueData, ts_ms: i64) -> Self {
        Self {
            point_id: point_id.into(),
            value,
            quality: Quality::Good,
            ts_ms,
        }
    }

    pub fn bad(point_id: impl Into<String>, ts_ms: i64) -> Self {
        Self {
            point_id: point_id.into(),
            value: PointValueData::Null,
            quality: Quality::Bad,
            ts_ms,
        }
    }

    pub fn is_good(&self) -> bool {
        self.quality == Quality::Good
    }
}

/// 协议无关的驱动配置（键值包）。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub channel_id: String,
    pub protocol: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl DriverConfig {
    pub fn new(protocol: impl Into<String>, config: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            channel_id: String::new(),
            protocol: protocol.into(),
            config,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        map_str(&self.config, key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        map_u64(&self.config, key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        map_bool(&self.config, key)
    }
}

/// 读取字符串键；数字按文本返回，空串视为缺省。
pub fn map_str(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 读取无符号整数键；同时接受数字与数字字符串（JSON 中数字常以 f64 形式出现）。
pub fn map_u64(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<u64> {
    match map.get(key)? {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

pub fn map_bool(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<bool> {
    match map.get(key)? {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        serde_json::Value::String(s) => {
            Some(matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on"))
        }
        _ => None,
    }
}
