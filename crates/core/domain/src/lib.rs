pub mod data;

pub use data::{
    DataType, DriverConfig, Point, PointValue, PointValueData, Quality, map_bool, map_str, map_u64,
};

/// 数据类型名称解析错误。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown data type: {0}")]
pub struct UnknownDataType(pub String);
