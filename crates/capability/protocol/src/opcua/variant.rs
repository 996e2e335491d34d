//! Variant ↔ PointValueData 转换

use super::session::UaReading;
use domain::PointValueData;
use opcua::types::{DataValue, Identifier, NodeId, StatusCode, UAString, Variant};

/// 服务端 Variant 转为点位值
pub fn variant_to_value(variant: &Variant) -> PointValueData {
    match variant {
        Variant::Empty => PointValueData::Null,
        Variant::Boolean(v) => PointValueData::Bool(*v),
        Variant::SByte(v) => PointValueData::I8(*v),
        Variant::Byte(v) => PointValueData::U8(*v),
        Variant::Int16(v) => PointValueData::I16(*v),
        Variant::UInt16(v) => PointValueData::U16(*v),
        Variant::Int32(v) => PointValueData::I32(*v),
        Variant::UInt32(v) => PointValueData::U32(*v),
        Variant::Int64(v) => PointValueData::I64(*v),
        Variant::UInt64(v) => PointValueData::U64(*v),
        Variant::Float(v) => PointValueData::F32(*v),
        Variant::Double(v) => PointValueData::F64(*v),
        Variant::String(s) => PointValueData::String(ua_string(s)),
        Variant::DateTime(dt) => PointValueData::String(dt.as_chrono().to_rfc3339()),
        Variant::LocalizedText(text) => PointValueData::String(ua_string(&text.text)),
        Variant::NodeId(id) => PointValueData::String(id.to_string()),
        other => PointValueData::String(format!("{other:?}")),
    }
}

/// 点位值转为写入用 Variant
pub fn value_to_variant(value: &PointValueData) -> Variant {
    match value {
        PointValueData::Null => Variant::Empty,
        PointValueData::Bool(v) => Variant::Boolean(*v),
        PointValueData::I8(v) => Variant::SByte(*v),
        PointValueData::U8(v) => Variant::Byte(*v),
        PointValueData::I16(v) => Variant::Int16(*v),
        PointValueData::U16(v) => Variant::UInt16(*v),
        PointValueData::I32(v) => Variant::Int32(*v),
        PointValueData::U32(v) => Variant::UInt32(*v),
        PointValueData::I64(v) => Variant::Int64(*v),
        PointValueData::U64(v) => Variant::UInt64(*v),
        PointValueData::F32(v) => Variant::Float(*v),
        PointValueData::F64(v) => Variant::Double(*v),
        PointValueData::String(s) => Variant::String(UAString::from(s.as_str())),
    }
}

fn ua_string(s: &UAString) -> String {
    s.as_ref().to_string()
}

/// ns=0 内置数据类型 ID 转名称；其它命名空间原样输出 NodeId
pub fn data_type_name(id: &NodeId) -> String {
    if id.namespace == 0 {
        if let Identifier::Numeric(n) = &id.identifier {
            let name = match n {
                1 => Some("Boolean"),
                2 => Some("SByte"),
                3 => Some("Byte"),
                4 => Some("Int16"),
                5 => Some("UInt16"),
                6 => Some("Int32"),
                7 => Some("UInt32"),
                8 => Some("Int64"),
                9 => Some("UInt64"),
                10 => Some("Float"),
                11 => Some("Double"),
                12 => Some("String"),
                13 => Some("DateTime"),
                14 => Some("Guid"),
                15 => Some("ByteString"),
                17 => Some("NodeId"),
                19 => Some("StatusCode"),
                21 => Some("LocalizedText"),
                24 => Some("BaseDataType"),
                26 => Some("Number"),
                27 => Some("Integer"),
                28 => Some("UInteger"),
                29 => Some("Enumeration"),
                _ => None,
            };
            if let Some(name) = name {
                return name.to_string();
            }
        }
    }
    id.to_string()
}

/// 缺省状态视为 Good；Uncertain 与 Bad 都记为 bad 读数
pub fn reading_from_data_value(dv: &DataValue) -> UaReading {
    let status = dv.status.unwrap_or(StatusCode::Good);
    let source_ts_ms = dv
        .source_timestamp
        .as_ref()
        .map(|ts| ts.as_chrono().timestamp_millis());
    if !status.is_good() {
        return UaReading {
            source_ts_ms,
            ..UaReading::bad(status.bits())
        };
    }
    match dv.value.as_ref() {
        Some(variant) => UaReading {
            value: variant_to_value(variant),
            good: true,
            status: status.bits(),
            source_ts_ms,
        },
        None => UaReading {
            source_ts_ms,
            ..UaReading::bad(status.bits())
        },
    }
}
