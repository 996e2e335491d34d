//! 写入值类型转换
//!
//! 所有协议的写路径都先经过这里：外部传入的松散 JSON 值被转换成点位声明类型的
//! 机器表示，转换失败返回 `DriverError::Conversion`。
//!
//! - 数值目标：接受数字或数字字符串，先解析为 f64，截去小数部分后收窄，超出范围报错
//! - 布尔目标：接受布尔、"true"/"false"（以及 "1"/"0"）、数字（非零为真）
//! - 字符串目标：接受任意值的默认文本表示

use crate::error::DriverError;
use domain::{DataType, PointValueData};
use serde_json::Value;

/// 按点位数据类型转换写入值
pub fn cast_value(value: &Value, data_type: DataType) -> Result<PointValueData, DriverError> {
    match data_type {
        DataType::Bool => to_bool(value).map(PointValueData::Bool),
        DataType::String => Ok(PointValueData::String(to_text(value))),
        DataType::Float32 => {
            let f = to_f64(value, data_type)?;
            if f.is_finite() && f.abs() > f32::MAX as f64 {
                return Err(DriverError::conversion(value, data_type));
            }
            Ok(PointValueData::F32(f as f32))
        }
        DataType::Float64 => to_f64(value, data_type).map(PointValueData::F64),
        DataType::Int8 => narrow(value, data_type, i8::MIN as f64, 128.0)
            .map(|v| PointValueData::I8(v as i8)),
        DataType::UInt8 => narrow(value, data_type, 0.0, 256.0)
            .map(|v| PointValueData::U8(v as u8)),
        DataType::Int16 => narrow(value, data_type, i16::MIN as f64, 32_768.0)
            .map(|v| PointValueData::I16(v as i16)),
        DataType::UInt16 => narrow(value, data_type, 0.0, 65_536.0)
            .map(|v| PointValueData::U16(v as u16)),
        DataType::Int32 => narrow(value, data_type, i32::MIN as f64, 2_147_483_648.0)
            .map(|v| PointValueData::I32(v as i32)),
        DataType::UInt32 => narrow(value, data_type, 0.0, 4_294_967_296.0)
            .map(|v| PointValueData::U32(v as u32)),
        DataType::Int64 => {
            // 整数字面量直接取，避免经过 f64 丢精度
            if let Some(i) = value.as_i64() {
                return Ok(PointValueData::I64(i));
            }
            narrow(value, data_type, i64::MIN as f64, I64_END)
                .map(|v| PointValueData::I64(v as i64))
        }
        DataType::UInt64 => {
            if let Some(u) = value.as_u64() {
                return Ok(PointValueData::U64(u));
            }
            narrow(value, data_type, 0.0, U64_END).map(|v| PointValueData::U64(v as u64))
        }
    }
}

/// 按数据类型名称转换（名称无法识别同样视为转换失败）
pub fn cast_value_by_name(value: &Value, data_type: &str) -> Result<PointValueData, DriverError> {
    let parsed: DataType = data_type
        .parse()
        .map_err(|_| DriverError::conversion(value, data_type))?;
    cast_value(value, parsed)
}

fn to_f64(value: &Value, target: DataType) -> Result<f64, DriverError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|f| !f.is_nan())
        .ok_or_else(|| DriverError::conversion(value, target))
}

/// 2^63：`i64::MAX as f64` 会舍入到这个值，所以上界必须是开区间
const I64_END: f64 = 9.223372036854775808e18;
/// 2^64
const U64_END: f64 = 1.8446744073709552e19;

/// 截断后收窄到 `[min, end)`
fn narrow(value: &Value, target: DataType, min: f64, end: f64) -> Result<f64, DriverError> {
    let truncated = to_f64(value, target)?.trunc();
    if truncated < min || truncated >= end {
        return Err(DriverError::conversion(value, target));
    }
    Ok(truncated)
}

fn to_bool(value: &Value) -> Result<bool, DriverError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => n
            .as_f64()
            .map(|f| f != 0.0)
            .ok_or_else(|| DriverError::conversion(value, DataType::Bool)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(DriverError::conversion(value, DataType::Bool)),
        },
        _ => Err(DriverError::conversion(value, DataType::Bool)),
    }
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cast(value: Value, data_type: &str) -> Result<PointValueData, DriverError> {
        cast_value_by_name(&value, data_type)
    }

    #[test]
    fn integer_targets() {
        assert_eq!(cast(json!(123.0), "int16").unwrap(), PointValueData::I16(123));
        assert_eq!(cast(json!(123.0), "uint16").unwrap(), PointValueData::U16(123));
        assert_eq!(cast(json!(123.0), "int32").unwrap(), PointValueData::I32(123));
        assert_eq!(cast(json!("123"), "int16").unwrap(), PointValueData::I16(123));
        assert_eq!(cast(json!(-7.9), "int32").unwrap(), PointValueData::I32(-7));
    }

    #[test]
    fn byte_targets() {
        assert_eq!(cast(json!(255.0), "byte").unwrap(), PointValueData::U8(255));
        assert_eq!(cast(json!(127.0), "sbyte").unwrap(), PointValueData::I8(127));
        assert_eq!(cast(json!("255"), "byte").unwrap(), PointValueData::U8(255));
        assert_eq!(cast(json!("-128"), "sbyte").unwrap(), PointValueData::I8(-128));
    }

    #[test]
    fn float_targets() {
        assert_eq!(cast(json!(123.45), "float32").unwrap(), PointValueData::F32(123.45));
        assert_eq!(cast(json!("123.45"), "float32").unwrap(), PointValueData::F32(123.45));
        assert_eq!(cast(json!(" 1e3 "), "double").unwrap(), PointValueData::F64(1000.0));
    }

    #[test]
    fn bool_targets() {
        assert_eq!(cast(json!(true), "bool").unwrap(), PointValueData::Bool(true));
        assert_eq!(cast(json!("true"), "bool").unwrap(), PointValueData::Bool(true));
        assert_eq!(cast(json!(1), "bool").unwrap(), PointValueData::Bool(true));
        assert_eq!(cast(json!(0), "bool").unwrap(), PointValueData::Bool(false));
        assert_eq!(cast(json!(-2.5), "boolean").unwrap(), PointValueData::Bool(true));
        assert!(cast(json!("maybe"), "bool").is_err());
    }

    #[test]
    fn string_target_renders_anything() {
        assert_eq!(
            cast(json!(12.5), "string").unwrap(),
            PointValueData::String("12.5".to_string())
        );
        assert_eq!(
            cast(json!("abc"), "string").unwrap(),
            PointValueData::String("abc".to_string())
        );
    }

    #[test]
    fn conversion_errors_name_value_and_target() {
        let err = cast(json!("abc"), "int16").unwrap_err();
        match err {
            DriverError::Conversion { value, target } => {
                assert_eq!(value, "\"abc\"");
                assert_eq!(target, "int16");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(cast(json!(256), "byte"), Err(DriverError::Conversion { .. })));
        assert!(matches!(cast(json!(-1), "uint16"), Err(DriverError::Conversion { .. })));
        assert!(matches!(cast(json!(null), "float32"), Err(DriverError::Conversion { .. })));
        assert!(matches!(cast(json!(1), "decimal"), Err(DriverError::Conversion { .. })));
    }

    #[test]
    fn wide_integers_keep_precision() {
        assert_eq!(
            cast(json!(9_007_199_254_740_993i64), "int64").unwrap(),
            PointValueData::I64(9_007_199_254_740_993)
        );
        assert_eq!(
            cast(json!(u64::MAX), "uint64").unwrap(),
            PointValueData::U64(u64::MAX)
        );
    }

    #[test]
    fn wide_integer_bounds_are_exclusive() {
        // 经 f64 路径（字符串）时 2^63 / 2^64 不能饱和成 MAX
        assert!(matches!(
            cast(json!("9223372036854775808"), "int64"),
            Err(DriverError::Conversion { .. })
        ));
        assert!(matches!(
            cast(json!(9.223372036854775808e18), "int64"),
            Err(DriverError::Conversion { .. })
        ));
        assert!(matches!(
            cast(json!("18446744073709551616"), "uint64"),
            Err(DriverError::Conversion { .. })
        ));
        assert_eq!(
            cast(json!("-9223372036854775808"), "int64").unwrap(),
            PointValueData::I64(i64::MIN)
        );
        assert_eq!(cast(json!("4294967295.9"), "uint32").unwrap(), PointValueData::U32(u32::MAX));
        assert!(matches!(cast(json!("4294967296"), "uint32"), Err(DriverError::Conversion { .. })));
    }
}
