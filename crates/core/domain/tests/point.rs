use domain::{DataType, DriverConfig, Point, PointValue, PointValueData, Quality};

#[test]
fn data_type_accepts_config_aliases() {
    assert_eq!("boolean".parse::<DataType>().unwrap(), DataType::Bool);
    assert_eq!("BYTE".parse::<DataType>().unwrap(), DataType::UInt8);
    assert_eq!("sbyte".parse::<DataType>().unwrap(), DataType::Int8);
    assert_eq!("double".parse::<DataType>().unwrap(), DataType::Float64);
    assert_eq!("float".parse::<DataType>().unwrap(), DataType::Float32);
    assert!("decimal".parse::<DataType>().is_err());
}

#[test]
fn point_deserializes_with_defaults() {
    let point: Point =
        serde_json::from_str(r#"{"id":"p1","address":"AnalogInput:1","data_type":"float32"}"#)
            .expect("point");
    assert_eq!(point.data_type, DataType::Float32);
    assert!(point.writable);
    assert!(point.device_id.is_empty());
}

#[test]
fn bad_value_carries_null() {
    let value = PointValue::bad("p1", 10);
    assert_eq!(value.quality, Quality::Bad);
    assert_eq!(value.value, PointValueData::Null);
    assert!(!value.is_good());
}

#[test]
fn f32_renders_as_short_decimal() {
    let json = PointValueData::F32(123.45).to_json();
    assert_eq!(json, serde_json::json!(123.45));
}

#[test]
fn driver_config_accessors_accept_numbers_and_strings() {
    let config: DriverConfig = serde_json::from_str(
        r#"{"protocol":"bacnet-ip","config":{"device_id":2228316.0,"port":"47808","ip":"10.0.0.5","enabled":"true"}}"#,
    )
    .expect("config");
    assert_eq!(config.get_u64("device_id"), Some(2228316));
    assert_eq!(config.get_u64("port"), Some(47808));
    assert_eq!(config.get_str("ip").as_deref(), Some("10.0.0.5"));
    assert_eq!(config.get_bool("enabled"), Some(true));
    assert_eq!(config.get_str("missing"), None);
}
