//! 回环 UDP 上的模拟 BACnet 设备

use domain::{DataType, DriverConfig, Point, PointValueData, Quality};
use gw_protocol::bacnet::codec::{
    self, decode_apdu, decode_frame, decode_read_property_request, decode_who_is,
    decode_write_property_request, property, service, Apdu, BacnetValue, ObjectId,
};
use gw_protocol::{BacnetDriver, Driver, DriverContext, DriverError, DriverTuning, HealthStatus};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const DEVICE: u32 = 1234;

type Store = Arc<Mutex<HashMap<(ObjectId, u32), Vec<BacnetValue>>>>;
/// 按数组下标应答的属性，优先于 `Store`
type Indexed = Arc<Mutex<HashMap<(ObjectId, u32, u32), BacnetValue>>>;

struct FakeDevice {
    addr: SocketAddr,
    store: Store,
    indexed: Indexed,
    priorities: Arc<Mutex<Vec<Option<u8>>>>,
}

fn obj(object_type: u16, instance: u32) -> ObjectId {
    ObjectId::new(object_type, instance).unwrap()
}

async fn spawn_device() -> FakeDevice {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    let device = ObjectId::device(DEVICE).unwrap();
    let ai1 = obj(0, 1);
    let av3 = obj(2, 3);
    let bv2 = obj(5, 2);
    let mut data = HashMap::new();
    data.insert(
        (device, property::OBJECT_LIST),
        vec![
            BacnetValue::ObjectId(device),
            BacnetValue::ObjectId(ai1),
            BacnetValue::ObjectId(av3),
            BacnetValue::ObjectId(bv2),
        ],
    );
    data.insert((device, property::OBJECT_NAME), vec![BacnetValue::CharacterString("AHU-1".into())]);
    data.insert((device, property::VENDOR_NAME), vec![BacnetValue::CharacterString("Acme".into())]);
    data.insert((ai1, property::PRESENT_VALUE), vec![BacnetValue::Real(21.5)]);
    data.insert((ai1, property::OBJECT_NAME), vec![BacnetValue::CharacterString("Supply Temp".into())]);
    data.insert((ai1, property::UNITS), vec![BacnetValue::Enumerated(62)]);
    data.insert((av3, property::PRESENT_VALUE), vec![BacnetValue::Real(0.0)]);
    data.insert((bv2, property::PRESENT_VALUE), vec![BacnetValue::Enumerated(1)]);

    let store: Store = Arc::new(Mutex::new(data));
    let indexed: Indexed = Arc::new(Mutex::new(HashMap::new()));
    let priorities = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(serve(socket, store.clone(), indexed.clone(), priorities.clone()));
    FakeDevice {
        addr,
        store,
        indexed,
        priorities,
    }
}

async fn serve(
    socket: UdpSocket,
    store: Store,
    indexed: Indexed,
    priorities: Arc<Mutex<Vec<Option<u8>>>>,
) {
    let mut buf = vec![0u8; 1500];
    loop {
        let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let Ok(frame) = decode_frame(&buf[..n]) else {
            continue;
        };
        let reply = match decode_apdu(frame.apdu) {
            Ok(Apdu::UnconfirmedRequest { service: service::WHO_IS, payload }) => {
                let range = decode_who_is(payload).unwrap();
                match range {
                    Some((low, high)) if DEVICE < low || DEVICE > high => None,
                    _ => Some(codec::encode_i_am(ObjectId::device(DEVICE).unwrap(), 1476, 3, 260)),
                }
            }
            Ok(Apdu::ConfirmedRequest { invoke_id, service: service::READ_PROPERTY, payload, .. }) => {
                let req = decode_read_property_request(payload).unwrap();
                let values = match req.array_index {
                    Some(index) => indexed
                        .lock()
                        .get(&(req.object, req.property, index))
                        .map(|value| vec![value.clone()]),
                    None => None,
                }
                .or_else(|| store.lock().get(&(req.object, req.property)).cloned());
                Some(match values {
                    Some(values) => codec::encode_read_property_ack(
                        invoke_id,
                        req.object,
                        req.property,
                        req.array_index,
                        &values,
                    ),
                    // property / unknown-property
                    None => codec::encode_error(invoke_id, service::READ_PROPERTY, 2, 32),
                })
            }
            Ok(Apdu::ConfirmedRequest { invoke_id, service: service::WRITE_PROPERTY, payload, .. }) => {
                let req = decode_write_property_request(payload).unwrap();
                priorities.lock().push(req.priority);
                store
                    .lock()
                    .insert((req.reference.object, req.reference.property), req.values);
                Some(codec::encode_simple_ack(invoke_id, service::WRITE_PROPERTY))
            }
            _ => None,
        };
        if let Some(reply) = reply {
            let _ = socket.send_to(&reply, peer).await;
        }
    }
}

fn tuning() -> DriverTuning {
    DriverTuning {
        bacnet_timeout: Duration::from_millis(300),
        bacnet_discovery_window: Duration::from_millis(400),
        ..DriverTuning::default()
    }
}

async fn connected_driver(device: &FakeDevice) -> BacnetDriver {
    let mut driver = BacnetDriver::new(tuning());
    let config = json!({
        "interface_ip": "127.0.0.1",
        "interface_port": 0,
        "device_id": DEVICE,
        "ip": "127.0.0.1",
        "port": device.addr.port(),
    });
    driver
        .init(&DriverConfig::new("bacnet-ip", config.as_object().cloned().unwrap()))
        .unwrap();
    driver.connect(&DriverContext::default()).await.unwrap();
    driver
}

#[tokio::test]
async fn discovers_reads_and_writes() {
    let device = spawn_device().await;
    let driver = connected_driver(&device).await;
    let ctx = DriverContext::new(Duration::from_secs(5));
    assert_eq!(driver.health(), HealthStatus::Good);

    let points = vec![
        Point::new("supply", "analog-input:1", DataType::Float32),
        Point::new("fan", "bv:2", DataType::Bool),
        Point::new("ghost", "0:99", DataType::Float32),
    ];
    let values = driver.read_points(&ctx, &points).await.unwrap();
    assert_eq!(values["supply"].value, PointValueData::F32(21.5));
    assert_eq!(values["fan"].value, PointValueData::Bool(true));
    assert_eq!(values["ghost"].quality, Quality::Bad);

    let setpoint = Point::new("sp", "analog-value:3", DataType::Float32);
    driver
        .write_point(&ctx, &setpoint, &json!({"value": "22.5", "priority": 8}))
        .await
        .unwrap();
    assert_eq!(
        device.store.lock().get(&(obj(2, 3), property::PRESENT_VALUE)),
        Some(&vec![BacnetValue::Real(22.5)])
    );
    assert_eq!(device.priorities.lock().as_slice(), &[Some(8)]);

    let values = driver.read_points(&ctx, &[setpoint]).await.unwrap();
    assert_eq!(values["sp"].value, PointValueData::F32(22.5));

    driver.disconnect().await.unwrap();
    assert_eq!(driver.health(), HealthStatus::Unknown);
}

#[tokio::test]
async fn invalid_write_value_is_not_sent() {
    let device = spawn_device().await;
    let driver = connected_driver(&device).await;
    let ctx = DriverContext::default();

    let setpoint = Point::new("sp", "analog-value:3", DataType::Float32);
    let err = driver.write_point(&ctx, &setpoint, &json!("warm")).await.unwrap_err();
    assert!(matches!(err, DriverError::Conversion { .. }));
    assert!(device.priorities.lock().is_empty());
}

#[tokio::test]
async fn scans_device_and_objects() {
    let device = spawn_device().await;
    let driver = connected_driver(&device).await;
    let ctx = DriverContext::new(Duration::from_secs(10));

    let scanner = driver.as_scanner().unwrap();
    let params = json!({"low_limit": 1000, "high_limit": 2000});
    let devices = scanner.scan(&ctx, params.as_object().unwrap()).await.unwrap();
    let devices = devices.as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["device_id"], json!(DEVICE));
    assert_eq!(devices[0]["port"], json!(device.addr.port()));
    assert_eq!(devices[0]["object_name"], json!("AHU-1"));
    assert_eq!(devices[0]["vendor_name"], json!("Acme"));
    assert_eq!(devices[0]["status"], json!("online"));

    let objects_scanner = driver.as_object_scanner().unwrap();
    let first = objects_scanner.scan_objects(&ctx, &Default::default()).await.unwrap();
    let first = first.as_array().unwrap();
    assert_eq!(first.len(), 4);
    assert!(first.iter().all(|o| o["diff_status"] == json!("new")));
    let supply = first
        .iter()
        .find(|o| o["address"] == json!("analog-input:1"))
        .unwrap();
    assert_eq!(supply["object_name"], json!("Supply Temp"));
    assert_eq!(supply["units"], json!(62));

    // 设备删除一个对象后再次扫描
    device.store.lock().insert(
        (ObjectId::device(DEVICE).unwrap(), property::OBJECT_LIST),
        vec![
            BacnetValue::ObjectId(ObjectId::device(DEVICE).unwrap()),
            BacnetValue::ObjectId(obj(0, 1)),
            BacnetValue::ObjectId(obj(2, 3)),
        ],
    );
    let second = objects_scanner.scan_objects(&ctx, &Default::default()).await.unwrap();
    let second = second.as_array().unwrap();
    let status_of = |addr: &str| -> Value {
        second
            .iter()
            .find(|o| o["address"] == json!(addr))
            .map(|o| o["diff_status"].clone())
            .unwrap_or(Value::Null)
    };
    assert_eq!(status_of("analog-input:1"), json!("existing"));
    assert_eq!(status_of("binary-value:2"), json!("removed"));
}

/// 整表读取被拒绝时，按下标读取：0 号为长度
fn use_indexed_object_list(device: &FakeDevice, length: u64, entries: &[ObjectId]) {
    let dev = ObjectId::device(DEVICE).unwrap();
    device.store.lock().remove(&(dev, property::OBJECT_LIST));
    let mut indexed = device.indexed.lock();
    indexed.insert((dev, property::OBJECT_LIST, 0), BacnetValue::Unsigned(length));
    for (i, object) in entries.iter().enumerate() {
        indexed.insert(
            (dev, property::OBJECT_LIST, i as u32 + 1),
            BacnetValue::ObjectId(*object),
        );
    }
}

#[tokio::test]
async fn object_list_read_by_index() {
    let device = spawn_device().await;
    let driver = connected_driver(&device).await;
    let ctx = DriverContext::new(Duration::from_secs(10));
    use_indexed_object_list(&device, 2, &[obj(0, 1), obj(2, 3)]);

    let objects = driver
        .as_object_scanner()
        .unwrap()
        .scan_objects(&ctx, &Default::default())
        .await
        .unwrap();
    let mut addresses: Vec<_> = objects
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["address"].as_str().unwrap().to_string())
        .collect();
    addresses.sort();
    assert_eq!(addresses, vec!["analog-input:1", "analog-value:3"]);
}

#[tokio::test]
async fn oversized_object_list_is_rejected() {
    let device = spawn_device().await;
    let driver = connected_driver(&device).await;
    let ctx = DriverContext::new(Duration::from_secs(10));
    use_indexed_object_list(&device, 1 << 61, &[]);

    let err = driver
        .as_object_scanner()
        .unwrap()
        .scan_objects(&ctx, &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::DataParse(_)), "{err:?}");
}

#[tokio::test]
async fn read_without_connect_fails() {
    let driver = BacnetDriver::new(tuning());
    let points = [Point::new("supply", "analog-input:1", DataType::Float32)];
    let err = driver
        .read_points(&DriverContext::default(), &points)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::NotConnected));
}
