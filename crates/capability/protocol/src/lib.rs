//! # 协议驱动能力模块
//!
//! 为网关提供统一的现场设备访问能力，支持：
//! - **BACnet/IP**：Who-Is / I-Am 设备发现、ReadProperty / WriteProperty、对象列表扫描
//! - **OPC-UA**：端点会话复用、订阅缓存、带重连重试的地址空间浏览
//! - **Modbus TCP / RTU over TCP**：经典寄存器地址读写
//! - **模拟驱动**：EtherNet/IP、三菱 SLMP、欧姆龙 FINS、S7、DLT645
//!
//! ## 架构设计
//!
//! ```text
//! 通道配置 (protocol + config)
//!       │
//!       ▼
//! DriverRegistry ── register_all() 在进程启动时注册
//!       │  get_driver(protocol)
//!       ▼
//! Box<dyn Driver>
//!       ├── BacnetDriver ──── BacnetClient (UDP 47808) ── codec
//!       ├── OpcUaDriver ───── ClientWrapper / DeviceSubscription ── async-opcua
//!       ├── ModbusTcpDriver ─ tokio-modbus
//!       └── SimulatedDriver
//!       │
//!       ▼
//! HashMap<point_id, PointValue>（每点带质量标志与时间戳）
//! ```
//!
//! ## 写入路径
//!
//! 所有驱动的 `write_point` 都先调用 [`cast_value`] 将外部 JSON 值转换为点位声明类型，
//! 转换失败返回 [`DriverError::Conversion`]，不会发送任何报文。

pub mod bacnet;
mod cast;
mod driver;
mod error;
pub mod modbus_tcp;
pub mod opcua;
pub mod simulated;
mod types;

pub use bacnet::BacnetDriver;
pub use cast::{cast_value, cast_value_by_name};
pub use driver::{Driver, DriverFactory, DriverRegistry, ObjectScanner, Scanner};
pub use error::DriverError;
pub use modbus_tcp::{ModbusTcpDriver, Transport};
pub use opcua::OpcUaDriver;
pub use simulated::SimulatedDriver;
pub use types::*;

/// 向注册表注册全部内置驱动
pub fn register_all(registry: &mut DriverRegistry, tuning: &DriverTuning) {
    let t = tuning.clone();
    registry.register(bacnet::PROTOCOL, move || Box::new(BacnetDriver::new(t.clone())));

    let t = tuning.clone();
    registry.register(opcua::PROTOCOL, move || Box::new(OpcUaDriver::new(t.clone())));

    registry.register(modbus_tcp::PROTOCOL_TCP, || {
        Box::new(ModbusTcpDriver::new(Transport::Tcp))
    });
    registry.register(modbus_tcp::PROTOCOL_RTU_OVER_TCP, || {
        Box::new(ModbusTcpDriver::new(Transport::RtuOverTcp))
    });

    for protocol in simulated::SIMULATED_PROTOCOLS {
        registry.register(protocol, move || Box::new(SimulatedDriver::new(protocol)));
    }
    tracing::debug!(protocols = ?registry.names(), "protocol drivers registered");
}
