//! OPC-UA 协议支持
//!
//! ```text
//! OpcUaDriver
//!   └── clients: endpoint URL → ClientWrapper（每个端点一个会话）
//!         └── subscriptions: device_id → DeviceSubscription（监控项 + 值缓存）
//! ```
//!
//! 传输与会话委托给 async-opcua（[`backend`]），本模块只负责会话编排。

pub mod backend;
pub mod browse;
pub mod driver;
pub mod session;
pub mod subscription;
pub mod variant;

pub use backend::AsyncOpcuaConnector;
pub use browse::BrowsedNode;
pub use driver::{ClientWrapper, OpcUaDriver, DEFAULT_ROOT_NODE};
pub use session::{
    BrowseEntry, EndpointConfig, MonitoredNode, NodeKind, Notification, SecurityMode,
    SecurityPolicy, SubscriptionRequest, UaConnector, UaReading, UaSession,
};
pub use subscription::{subscription_key, DeviceSubscription};

/// 注册名
pub const PROTOCOL: &str = "opc-ua";
