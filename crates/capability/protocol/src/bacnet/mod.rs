//! BACnet/IP 协议支持
//!
//! - [`codec`]：无状态的 BVLC / NPDU / APDU 编解码
//! - [`client`]：UDP socket、invoke ID 关联、Who-Is / I-Am 收集
//! - [`driver`]：`Driver` / `Scanner` / `ObjectScanner` 实现

pub mod client;
pub mod codec;
pub mod driver;

pub use client::{BacnetClient, Destination, DiscoveredDevice};
pub use codec::{BacnetValue, CodecError, ObjectId};
pub use driver::{parse_point_address, BacnetDriver, PointAddress};

/// 注册名
pub const PROTOCOL: &str = "bacnet-ip";
