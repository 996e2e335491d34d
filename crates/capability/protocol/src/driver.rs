//! 驱动能力接口与注册表
//!
//! ```text
//! 进程启动
//!     │  register_all(&mut registry, &tuning)
//!     ▼
//! DriverRegistry { "bacnet-ip" → factory, "opc-ua" → factory, ... }
//!     │  get_driver(channel.protocol)
//!     ▼
//! Box<dyn Driver> ── init → connect → read_points / write_point → disconnect
//!     │
//!     ├── as_scanner()         设备发现（可选能力）
//!     └── as_object_scanner()  对象/点位发现（可选能力）
//! ```

use crate::error::DriverError;
use crate::types::{DriverContext, HealthStatus};
use async_trait::async_trait;
use domain::{DriverConfig, Point, PointValue};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// 每个协议驱动都要实现的能力契约
#[async_trait]
pub trait Driver: Send + Sync {
    /// 校验并保存配置，不做任何 IO
    fn init(&mut self, config: &DriverConfig) -> Result<(), DriverError>;

    /// 建立底层会话；必须遵守上下文的取消与超时
    async fn connect(&self, ctx: &DriverContext) -> Result<(), DriverError>;

    /// 释放会话，可重复调用
    async fn disconnect(&self) -> Result<(), DriverError>;

    /// 非阻塞的健康状态查询
    fn health(&self) -> HealthStatus;

    /// 多从站协议复用同一驱动实例时切换从站地址
    fn set_slave_id(&self, _slave_id: u8) -> Result<(), DriverError> {
        Ok(())
    }

    /// 切换到另一台物理设备/端点
    async fn set_device_config(&self, _config: &Map<String, Value>) -> Result<(), DriverError> {
        Ok(())
    }

    /// 批量读取；单点失败以 `Quality::Bad` 体现，只有无可用连接时才返回错误
    async fn read_points(
        &self,
        ctx: &DriverContext,
        points: &[Point],
    ) -> Result<HashMap<String, PointValue>, DriverError>;

    /// 单点写入；值在发送前必须经过 [`crate::cast_value`] 转换
    async fn write_point(
        &self,
        ctx: &DriverContext,
        point: &Point,
        value: &Value,
    ) -> Result<(), DriverError>;

    fn as_scanner(&self) -> Option<&dyn Scanner> {
        None
    }

    fn as_object_scanner(&self) -> Option<&dyn ObjectScanner> {
        None
    }
}

/// 设备发现能力
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, ctx: &DriverContext, params: &Map<String, Value>)
        -> Result<Value, DriverError>;
}

/// 已知设备上的对象/点位发现能力
#[async_trait]
pub trait ObjectScanner: Send + Sync {
    async fn scan_objects(
        &self,
        ctx: &DriverContext,
        params: &Map<String, Value>,
    ) -> Result<Value, DriverError>;
}

/// 驱动工厂
pub type DriverFactory = Arc<dyn Fn() -> Box<dyn Driver> + Send + Sync>;

/// 协议名 → 工厂 的注册表
///
/// 由进程启动代码持有并向下传递，测试中每个用例可以创建独立实例。
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册驱动工厂；同名重复注册时后者覆盖前者，返回是否发生了覆盖
    pub fn register<F>(&mut self, name: &str, factory: F) -> bool
    where
        F: Fn() -> Box<dyn Driver> + Send + Sync + 'static,
    {
        let replaced = self
            .factories
            .insert(name.to_string(), Arc::new(factory))
            .is_some();
        if replaced {
            tracing::warn!(protocol = name, "driver factory replaced");
        }
        replaced
    }

    /// 按协议名创建新的驱动实例
    pub fn get_driver(&self, name: &str) -> Result<Box<dyn Driver>, DriverError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| DriverError::NotFound(format!("driver {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// 已注册协议名（排序）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("protocols", &self.names())
            .finish()
    }
}
