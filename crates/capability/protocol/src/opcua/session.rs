//! OPC-UA 会话层抽象
//!
//! 编排逻辑（客户端表、订阅缓存、浏览重试）只依赖这里的两个 trait；
//! 二进制传输与会话由 [`super::backend`] 基于 async-opcua 实现，测试中可以替换为内存实现。

use crate::error::DriverError;
use async_trait::async_trait;
use domain::PointValueData;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// 安全策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SecurityPolicy {
    #[default]
    None,
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
    Aes128Sha256RsaOaep,
    Aes256Sha256RsaPss,
}

impl FromStr for SecurityPolicy {
    type Err = DriverError;

    /// 接受短名或完整 URI（`http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256`）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.rsplit('#').next().unwrap_or(s).trim();
        let policy = match name.to_ascii_lowercase().as_str() {
            "" | "none" => Self::None,
            "basic128rsa15" => Self::Basic128Rsa15,
            "basic256" => Self::Basic256,
            "basic256sha256" => Self::Basic256Sha256,
            "aes128sha256rsaoaep" | "aes128_sha256_rsaoaep" => Self::Aes128Sha256RsaOaep,
            "aes256sha256rsapss" | "aes256_sha256_rsapss" => Self::Aes256Sha256RsaPss,
            _ => {
                return Err(DriverError::ConfigParse(format!(
                    "unknown security_policy: {s}"
                )))
            }
        };
        Ok(policy)
    }
}

/// 消息安全模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

impl FromStr for SecurityMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "sign" => Ok(Self::Sign),
            "signandencrypt" | "sign_and_encrypt" | "sign-and-encrypt" => Ok(Self::SignAndEncrypt),
            _ => Err(DriverError::ConfigParse(format!("unknown security_mode: {s}"))),
        }
    }
}

/// 端点连接参数
#[derive(Clone, PartialEq, Eq, Default)]
pub struct EndpointConfig {
    pub url: String,
    pub security_policy: SecurityPolicy,
    pub security_mode: SecurityMode,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl EndpointConfig {
    pub fn anonymous(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

// 密码不进日志
impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("url", &self.url)
            .field("security_policy", &self.security_policy)
            .field("security_mode", &self.security_mode)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// 单个节点的读数
#[derive(Debug, Clone, PartialEq)]
pub struct UaReading {
    pub value: PointValueData,
    pub good: bool,
    /// 原始状态码
    pub status: u32,
    pub source_ts_ms: Option<i64>,
}

impl UaReading {
    pub fn good(value: PointValueData) -> Self {
        Self {
            value,
            good: true,
            status: 0,
            source_ts_ms: None,
        }
    }

    pub fn bad(status: u32) -> Self {
        Self {
            value: PointValueData::Null,
            good: false,
            status,
            source_ts_ms: None,
        }
    }
}

/// 数据变化通知
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub handle: u32,
    pub reading: UaReading,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredNode {
    pub handle: u32,
    pub node_id: String,
}

/// 创建订阅所需参数
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub publish_interval: Duration,
    pub sampling_interval_ms: f64,
    pub queue_size: u32,
    pub items: Vec<MonitoredNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeKind {
    Object,
    Variable,
    Other,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Object => "Object",
            Self::Variable => "Variable",
            Self::Other => "Other",
        }
    }
}

/// 浏览得到的一条前向层级引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseEntry {
    pub node_id: String,
    pub browse_name: String,
    pub display_name: String,
    pub kind: NodeKind,
}

/// 已建立的会话
#[async_trait]
pub trait UaSession: Send + Sync {
    /// 批量读取 Value 属性，结果与输入一一对应；无法解析的 NodeId 以 bad 读数返回
    async fn read_values(&self, nodes: &[String]) -> Result<Vec<UaReading>, DriverError>;

    /// 写单个节点；非 Good 状态返回 `DriverError::Status`
    async fn write_value(&self, node: &str, value: &PointValueData) -> Result<(), DriverError>;

    /// 批量读取 DataType 属性（数据类型名称）
    async fn read_data_types(&self, nodes: &[String]) -> Result<Vec<Option<String>>, DriverError>;

    /// 前向层级引用
    async fn browse(&self, node: &str) -> Result<Vec<BrowseEntry>, DriverError>;

    /// 创建订阅与监控项，通知投递到有界队列；返回服务端订阅 ID
    async fn subscribe(
        &self,
        request: SubscriptionRequest,
        sink: mpsc::Sender<Notification>,
    ) -> Result<u32, DriverError>;

    async fn unsubscribe(&self, subscription_id: u32) -> Result<(), DriverError>;

    fn is_connected(&self) -> bool;

    /// 关闭会话，可重复调用
    async fn close(&self);
}

/// 会话工厂
#[async_trait]
pub trait UaConnector: Send + Sync {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn UaSession>, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_names_and_uris() {
        assert_eq!("None".parse::<SecurityPolicy>().unwrap(), SecurityPolicy::None);
        assert_eq!(
            "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
                .parse::<SecurityPolicy>()
                .unwrap(),
            SecurityPolicy::Basic256Sha256
        );
        assert_eq!(
            "aes256sha256rsapss".parse::<SecurityPolicy>().unwrap(),
            SecurityPolicy::Aes256Sha256RsaPss
        );
        assert!("Basic512".parse::<SecurityPolicy>().is_err());
    }

    #[test]
    fn modes() {
        assert_eq!("SignAndEncrypt".parse::<SecurityMode>().unwrap(), SecurityMode::SignAndEncrypt);
        assert_eq!("sign".parse::<SecurityMode>().unwrap(), SecurityMode::Sign);
        assert!("encrypt".parse::<SecurityMode>().is_err());
    }

    #[test]
    fn password_is_masked() {
        let endpoint = EndpointConfig {
            password: Some("secret".to_string()),
            ..EndpointConfig::anonymous("opc.tcp://plc:4840")
        };
        let text = format!("{endpoint:?}");
        assert!(!text.contains("secret"));
        assert!(text.contains("***"));
    }
}
