//! 驱动错误类型定义

/// 驱动调用错误
///
/// 单点读失败不走这里：它体现为返回结果中 `Quality::Bad` 的条目。
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// 连接错误（会话不存在或不可达）
    #[error("connection error: {0}")]
    Connection(String),

    /// 驱动尚未连接
    #[error("driver not connected")]
    NotConnected,

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),

    /// 调用方取消
    #[error("operation cancelled")]
    Cancelled,

    /// BACnet Reject PDU
    #[error("request rejected by peer (invoke_id={invoke_id}, reason={reason})")]
    Reject { invoke_id: u8, reason: u8 },

    /// BACnet Error PDU
    #[error("peer returned error (invoke_id={invoke_id}, class={class}, code={code})")]
    Protocol { invoke_id: u8, class: u32, code: u32 },

    /// BACnet Abort PDU
    #[error("transaction aborted (invoke_id={invoke_id}, reason={reason})")]
    Abort { invoke_id: u8, reason: u8 },

    /// 写入值无法转换为点位声明的数据类型
    #[error("cannot convert {value} to {target}")]
    Conversion { value: String, target: String },

    /// OPC-UA 非 Good 状态码
    #[error("bad status 0x{code:08X}: {message}")]
    Status { code: u32, message: String },

    /// Modbus 错误
    #[error("modbus error: {0}")]
    Modbus(String),

    /// 配置解析错误
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// 数据解析错误
    #[error("data parse error: {0}")]
    DataParse(String),

    /// 未注册的驱动或未知对象
    #[error("not found: {0}")]
    NotFound(String),

    /// 驱动不支持该操作
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 通道关闭
    #[error("channel closed")]
    ChannelClosed,
}

impl DriverError {
    /// 是否属于可重试的瞬态错误
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connection(_) | Self::Io(_))
    }

    pub fn conversion(value: impl ToString, target: impl ToString) -> Self {
        Self::Conversion {
            value: value.to_string(),
            target: target.to_string(),
        }
    }
}
