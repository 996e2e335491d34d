//! 驱动公共类型定义

use crate::error::DriverError;
use gw_config::GatewayConfig;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 驱动健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Good,
    Bad,
}

/// 调用上下文：取消令牌 + 超时上限
///
/// 所有网络操作（连接、读、写、浏览）都通过 [`DriverContext::run`] 执行，
/// 保证调用方取消或超时后立即返回而不是无限阻塞。
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub cancel: CancellationToken,
    pub timeout: Duration,
}

impl DriverContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            timeout,
        }
    }

    /// 共享取消令牌、收紧超时的子上下文
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            cancel: self.cancel.clone(),
            timeout: timeout.min(self.timeout),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 在取消令牌与超时约束下执行 future
    pub async fn run<F, T>(&self, fut: F) -> Result<T, DriverError>
    where
        F: Future<Output = Result<T, DriverError>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DriverError::Cancelled),
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(DriverError::Timeout(format!(
                    "operation exceeded {} ms",
                    self.timeout.as_millis()
                ))),
            },
        }
    }
}

impl Default for DriverContext {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// 进程级驱动调优参数（来自 `GatewayConfig`）
#[derive(Debug, Clone)]
pub struct DriverTuning {
    pub bacnet_timeout: Duration,
    pub bacnet_discovery_window: Duration,
    pub bacnet_recovery_interval: Duration,
    pub bacnet_point_cooldown: Duration,
    pub opcua_connect_timeout: Duration,
    pub opcua_reconnect_timeout: Duration,
    pub opcua_browse_max_depth: u32,
    pub opcua_browse_retries: u32,
    pub opcua_sampling_interval_ms: f64,
    pub opcua_publish_interval: Duration,
    pub opcua_queue_size: usize,
    pub opcua_use_subscription: bool,
}

impl Default for DriverTuning {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for DriverTuning {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            bacnet_timeout: Duration::from_millis(config.bacnet_timeout_ms),
            bacnet_discovery_window: Duration::from_millis(config.bacnet_discovery_window_ms),
            bacnet_recovery_interval: Duration::from_secs(config.bacnet_recovery_interval_seconds),
            bacnet_point_cooldown: Duration::from_secs(config.bacnet_point_cooldown_seconds),
            opcua_connect_timeout: Duration::from_millis(config.opcua_connect_timeout_ms),
            opcua_reconnect_timeout: Duration::from_millis(config.opcua_reconnect_timeout_ms),
            opcua_browse_max_depth: config.opcua_browse_max_depth,
            opcua_browse_retries: config.opcua_browse_retries.max(1),
            opcua_sampling_interval_ms: config.opcua_sampling_interval_ms as f64,
            opcua_publish_interval: Duration::from_millis(config.opcua_publish_interval_ms),
            opcua_queue_size: config.opcua_queue_size.max(1),
            opcua_use_subscription: config.opcua_use_subscription,
        }
    }
}

/// 获取当前时间戳（毫秒）
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_times_out() {
        let ctx = DriverContext::new(Duration::from_millis(20));
        let res: Result<(), _> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(DriverError::Timeout(_))));
    }

    #[tokio::test]
    async fn run_observes_cancellation() {
        let ctx = DriverContext::new(Duration::from_secs(5));
        ctx.cancel.cancel();
        let res: Result<(), _> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(DriverError::Cancelled)));
    }

    #[test]
    fn child_context_never_extends_timeout() {
        let ctx = DriverContext::new(Duration::from_secs(2));
        assert_eq!(ctx.with_timeout(Duration::from_secs(10)).timeout, Duration::from_secs(2));
        assert_eq!(ctx.with_timeout(Duration::from_millis(500)).timeout, Duration::from_millis(500));
    }
}
