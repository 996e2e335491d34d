//! 地址空间浏览
//!
//! 使用独立会话，浏览失败时关闭会话、重新连接后重试，重试耗尽才返回错误。

use super::session::{EndpointConfig, NodeKind, UaConnector, UaSession};
use crate::error::DriverError;
use crate::types::DriverContext;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

/// 数据类型批量读取的分片大小
const DATA_TYPE_BATCH: usize = 200;

/// 浏览得到的节点（即扫描结果记录）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowsedNode {
    pub node_id: String,
    pub browse_name: String,
    pub display_name: String,
    #[serde(rename = "node_class")]
    pub kind: NodeKind,
    pub data_type: Option<String>,
    /// 从根节点开始的 browse name 路径
    pub path: String,
}

pub struct Browser<'a> {
    ctx: &'a DriverContext,
    connector: &'a dyn UaConnector,
    endpoint: &'a EndpointConfig,
    session: Arc<dyn UaSession>,
    retries: u32,
    max_depth: u32,
}

impl<'a> Browser<'a> {
    pub fn new(
        ctx: &'a DriverContext,
        connector: &'a dyn UaConnector,
        endpoint: &'a EndpointConfig,
        session: Arc<dyn UaSession>,
        retries: u32,
        max_depth: u32,
    ) -> Self {
        Self {
            ctx,
            connector,
            endpoint,
            session,
            retries: retries.max(1),
            max_depth,
        }
    }

    /// 当前会话（重连后会变化），调用方负责最终关闭
    pub fn session(&self) -> Arc<dyn UaSession> {
        self.session.clone()
    }

    async fn with_retry<T, F, Fut>(&mut self, what: &str, op: F) -> Result<T, DriverError>
    where
        F: Fn(Arc<dyn UaSession>) -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let mut attempt = 1;
        loop {
            let err = match self.ctx.run(op(self.session.clone())).await {
                Ok(value) => return Ok(value),
                Err(DriverError::Cancelled) => return Err(DriverError::Cancelled),
                Err(err) => err,
            };
            if attempt >= self.retries {
                tracing::warn!(what, attempt, error = %err, "opc-ua browse retries exhausted");
                return Err(err);
            }
            attempt += 1;
            gw_telemetry::record_browse_retry();
            tracing::warn!(what, attempt, error = %err, "opc-ua browse failed, reconnecting");

            self.session.close().await;
            match self.ctx.run(self.connector.connect(self.endpoint)).await {
                Ok(session) => self.session = session,
                Err(DriverError::Cancelled) => return Err(DriverError::Cancelled),
                Err(reconnect_err) => {
                    tracing::warn!(what, error = %reconnect_err, "opc-ua browse reconnect failed");
                }
            }
        }
    }

    /// 深度优先遍历 `root` 之下的 Object 与 Variable 节点
    pub async fn browse_tree(&mut self, root: &str) -> Result<Vec<BrowsedNode>, DriverError> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root.to_string());
        let mut nodes = Vec::new();
        let mut stack: Vec<(String, u32, String)> = vec![(root.to_string(), 0, String::new())];

        while let Some((node_id, depth, path)) = stack.pop() {
            if self.ctx.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            let entries = self
                .with_retry("browse", |session| {
                    let node_id = node_id.clone();
                    async move { session.browse(&node_id).await }
                })
                .await?;

            for entry in entries {
                if entry.kind == NodeKind::Other || !visited.insert(entry.node_id.clone()) {
                    continue;
                }
                let child_path = if path.is_empty() {
                    entry.browse_name.clone()
                } else {
                    format!("{path}/{}", entry.browse_name)
                };
                if entry.kind == NodeKind::Object && depth + 1 < self.max_depth {
                    stack.push((entry.node_id.clone(), depth + 1, child_path.clone()));
                }
                nodes.push(BrowsedNode {
                    node_id: entry.node_id,
                    browse_name: entry.browse_name,
                    display_name: entry.display_name,
                    kind: entry.kind,
                    data_type: None,
                    path: child_path,
                });
            }
        }

        self.fill_data_types(&mut nodes).await?;
        Ok(nodes)
    }

    async fn fill_data_types(&mut self, nodes: &mut [BrowsedNode]) -> Result<(), DriverError> {
        let variables: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind == NodeKind::Variable)
            .map(|(i, _)| i)
            .collect();

        for chunk in variables.chunks(DATA_TYPE_BATCH) {
            let ids: Vec<String> = chunk.iter().map(|&i| nodes[i].node_id.clone()).collect();
            let types = self
                .with_retry("read data types", |session| {
                    let ids = ids.clone();
                    async move { session.read_data_types(&ids).await }
                })
                .await?;
            for (&i, data_type) in chunk.iter().zip(types) {
                nodes[i].data_type = data_type;
            }
        }
        Ok(())
    }
}
