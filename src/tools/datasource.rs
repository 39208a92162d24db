//! 数据源连通性探测
//!
//! 探测本身只做一次尝试；重试与退避由 SQL 生成工具负责。

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectivityReport {
    pub fn connected() -> Self {
        Self {
            connected: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            connected: false,
            error: Some(error.into()),
        }
    }
}

/// 数据源探测
#[async_trait]
pub trait DataSourceProbe: Send + Sync {
    async fn check_connection(&self, data_source: &Value) -> ConnectivityReport;
}

/// 根据上下文中的数据源描述判断：描述里带标识（id / source_id / connection_string / name）即视为可连接
#[derive(Debug, Default)]
pub struct ContextDataSourceProbe;

const SOURCE_ID_KEYS: [&str; 4] = ["id", "source_id", "connection_string", "name"];

#[async_trait]
impl DataSourceProbe for ContextDataSourceProbe {
    async fn check_connection(&self, data_source: &Value) -> ConnectivityReport {
        let Some(obj) = data_source.as_object() else {
            return ConnectivityReport::failed("no data source context");
        };
        let identified = SOURCE_ID_KEYS.iter().any(|k| match obj.get(*k) {
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Number(_)) => true,
            _ => false,
        });
        if identified {
            ConnectivityReport::connected()
        } else {
            ConnectivityReport::failed("data source context does not identify a source")
        }
    }
}

/// 固定结果的探测器；记录调用次数（用于测试重试策略）
#[derive(Debug)]
pub struct StaticProbe {
    /// 前 fail_times 次失败，之后成功；usize::MAX 表示永远失败
    fail_times: usize,
    calls: AtomicUsize,
}

impl StaticProbe {
    pub fn always_connected() -> Self {
        Self::failing_first(0)
    }

    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn failing_first(fail_times: usize) -> Self {
        Self {
            fail_times,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSourceProbe for StaticProbe {
    async fn check_connection(&self, _data_source: &Value) -> ConnectivityReport {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_times {
            ConnectivityReport::failed(format!("connection refused (attempt {})", n + 1))
        } else {
            ConnectivityReport::connected()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_context_probe() {
        let probe = ContextDataSourceProbe;
        assert!(probe.check_connection(&json!({"id": "ds-1"})).await.connected);
        assert!(probe.check_connection(&json!({"source_id": 7})).await.connected);
        assert!(!probe.check_connection(&json!({"id": "  "})).await.connected);
        assert!(!probe.check_connection(&Value::Null).await.connected);
    }

    #[tokio::test]
    async fn test_static_probe_fails_first_n() {
        let probe = StaticProbe::failing_first(2);
        assert!(!probe.check_connection(&Value::Null).await.connected);
        assert!(!probe.check_connection(&Value::Null).await.connected);
        assert!(probe.check_connection(&Value::Null).await.connected);
        assert_eq!(probe.calls(), 3);
    }
}
