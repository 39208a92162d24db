//! 工具调度：Semaphore 限制单进程内并发执行的工具数

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::IaopError;

/// 工具并发调度器（所有任务共享）
#[derive(Debug)]
pub struct TaskScheduler {
    tool_semaphore: Arc<Semaphore>,
    max_concurrent_tools: usize,
    granted: AtomicU64,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        let max = max_concurrent_tools.max(1);
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max)),
            max_concurrent_tools: max,
            granted: AtomicU64::new(0),
        }
    }

    /// 获取工具执行许可；调度器关闭后返回 Cancelled
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, IaopError> {
        let permit = self
            .tool_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IaopError::Cancelled)?;
        self.granted.fetch_add(1, Ordering::Relaxed);
        Ok(permit)
    }

    /// 关闭后所有等待中与后续的 acquire_tool 立即失败
    pub fn close(&self) {
        self.tool_semaphore.close();
    }

    pub fn available_permits(&self) -> usize {
        self.tool_semaphore.available_permits()
    }

    pub fn max_concurrent_tools(&self) -> usize {
        self.max_concurrent_tools
    }

    /// 累计发放的许可数
    pub fn permits_granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_bounded_and_released() {
        let scheduler = TaskScheduler::new(2);
        let a = scheduler.acquire_tool().await.unwrap();
        let _b = scheduler.acquire_tool().await.unwrap();
        assert_eq!(scheduler.available_permits(), 0);
        drop(a);
        assert_eq!(scheduler.available_permits(), 1);
        assert_eq!(scheduler.permits_granted(), 2);
    }

    #[tokio::test]
    async fn test_closed_scheduler_rejects() {
        let scheduler = TaskScheduler::new(1);
        scheduler.close();
        assert!(matches!(scheduler.acquire_tool().await, Err(IaopError::Cancelled)));
    }
}
