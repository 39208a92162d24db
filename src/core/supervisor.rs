//! 任务监管：每个任务一个子 CancellationToken，平台停止时整体取消

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// 任务级生命周期管理
#[derive(Debug, Default)]
pub struct TaskSupervisor {
    root: Mutex<CancellationToken>,
    tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为任务登记子 token；根 token 取消时所有子 token 一并取消
    pub fn register(&self, task_id: &str) -> CancellationToken {
        let token = self.root.lock().child_token();
        self.tasks.lock().insert(task_id.to_string(), token.clone());
        token
    }

    /// 移除任务登记（任务结束时调用），返回是否存在
    pub fn release(&self, task_id: &str) -> bool {
        self.tasks.lock().remove(task_id).is_some()
    }

    pub fn cancel_task(&self, task_id: &str) -> bool {
        match self.tasks.lock().get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部任务（平台停止）
    pub fn cancel_all(&self) {
        self.root.lock().cancel();
    }

    /// 重新启动后换一个新的根 token
    pub fn reset(&self) {
        let mut root = self.root.lock();
        if root.is_cancelled() {
            *root = CancellationToken::new();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.lock().is_cancelled()
    }

    pub fn active_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_single_and_all() {
        let sup = TaskSupervisor::new();
        let a = sup.register("a");
        let b = sup.register("b");
        assert!(sup.cancel_task("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        sup.cancel_all();
        assert!(b.is_cancelled());
        assert!(sup.release("a"));
        assert!(!sup.release("a"));
        assert_eq!(sup.active_tasks(), vec!["b".to_string()]);
        sup.reset();
        assert!(!sup.is_shutdown());
        assert!(!sup.register("c").is_cancelled());
    }
}
