//! 内存管理器：带字节计量的 LRU 缓存 + 弱引用消息缓存 + 压力清理
//!
//! LRU 状态由 `ReentrantMutex<RefCell<_>>` 保护：put 在持锁时会重入 cleanup，
//! 清理回调在阻塞线程池上运行，可能再次访问缓存。任何 RefCell 借用都不得跨越重入调用。

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::MemorySection;

/// 清理回调：收到本次清理报告
pub type CleanupCallback = Arc<dyn Fn(&CleanupReport) + Send + Sync>;

/// 监控周期钩子：清除外部持有的失效弱引用，返回清除数
pub type PurgeHook = Arc<dyn Fn() -> usize + Send + Sync>;

/// 一次压力清理的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub evicted_entries: usize,
    pub freed_bytes: usize,
    pub dead_weak_refs: usize,
    pub usage_before: usize,
    pub usage_after: usize,
}

/// 内存管理器统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub entries: usize,
    pub usage_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub cleanups: u64,
    pub weak_entries: usize,
}

struct CacheEntry {
    value: Value,
    size: usize,
    tick: u64,
}

#[derive(Default)]
struct LruState {
    entries: HashMap<String, CacheEntry>,
    /// tick -> key，最小 tick 为最久未使用
    order: BTreeMap<u64, String>,
    usage: usize,
    next_tick: u64,
}

impl LruState {
    fn touch(&mut self, key: &str) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.usage = self.usage.saturating_sub(entry.size);
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<(String, CacheEntry)> {
        let (&tick, _) = self.order.iter().next()?;
        let key = self.order.remove(&tick)?;
        let entry = self.entries.remove(&key)?;
        self.usage = self.usage.saturating_sub(entry.size);
        Some((key, entry))
    }
}

/// 弱引用缓存：只保存 Weak，持有者全部释放后条目自动失效，purge 时清除
pub struct WeakCache<T> {
    items: Mutex<HashMap<String, Weak<T>>>,
}

impl<T> Default for WeakCache<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> WeakCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: &Arc<T>) {
        self.items.lock().insert(key.into(), Arc::downgrade(value));
    }

    /// 仍有强引用时返回 Arc
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.items.lock().get(key).and_then(Weak::upgrade)
    }

    /// 清除已失效条目，返回清除数
    pub fn purge(&self) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|_, w| w.strong_count() > 0);
        before - items.len()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 内存管理器：进程级单例（由 Platform 构造并注入）
pub struct MemoryManager {
    config: MemorySection,
    state: ReentrantMutex<RefCell<LruState>>,
    weak_values: WeakCache<Value>,
    callbacks: Mutex<Vec<CleanupCallback>>,
    purge_hooks: Mutex<Vec<PurgeHook>>,
    cleanup_pool: Arc<Semaphore>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    cleanups: AtomicU64,
    monitor: Mutex<Option<CancellationToken>>,
}

impl MemoryManager {
    pub fn new(config: MemorySection) -> Self {
        let workers = config.cleanup_workers.max(1);
        Self {
            config,
            state: ReentrantMutex::new(RefCell::new(LruState::default())),
            weak_values: WeakCache::new(),
            callbacks: Mutex::new(Vec::new()),
            purge_hooks: Mutex::new(Vec::new()),
            cleanup_pool: Arc::new(Semaphore::new(workers)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
            monitor: Mutex::new(None),
        }
    }

    fn pressure_bytes(&self) -> usize {
        (self.config.max_cache_bytes as f64 * self.config.pressure_ratio) as usize
    }

    fn target_bytes(&self) -> usize {
        (self.config.max_cache_bytes as f64 * self.config.target_ratio) as usize
    }

    /// 写入缓存；超过容量时淘汰最久未使用项，达到压力阈值时触发清理
    pub fn put(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let size = key.len() + value.to_string().len();
        let guard = self.state.lock();
        {
            let mut st = guard.borrow_mut();
            st.remove(&key);
            let tick = st.next_tick;
            st.next_tick += 1;
            st.order.insert(tick, key.clone());
            st.entries.insert(key, CacheEntry { value, size, tick });
            st.usage += size;
            while st.entries.len() > self.config.cache_capacity.max(1) {
                if st.pop_lru().is_none() {
                    break;
                }
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        // 重入：cleanup 会再次获取同一把锁
        if self.is_under_pressure() {
            self.cleanup();
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        let value = st.entries.get(key).map(|e| e.value.clone());
        match value {
            Some(v) => {
                st.touch(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        let guard = self.state.lock();
        let removed = guard.borrow_mut().remove(key).is_some();
        removed
    }

    pub fn len(&self) -> usize {
        let guard = self.state.lock();
        let n = guard.borrow().entries.len();
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn usage_bytes(&self) -> usize {
        let guard = self.state.lock();
        let n = guard.borrow().usage;
        n
    }

    pub fn is_under_pressure(&self) -> bool {
        self.usage_bytes() >= self.pressure_bytes()
    }

    /// 以弱引用登记一个共享值（如总线消息），持有者释放后自动失效
    pub fn track_shared(&self, key: impl Into<String>, value: &Arc<Value>) {
        self.weak_values.insert(key, value);
    }

    pub fn shared(&self, key: &str) -> Option<Arc<Value>> {
        self.weak_values.get(key)
    }

    pub fn register_cleanup_callback(&self, callback: CleanupCallback) {
        self.callbacks.lock().push(callback);
    }

    pub fn register_purge_hook(&self, hook: PurgeHook) {
        self.purge_hooks.lock().push(hook);
    }

    /// 一个监控周期：有压力则清理，否则只清弱引用；随后运行清除钩子。返回钩子清除总数
    pub fn monitor_tick(&self) -> usize {
        if self.is_under_pressure() {
            self.cleanup();
        } else {
            self.weak_values.purge();
        }
        let hooks: Vec<PurgeHook> = self.purge_hooks.lock().clone();
        let purged: usize = hooks.iter().map(|hook| hook()).sum();
        if purged > 0 {
            tracing::debug!(purged, "external weak references purged");
        }
        purged
    }

    /// 压力清理：淘汰 LRU 直到降到目标水位，清除失效弱引用，再把报告派发给回调
    pub fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        {
            let guard = self.state.lock();
            let mut st = guard.borrow_mut();
            report.usage_before = st.usage;
            let target = self.target_bytes();
            while st.usage > target {
                match st.pop_lru() {
                    Some((_, entry)) => {
                        report.evicted_entries += 1;
                        report.freed_bytes += entry.size;
                    }
                    None => break,
                }
            }
            report.usage_after = st.usage;
        }
        report.dead_weak_refs = self.weak_values.purge();
        self.evictions
            .fetch_add(report.evicted_entries as u64, Ordering::Relaxed);
        self.cleanups.fetch_add(1, Ordering::Relaxed);

        if report.evicted_entries > 0 || report.dead_weak_refs > 0 {
            tracing::info!(
                evicted = report.evicted_entries,
                freed_bytes = report.freed_bytes,
                dead_weak_refs = report.dead_weak_refs,
                "memory cleanup"
            );
        }
        self.dispatch_callbacks(&report);
        report
    }

    fn dispatch_callbacks(&self, report: &CleanupReport) {
        let callbacks: Vec<CleanupCallback> = self.callbacks.lock().clone();
        if callbacks.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.cleanup_pool);
                let report = report.clone();
                handle.spawn(async move {
                    for cb in callbacks {
                        let Ok(permit) = Arc::clone(&pool).acquire_owned().await else {
                            return;
                        };
                        let report = report.clone();
                        tokio::task::spawn_blocking(move || {
                            cb(&report);
                            drop(permit);
                        });
                    }
                });
            }
            // 无运行时（同步上下文）时就地执行
            Err(_) => {
                for cb in callbacks {
                    cb(report);
                }
            }
        }
    }

    /// 启动后台监控：按间隔执行 monitor_tick。不在 tokio 运行时内时不启动
    pub fn start_monitor(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime, memory monitor not started");
            return;
        };
        let mut slot = self.monitor.lock();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        let weak = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.monitor_interval_secs.max(1));
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.monitor_tick();
                    }
                }
            }
            tracing::debug!("memory monitor stopped");
        });
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor.lock().is_some()
    }

    pub fn stop_monitor(&self) {
        if let Some(token) = self.monitor.lock().take() {
            token.cancel();
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let (entries, usage_bytes) = {
            let guard = self.state.lock();
            let st = guard.borrow();
            (st.entries.len(), st.usage)
        };
        MemoryStats {
            entries,
            usage_bytes,
            max_bytes: self.config.max_cache_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
            weak_entries: self.weak_values.len(),
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn small_config(capacity: usize, max_bytes: usize) -> MemorySection {
        MemorySection {
            cache_capacity: capacity,
            max_cache_bytes: max_bytes,
            pressure_ratio: 0.85,
            target_ratio: 0.5,
            monitor_interval_secs: 1,
            cleanup_workers: 1,
        }
    }

    #[test]
    fn test_lru_eviction_by_capacity() {
        let mm = MemoryManager::new(small_config(2, 1 << 20));
        mm.put("a", json!(1));
        mm.put("b", json!(2));
        // 访问 a，使 b 成为最久未使用
        assert_eq!(mm.get("a"), Some(json!(1)));
        mm.put("c", json!(3));
        assert_eq!(mm.len(), 2);
        assert!(mm.get("b").is_none());
        assert!(mm.get("a").is_some());
        assert!(mm.get("c").is_some());
    }

    #[test]
    fn test_reput_replaces_without_double_counting() {
        let mm = MemoryManager::new(small_config(10, 1 << 20));
        mm.put("k", json!("v1"));
        let usage = mm.usage_bytes();
        mm.put("k", json!("v2"));
        assert_eq!(mm.len(), 1);
        assert_eq!(mm.usage_bytes(), usage);
    }

    #[test]
    fn test_pressure_cleanup_runs_reentrantly_and_calls_callbacks() {
        let mm = MemoryManager::new(small_config(100, 200));
        let called = Arc::new(AtomicUsize::new(0));
        let c = called.clone();
        mm.register_cleanup_callback(Arc::new(move |_r: &CleanupReport| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        for i in 0..20 {
            mm.put(format!("key-{i}"), json!("0123456789"));
        }
        assert!(mm.usage_bytes() < 200);
        assert!(mm.stats().cleanups >= 1);
        // 无 tokio 运行时：回调就地执行
        assert!(called.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_weak_cache_purges_dropped_values() {
        let mm = MemoryManager::new(small_config(10, 1 << 20));
        let value = Arc::new(json!({"msg": "hello"}));
        mm.track_shared("m1", &value);
        assert!(mm.shared("m1").is_some());
        drop(value);
        assert!(mm.shared("m1").is_none());
        let report = mm.cleanup();
        assert_eq!(report.dead_weak_refs, 1);
        assert_eq!(mm.stats().weak_entries, 0);
    }

    #[tokio::test]
    async fn test_monitor_start_stop() {
        let mm = Arc::new(MemoryManager::new(small_config(10, 1 << 20)));
        mm.start_monitor();
        mm.start_monitor();
        assert!(mm.monitor_running());
        mm.stop_monitor();
        assert!(!mm.monitor_running());
    }

    #[test]
    fn test_monitor_needs_runtime() {
        let mm = Arc::new(MemoryManager::new(small_config(10, 1 << 20)));
        mm.start_monitor();
        assert!(!mm.monitor_running());

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            mm.start_monitor();
            assert!(mm.monitor_running());
            mm.stop_monitor();
        });
    }

    #[test]
    fn test_monitor_tick_runs_purge_hooks() {
        let mm = MemoryManager::new(small_config(10, 1 << 20));
        let external: Arc<WeakCache<Value>> = Arc::new(WeakCache::new());
        let held = Arc::new(json!("kept"));
        let dropped = Arc::new(json!("gone"));
        external.insert("kept".to_string(), &held);
        external.insert("gone".to_string(), &dropped);
        drop(dropped);

        let cache = Arc::clone(&external);
        mm.register_purge_hook(Arc::new(move || cache.purge()));
        assert_eq!(mm.monitor_tick(), 1);
        assert_eq!(external.len(), 1);
        assert_eq!(mm.monitor_tick(), 0);
    }
}
