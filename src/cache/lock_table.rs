use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

/// 单个 key 的闸门：busy 表示有人正在计算
#[derive(Default)]
struct Gate {
    busy: Mutex<bool>,
    cond: Condvar,
    notify: Notify,
}

impl Gate {
    fn acquire(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.cond.wait(&mut busy);
        }
        *busy = true;
    }

    async fn acquire_async(&self) {
        loop {
            let notified = {
                let mut busy = self.busy.lock();
                if !*busy {
                    *busy = true;
                    return;
                }
                // 在持锁时创建 future，release 的 notify_waiters 不会漏掉它
                self.notify.notified()
            };
            notified.await;
        }
    }

    fn release(&self) {
        *self.busy.lock() = false;
        self.cond.notify_all();
        self.notify.notify_waiters();
    }
}

/// 按 key 分的锁表（single-flight 的“进行中”占位）
///
/// map 本身只在取/删闸门时短暂加锁；计算期间只占用该 key 的闸门，
/// 不同 key 之间互不阻塞。同步与 async 调用方可以混用同一张表。
pub struct LockTable<K: Eq + Hash + Clone> {
    gates: DashMap<K, Arc<Gate>>,
}

impl<K: Eq + Hash + Clone> Default for LockTable<K> {
    fn default() -> Self {
        Self {
            gates: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> LockTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self, key: &K) -> Arc<Gate> {
        self.gates.entry(key.clone()).or_default().clone()
    }

    /// 阻塞直到拿到该 key
    pub fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let gate = self.gate(&key);
        gate.acquire();
        KeyGuard {
            table: self,
            key,
            gate,
        }
    }

    /// 挂起直到拿到该 key；future 被取消时不会占住闸门
    pub async fn lock_async(&self, key: K) -> KeyGuard<'_, K> {
        let gate = self.gate(&key);
        gate.acquire_async().await;
        KeyGuard {
            table: self,
            key,
            gate,
        }
    }

    /// 当前登记的 key 数（只用于观测）
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

pub struct KeyGuard<'a, K: Eq + Hash + Clone> {
    table: &'a LockTable<K>,
    key: K,
    gate: Arc<Gate>,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        self.gate.release();
        // 表里一份 + 自己一份 = 没有其他等待者，可以回收
        self.table
            .gates
            .remove_if(&self.key, |_, g| Arc::strong_count(g) <= 2);
    }
}
