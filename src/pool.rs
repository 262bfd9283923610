// A small async pool of reusable resources, handed out one at a time and
// returned to the pool when the guard is dropped. Currently unused: local
// worker concurrency is bounded by spawning exactly N independent loop
// tasks instead, since there's no shared resource to guard. Kept around for
// whichever future worker population does need one.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

/// A bounded pool of `T`s. `get()` waits until an item is available, and
/// returns it automatically when the returned guard is dropped.
pub struct Pool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Pool<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(items.into_iter().collect()),
                notify: Notify::new(),
            }),
        }
    }

    /// Number of idle items currently sitting in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub async fn get(&self) -> PoolGuard<T> {
        loop {
            {
                let mut items = self.inner.items.lock();
                if let Some(item) = items.pop_front() {
                    return PoolGuard {
                        inner: self.inner.clone(),
                        item: Some(item),
                    };
                }
            }
            self.inner.notify.notified().await;
        }
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// RAII handle to a single pooled item. Returns it to the pool on drop.
pub struct PoolGuard<T> {
    inner: Arc<Inner<T>>,
    item: Option<T>,
}

impl<T> std::ops::Deref for PoolGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().expect("item taken before drop")
    }
}

impl<T> std::ops::DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("item taken before drop")
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.inner.items.lock().push_back(item);
            self.inner.notify.notify_one();
        }
    }
}
