//! Observer registry with snapshot dispatch.
//!
//! Handlers are identified by `Arc` pointer identity. Dispatch always works
//! on a snapshot taken when notification starts, so a handler may add or
//! remove handlers (itself included) while it runs.

use std::sync::Arc;

use parking_lot::Mutex;

pub struct Handlers<T: ?Sized> {
    inner: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> Handlers<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Returns false if the handler was already attached.
    pub fn add(&self, handler: Arc<T>) -> bool {
        let mut inner = self.inner.lock();
        if inner.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        inner.push(handler);
        true
    }

    /// Returns false if the handler was not attached.
    pub fn remove(&self, handler: &Arc<T>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|h| !Arc::ptr_eq(h, handler));
        inner.len() != before
    }

    /// Current handlers in attachment order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.inner.lock().clone()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<T: ?Sized> Default for Handlers<T> {
    fn default() -> Self {
        Self::new()
    }
}
