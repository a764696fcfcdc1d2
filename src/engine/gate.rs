//! Exclusive access gate
//!
//! A named async mutex around the state it protects. Held across awaits
//! (a model load), so it is a tokio mutex rather than a blocking one.

use std::ops::{Deref, DerefMut};
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard};

/// Mutual-exclusion gate owning `T`
#[derive(Debug)]
pub struct ExclusiveGate<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> ExclusiveGate<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: Mutex::new(value),
        }
    }

    /// Wait for exclusive access
    pub async fn enter(&self) -> GateGuard<'_, T> {
        let start = Instant::now();
        let guard = self.inner.lock().await;
        tracing::trace!("Entered {} gate after {:?}", self.name, start.elapsed());
        GateGuard {
            name: self.name,
            entered: Instant::now(),
            guard,
        }
    }
}

/// Exclusive access to the gated value, released on drop
pub struct GateGuard<'a, T> {
    name: &'static str,
    entered: Instant,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for GateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for GateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for GateGuard<'_, T> {
    fn drop(&mut self) {
        tracing::trace!("Left {} gate after {:?}", self.name, self.entered.elapsed());
    }
}
