//! Admission control
//!
//! Three mechanisms compose before any provider call:
//! - a global semaphore bounding concurrent top-level tasks
//! - a separate child semaphore so sub-agents cannot starve the top level
//! - a per-parent spawn tracker bounding concurrent children of one task
//!
//! plus a nesting depth cap checked before anything is acquired.

use crate::config::ConcurrencyConfig;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// In-memory ledger of live children per parent task id
#[derive(Debug, Clone, Default)]
pub struct SpawnTracker {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl SpawnTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a child slot under `parent`.
    ///
    /// Returns false when the parent already has `max` active children.
    pub fn try_spawn(&self, parent: &str, max: usize) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(parent.to_string()).or_insert(0);
        if *count >= max {
            return false;
        }
        *count += 1;
        true
    }

    /// Release a child slot; the entry is removed when it reaches zero.
    pub fn release(&self, parent: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(parent) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(parent);
            }
        }
    }

    /// Active children of one parent
    #[must_use]
    pub fn active(&self, parent: &str) -> usize {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(parent).copied().unwrap_or(0)
    }

    /// Number of parents with live children
    #[must_use]
    pub fn tracked_parents(&self) -> usize {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.len()
    }
}

/// Guard released when a dispatch returns
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    spawn_release: Option<(SpawnTracker, String)>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some((tracker, parent)) = self.spawn_release.take() {
            tracker.release(&parent);
        }
    }
}

/// Admission controller
pub struct AdmissionController {
    global: Arc<Semaphore>,
    children: Arc<Semaphore>,
    spawn: SpawnTracker,
    config: ConcurrencyConfig,
    draining: AtomicBool,
}

impl AdmissionController {
    /// Create a controller from the concurrency config
    #[must_use]
    pub fn new(config: ConcurrencyConfig) -> Self {
        let child_capacity = config.max_concurrent * config.child_pool_multiplier;
        Self {
            global: Arc::new(Semaphore::new(config.max_concurrent)),
            children: Arc::new(Semaphore::new(child_capacity)),
            spawn: SpawnTracker::new(),
            config,
            draining: AtomicBool::new(false),
        }
    }

    /// The spawn tracker (shared with tests and diagnostics)
    #[must_use]
    pub fn spawn_tracker(&self) -> SpawnTracker {
        self.spawn.clone()
    }

    /// Admit one task: depth gate, pool permit, spawn slot.
    ///
    /// # Errors
    /// - `Draining` once shutdown has begun
    /// - `DepthExceeded` when `depth >= max_depth` (nothing is acquired)
    /// - `SpawnLimit` when the parent is at its children cap
    pub async fn admit(
        &self,
        depth: u32,
        parent_id: Option<&str>,
    ) -> Result<AdmissionPermit> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(Error::Draining);
        }

        if depth >= self.config.max_depth {
            return Err(Error::DepthExceeded {
                depth,
                max: self.config.max_depth,
            });
        }

        let pool = if depth == 0 {
            &self.global
        } else {
            &self.children
        };
        let permit = pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Draining)?;

        let spawn_release = match parent_id {
            Some(parent) if !parent.is_empty() => {
                if !self
                    .spawn
                    .try_spawn(parent, self.config.max_children_per_task)
                {
                    // permit drops here, freeing the pool slot
                    return Err(Error::SpawnLimit {
                        parent: parent.to_string(),
                        max: self.config.max_children_per_task,
                    });
                }
                Some((self.spawn.clone(), parent.to_string()))
            }
            _ => None,
        };

        debug!(depth = depth, parent = ?parent_id, "task admitted");
        Ok(AdmissionPermit {
            _permit: permit,
            spawn_release,
        })
    }

    /// Top-level slots currently in use
    #[must_use]
    pub fn active_top_level(&self) -> usize {
        self.config.max_concurrent - self.global.available_permits()
    }

    /// Whether the global pool has no free slot
    #[must_use]
    pub fn saturated(&self) -> bool {
        self.global.available_permits() == 0
    }

    /// Stop admitting new tasks
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Whether new admission is closed
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Wait until every top-level slot has been released, or the timeout.
    ///
    /// Returns true when the pool went idle in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.global.available_permits() == self.config.max_concurrent {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_concurrent: usize) -> ConcurrencyConfig {
        ConcurrencyConfig {
            max_concurrent,
            child_pool_multiplier: 2,
            max_children_per_task: 3,
            max_depth: 3,
        }
    }

    #[test]
    fn test_spawn_tracker_cap() {
        let tracker = SpawnTracker::new();
        assert!(tracker.try_spawn("p1", 2));
        assert!(tracker.try_spawn("p1", 2));
        assert!(!tracker.try_spawn("p1", 2));
        assert_eq!(tracker.active("p1"), 2);

        tracker.release("p1");
        assert!(tracker.try_spawn("p1", 2));
    }

    #[test]
    fn test_spawn_tracker_removes_zero_entries() {
        let tracker = SpawnTracker::new();
        assert!(tracker.try_spawn("p1", 5));
        tracker.release("p1");
        assert_eq!(tracker.tracked_parents(), 0);
    }

    #[tokio::test]
    async fn test_depth_cap_rejects_without_acquiring() {
        let controller = AdmissionController::new(config(1));
        let err = controller.admit(3, None).await.unwrap_err();
        assert!(err.to_string().contains("max nesting depth"));
        assert_eq!(controller.active_top_level(), 0);
    }

    #[tokio::test]
    async fn test_global_pool_bounds_top_level() {
        let controller = Arc::new(AdmissionController::new(config(2)));
        let a = controller.admit(0, None).await.unwrap();
        let _b = controller.admit(0, None).await.unwrap();
        assert!(controller.saturated());

        // third caller waits until a slot frees
        let controller2 = controller.clone();
        let waiter = tokio::spawn(async move { controller2.admit(0, None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(a);
        let permit = waiter.await.unwrap();
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn test_child_pool_is_separate() {
        let controller = AdmissionController::new(config(1));
        let _top = controller.admit(0, None).await.unwrap();
        // global pool is full, but a depth-1 task still gets a child slot
        let child = controller.admit(1, None).await;
        assert!(child.is_ok());
    }

    #[tokio::test]
    async fn test_spawn_cap_enforced_and_released() {
        let controller = AdmissionController::new(config(3));
        let mut permits = Vec::new();
        for _ in 0..3 {
            permits.push(controller.admit(1, Some("parent")).await.unwrap());
        }

        let err = controller.admit(1, Some("parent")).await.unwrap_err();
        assert!(err.to_string().contains("max children per task exceeded"));

        permits.pop();
        let again = controller.admit(1, Some("parent")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_drain_rejects_new_work() {
        let controller = AdmissionController::new(config(1));
        controller.begin_drain();
        assert!(matches!(
            controller.admit(0, None).await,
            Err(Error::Draining)
        ));
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let controller = AdmissionController::new(config(1));
        let permit = controller.admit(0, None).await.unwrap();
        assert!(!controller.wait_idle(Duration::from_millis(100)).await);
        drop(permit);
        assert!(controller.wait_idle(Duration::from_millis(500)).await);
    }
}
