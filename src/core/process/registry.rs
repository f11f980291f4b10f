//! Registry of live child processes
//!
//! Every child started through a runner is registered here until it is
//! finalized, so shutdown can terminate everything still outstanding.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Handle kept for one live child
struct TrackedProcess {
    label: String,
    pid: Option<u32>,
    kill_tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    live: HashMap<u64, TrackedProcess>,
}

/// Shared set of live children.
///
/// Cloning yields another handle to the same set.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("live", &self.len())
            .finish()
    }
}

impl ProcessRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a child until the returned [`Registration`] is dropped.
    ///
    /// The receiver fires when the child must be killed.
    pub fn register(&self, label: &str, pid: Option<u32>) -> (Registration, oneshot::Receiver<()>) {
        let (kill_tx, kill_rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.live.insert(
            id,
            TrackedProcess {
                label: label.to_string(),
                pid,
                kill_tx,
            },
        );
        (
            Registration {
                registry: self.clone(),
                id,
            },
            kill_rx,
        )
    }

    /// Stop tracking a finalized child. Unknown ids are ignored.
    fn remove(&self, id: u64) {
        self.inner.lock().live.remove(&id);
    }

    /// Signal every tracked child to die and forget them.
    ///
    /// Returns how many children were signalled. Safe to call at any time,
    /// including when nothing is running.
    pub fn kill_all(&self) -> usize {
        let drained: Vec<TrackedProcess> = {
            let mut inner = self.inner.lock();
            inner.live.drain().map(|(_, tracked)| tracked).collect()
        };

        let count = drained.len();
        for tracked in drained {
            tracing::debug!(label = %tracked.label, pid = ?tracked.pid, "killing tracked process");
            // The owner may have finished between drain and send
            let _ = tracked.kill_tx.send(());
        }
        count
    }

    /// Number of live children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels of live children, sorted.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .inner
            .lock()
            .live
            .values()
            .map(|tracked| tracked.label.clone())
            .collect();
        labels.sort();
        labels
    }
}

/// Live entry in a [`ProcessRegistry`], removed on drop, including when the
/// owning run is cancelled.
#[must_use = "the child is untracked as soon as the registration is dropped"]
pub struct Registration {
    registry: ProcessRegistry,
    id: u64,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
