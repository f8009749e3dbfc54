use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock,
    },
};
use tokio::task::JoinHandle;

/// Pool of fire-and-forget tasks that nobody awaits
///
/// Each task removes itself from the pool when it finishes, whether it
/// returned normally or panicked, so the pool only ever holds work that is
/// still in flight.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    inner: Arc<TaskPool>,
}

#[derive(Default)]
struct TaskPool {
    next_id: AtomicU64,
    running: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl TaskPool {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes the task's entry on drop, which also covers unwinding
struct Deregister {
    pool: Arc<TaskPool>,
    id: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.pool.lock().remove(&self.id);
    }
}

static GLOBAL: OnceLock<BackgroundTasks> = OnceLock::new();

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide pool
    pub fn global() -> Self {
        GLOBAL.get_or_init(BackgroundTasks::new).clone()
    }

    /// Spawns `task` onto the current tokio runtime and tracks it until completion
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let deregister = Deregister {
            pool: Arc::clone(&self.inner),
            id,
        };
        // Hold the lock across the spawn so a task finishing straight away
        // cannot try to deregister before it has been inserted
        let mut running = self.inner.lock();
        let handle = tokio::spawn(async move {
            let _deregister = deregister;
            task.await;
        });
        running.insert(id, handle);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aborts everything still running. Only meant for shutdown.
    pub fn abort_all(&self) {
        let handles: Vec<_> = self.inner.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.abort();
        }
    }
}
