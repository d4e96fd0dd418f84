//! # Worker Registry
//!
//! Heartbeat bookkeeping for worker processes. Purely observational: nothing in
//! claiming or the cascade reads these rows.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::WorkflowStore;

#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn WorkflowStore>,
    worker_id: String,
    queue_name: String,
    heartbeat_interval: Duration,
}

impl WorkerRegistry {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        worker_id: impl Into<String>,
        queue_name: impl Into<String>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            queue_name: queue_name.into(),
            heartbeat_interval,
        }
    }

    pub async fn register(&self) -> Result<()> {
        self.store
            .record_heartbeat(&self.worker_id, &self.queue_name)
            .await?;
        info!(worker_id = %self.worker_id, queue = %self.queue_name, "Worker registered");
        Ok(())
    }

    pub async fn beat(&self) -> Result<()> {
        self.store
            .record_heartbeat(&self.worker_id, &self.queue_name)
            .await?;
        Ok(())
    }

    pub async fn deregister(&self) -> Result<()> {
        self.store.mark_worker_stopped(&self.worker_id).await?;
        info!(worker_id = %self.worker_id, "Worker stopped");
        Ok(())
    }

    /// Beat every `heartbeat_interval` until shutdown is signalled
    pub fn spawn_heartbeat(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; register() already covered it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        match registry.beat().await {
                            Ok(()) => debug!(worker_id = %registry.worker_id, "💓 Heartbeat"),
                            Err(e) => warn!(worker_id = %registry.worker_id, error = %e, "Heartbeat failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryQueue;
    use crate::store::InMemoryWorkflowStore;

    #[tokio::test]
    async fn test_heartbeat_loop_updates_until_shutdown() {
        let store = Arc::new(InMemoryWorkflowStore::new(Arc::new(InMemoryQueue::new())));
        let registry = WorkerRegistry::new(store.clone(), "w-1", "q", Duration::from_millis(10));
        registry.register().await.unwrap();
        let registered_at = store.workers().await.unwrap()[0].last_heartbeat_at;

        let (tx, rx) = broadcast::channel(1);
        let handle = registry.spawn_heartbeat(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
        registry.deregister().await.unwrap();

        let workers = store.workers().await.unwrap();
        assert!(workers[0].last_heartbeat_at > registered_at);
        assert!(workers[0].is_stopped());
    }
}
