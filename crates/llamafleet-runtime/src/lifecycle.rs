//! Enforces `max_running_instances`: reaps idle instances on a timer, and chooses
//! eviction victims when an admission request arrives at capacity (spec §4.3).

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use llamafleet_registry::{Evictor, Instance, Registry};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct LifecycleManager;

impl LifecycleManager {
    pub fn new() -> Arc<Self> {
        Arc::new(LifecycleManager)
    }

    /// Spawns the periodic idle sweeper (spec §4.3 "Idle sweeper"). Runs until
    /// `cancel` fires, e.g. on process shutdown.
    pub fn spawn_idle_sweeper(
        self: Arc<Self>,
        registry: Arc<Registry>,
        period: Duration,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_idle(&registry).await;
                    }
                }
            }
        });
    }

    async fn sweep_idle(&self, registry: &Registry) {
        let now = SystemTime::now();
        for instance in registry.running_by_lru().await {
            let Some(options) = instance.options().await else {
                continue;
            };
            // `0` means idle reaping is disabled for this instance (spec §4.3); the
            // process-wide default was already resolved at creation/update time, so no
            // further fallback happens here.
            let timeout_minutes = options.idle_timeout_minutes;
            if timeout_minutes == 0 {
                continue;
            }
            let last_used = instance.last_used_at().await;
            let idle_for = now.duration_since(last_used).unwrap_or_default();
            if idle_for > Duration::from_secs(timeout_minutes * 60) {
                info!(instance = instance.name(), idle_minutes = idle_for.as_secs() / 60, "idle timeout reached, stopping");
                if let Err(e) = instance.stop().await {
                    warn!(instance = instance.name(), error = %e, "idle-sweep stop failed");
                }
            }
        }
    }
}

#[async_trait]
impl Evictor for LifecycleManager {
    /// Picks the LRU running instance other than `requester` (spec §4.3 "LRU eviction").
    /// `running` is already ordered ascending by `last_used_at`, ties broken by name.
    async fn pick_victim(&self, requester: &str, running: &[Arc<Instance>]) -> Option<Arc<Instance>> {
        running.iter().find(|i| i.name() != requester).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llamafleet_registry::{BackendOptions, InstanceOptionsInput, NoEviction, RestartPolicy};
    use tempfile::tempdir;

    fn input(port: u16) -> InstanceOptionsInput {
        InstanceOptionsInput {
            auto_restart: None,
            max_restarts: None,
            restart_delay_seconds: None,
            backend: BackendOptions::Llama {
                model_path: "m.gguf".to_string(),
                context_size: None,
                gpu_layers: None,
                embedding: false,
                extra_args: vec![],
            },
            host: "127.0.0.1".to_string(),
            port,
            idle_timeout_minutes: None,
        }
    }

    #[tokio::test]
    async fn pick_victim_skips_requester() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(
            dir.path().join("state"),
            dir.path().join("logs"),
            RestartPolicy::default(),
            0,
            4,
            Arc::new(NoEviction),
        );
        let a = registry.create("a", input(1)).await.unwrap();
        let b = registry.create("b", input(2)).await.unwrap();

        let manager = LifecycleManager::new();
        let running = vec![Arc::clone(&a), Arc::clone(&b)];
        let victim = manager.pick_victim("a", &running).await.unwrap();
        assert_eq!(victim.name(), "b");
    }

    #[tokio::test]
    async fn pick_victim_returns_none_when_only_requester_present() {
        let manager = LifecycleManager::new();
        let dir = tempdir().unwrap();
        let registry = Registry::new(
            dir.path().join("state"),
            dir.path().join("logs"),
            RestartPolicy::default(),
            0,
            4,
            Arc::new(NoEviction),
        );
        let a = registry.create("a", input(1)).await.unwrap();
        let running = vec![Arc::clone(&a)];
        assert!(manager.pick_victim("a", &running).await.is_none());
    }
}
