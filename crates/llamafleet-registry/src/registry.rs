//! The authoritative set of [`Instance`]s: creation, lookup, persistence, and the
//! global `max_running_instances` gate (spec §4.2).

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::RegistryError;
use crate::instance::Instance;
use crate::options::{validate_name, InstanceOptionsInput, RestartPolicy};
use crate::persistence::{self, InstanceSnapshot};

/// Chooses an eviction victim when the registry is at capacity. Implemented by the
/// Lifecycle Manager (spec §4.3); injected here so this crate never depends on policy
/// code that in turn depends on it.
#[async_trait]
pub trait Evictor: Send + Sync {
    async fn pick_victim(&self, requester: &str, running: &[Arc<Instance>]) -> Option<Arc<Instance>>;
}

/// An [`Evictor`] that never evicts; `Start` at capacity always fails with
/// `CapacityExceeded`. Used when eviction policy is disabled.
pub struct NoEviction;

#[async_trait]
impl Evictor for NoEviction {
    async fn pick_victim(&self, _requester: &str, _running: &[Arc<Instance>]) -> Option<Arc<Instance>> {
        None
    }
}

pub struct Registry {
    instances: Mutex<BTreeMap<String, Arc<Instance>>>,
    /// Serializes admission decisions so at most one eviction runs at a time (spec §4.3).
    admission: Mutex<()>,
    /// Names with a `start` currently in flight; guards against two concurrent `Start`
    /// calls for the same Instance racing past the admission check (spec §6, 409).
    starting: StdMutex<HashSet<String>>,
    state_dir: PathBuf,
    log_dir: PathBuf,
    defaults: RestartPolicy,
    default_idle_timeout_minutes: u64,
    max_running_instances: usize,
    evictor: Arc<dyn Evictor>,
}

impl Registry {
    pub fn new(
        state_dir: PathBuf,
        log_dir: PathBuf,
        defaults: RestartPolicy,
        default_idle_timeout_minutes: u64,
        max_running_instances: usize,
        evictor: Arc<dyn Evictor>,
    ) -> Self {
        Registry {
            instances: Mutex::new(BTreeMap::new()),
            admission: Mutex::new(()),
            starting: StdMutex::new(HashSet::new()),
            state_dir,
            log_dir,
            defaults,
            default_idle_timeout_minutes,
            max_running_instances,
            evictor,
        }
    }

    pub async fn create(
        &self,
        name: &str,
        input: InstanceOptionsInput,
    ) -> Result<Arc<Instance>, RegistryError> {
        validate_name(name)?;
        let mut options = input.into_options(&self.defaults, self.default_idle_timeout_minutes);
        options.validate_and_clamp(name)?;

        let mut instances = self.instances.lock().await;
        if instances.contains_key(name) {
            return Err(RegistryError::AlreadyExists(name.to_string()));
        }
        let instance = Instance::new(name.to_string(), self.log_dir.clone(), Some(options));
        instances.insert(name.to_string(), Arc::clone(&instance));
        drop(instances);

        self.persist(name).await;
        Ok(instance)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.instances.lock().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<Instance>> {
        self.instances.lock().await.values().cloned().collect()
    }

    pub async fn delete(&self, name: &str) -> Result<(), RegistryError> {
        let instance = self
            .get(name)
            .await
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if instance.is_running().await {
            return Err(RegistryError::DeleteWhileRunning(name.to_string()));
        }
        self.instances.lock().await.remove(name);
        let _ = persistence::remove_snapshot(&self.state_dir, name).await;
        Ok(())
    }

    /// Delegates to `Supervisor::SetOptions`; the caller decides whether to restart a
    /// running instance to pick up the change (spec §4.2 `Update`).
    pub async fn update(&self, name: &str, input: InstanceOptionsInput) -> Result<(), RegistryError> {
        let instance = self
            .get(name)
            .await
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let options = input.into_options(&self.defaults, self.default_idle_timeout_minutes);
        instance.set_options(options).await?;
        self.persist(name).await;
        Ok(())
    }

    /// Operator-initiated start, gated by the global cap. At capacity, asks the
    /// injected [`Evictor`] for a victim; if none is offered, fails with
    /// `CapacityExceeded`. A second `start` for the same name while the first is still
    /// in flight fails fast with `StartInProgress` rather than blocking on it.
    pub async fn start(&self, name: &str) -> Result<(), RegistryError> {
        if !self.starting.lock().unwrap().insert(name.to_string()) {
            return Err(RegistryError::StartInProgress(name.to_string()));
        }
        let result = self.start_admitted(name).await;
        self.starting.lock().unwrap().remove(name);
        result
    }

    async fn start_admitted(&self, name: &str) -> Result<(), RegistryError> {
        let _admission = self.admission.lock().await;

        let instance = self
            .get(name)
            .await
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if instance.is_running().await {
            return Err(crate::error::SupervisorError::AlreadyRunning.into());
        }

        let running = self.running_excluding(name).await;
        if running.len() >= self.max_running_instances {
            match self.evictor.pick_victim(name, &running).await {
                Some(victim) if victim.name() != name => {
                    if let Err(e) = victim.stop().await {
                        warn!(instance = victim.name(), error = %e, "eviction stop failed");
                    }
                    self.persist(victim.name()).await;
                }
                _ => {
                    return Err(RegistryError::CapacityExceeded {
                        max: self.max_running_instances,
                    })
                }
            }
        }

        instance.start().await?;
        self.persist(name).await;
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<(), RegistryError> {
        let instance = self
            .get(name)
            .await
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        instance.stop().await?;
        self.persist(name).await;
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> Result<(), RegistryError> {
        let instance = self
            .get(name)
            .await
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        instance.restart().await?;
        self.persist(name).await;
        Ok(())
    }

    pub async fn running_count(&self) -> usize {
        self.running_excluding("").await.len()
    }

    async fn running_excluding(&self, name: &str) -> Vec<Arc<Instance>> {
        let instances: Vec<Arc<Instance>> = self.instances.lock().await.values().cloned().collect();
        let mut running = Vec::new();
        for instance in instances {
            if instance.name() != name && instance.is_running().await {
                running.push(instance);
            }
        }
        running
    }

    /// Running instances ordered by ascending `last_used_at`, ties broken by name
    /// ascending (spec §4.3 LRU tie-break).
    pub async fn running_by_lru(&self) -> Vec<Arc<Instance>> {
        let mut keyed = Vec::new();
        for instance in self.running_excluding("").await {
            let last_used = instance.last_used_at().await;
            keyed.push((last_used, instance.name().to_string(), instance));
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        keyed.into_iter().map(|(_, _, instance)| instance).collect()
    }

    async fn persist(&self, name: &str) {
        let Some(instance) = self.get(name).await else {
            return;
        };
        let snapshot = InstanceSnapshot {
            name: name.to_string(),
            options: instance.options().await,
            running: instance.is_running().await,
        };
        if let Err(e) = persistence::write_snapshot(&self.state_dir, &snapshot).await {
            warn!(instance = name, error = %e, "failed to persist instance snapshot");
        }
    }

    /// Rehydrates instances from `<state_dir>/instances/*.json`. Does not auto-start
    /// anything unless `restore_last_state` is set and a snapshot's desired-running
    /// flag was true (spec §3 "Lifecycle").
    pub async fn restore(&self, restore_last_state: bool) -> std::io::Result<()> {
        let snapshots = persistence::load_all(&self.state_dir).await?;
        let mut to_start = Vec::new();
        {
            let mut instances = self.instances.lock().await;
            for snapshot in snapshots {
                let instance =
                    Instance::new(snapshot.name.clone(), self.log_dir.clone(), snapshot.options);
                instances.insert(snapshot.name.clone(), Arc::clone(&instance));
                if restore_last_state && snapshot.running {
                    to_start.push(instance);
                }
            }
        }
        for instance in to_start {
            if let Err(e) = instance.start().await {
                warn!(instance = instance.name(), error = %e, "failed to restore running state");
            }
        }
        Ok(())
    }

    /// Stops every running instance, for graceful process shutdown (spec §5).
    pub async fn stop_all(&self) {
        let instances: Vec<Arc<Instance>> = self.instances.lock().await.values().cloned().collect();
        for instance in instances {
            if instance.is_running().await {
                if let Err(e) = instance.stop().await {
                    warn!(instance = instance.name(), error = %e, "shutdown stop failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BackendOptions;
    use tempfile::tempdir;

    fn input(host: &str, port: u16) -> InstanceOptionsInput {
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
            host: host.to_string(),
            port,
            idle_timeout_minutes: None,
        }
    }

    fn registry(dir: &tempfile::TempDir, max: usize) -> Registry {
        Registry::new(
            dir.path().join("state"),
            dir.path().join("logs"),
            RestartPolicy::default(),
            0,
            max,
            Arc::new(NoEviction),
        )
    }

    #[tokio::test]
    async fn create_rejects_duplicate_names() {
        let dir = tempdir().unwrap();
        let registry = registry(&dir, 4);
        registry.create("a", input("127.0.0.1", 1)).await.unwrap();
        let err = registry.create("a", input("127.0.0.1", 2)).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_applies_defaults_for_omitted_restart_policy() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(
            dir.path().join("state"),
            dir.path().join("logs"),
            RestartPolicy {
                auto_restart: true,
                max_restarts: 7,
                restart_delay_seconds: 9,
            },
            0,
            4,
            Arc::new(NoEviction),
        );
        let instance = registry.create("a", input("127.0.0.1", 1)).await.unwrap();
        let options = instance.options().await.unwrap();
        assert_eq!(options.restart_policy.max_restarts, 7);
        assert_eq!(options.restart_policy.restart_delay_seconds, 9);
        assert!(options.restart_policy.auto_restart);
    }

    #[tokio::test]
    async fn create_applies_default_idle_timeout_when_omitted() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(
            dir.path().join("state"),
            dir.path().join("logs"),
            RestartPolicy::default(),
            15,
            4,
            Arc::new(NoEviction),
        );
        let instance = registry.create("a", input("127.0.0.1", 1)).await.unwrap();
        let options = instance.options().await.unwrap();
        assert_eq!(options.idle_timeout_minutes, 15);
    }

    #[tokio::test]
    async fn create_keeps_explicit_zero_idle_timeout_despite_default() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(
            dir.path().join("state"),
            dir.path().join("logs"),
            RestartPolicy::default(),
            15,
            4,
            Arc::new(NoEviction),
        );
        let mut opts = input("127.0.0.1", 1);
        opts.idle_timeout_minutes = Some(0);
        let instance = registry.create("a", opts).await.unwrap();
        let options = instance.options().await.unwrap();
        assert_eq!(options.idle_timeout_minutes, 0);
    }

    #[tokio::test]
    async fn start_twice_concurrently_for_same_name_fails_fast() {
        let dir = tempdir().unwrap();
        let registry = registry(&dir, 4);
        registry.create("a", input("127.0.0.1", 1)).await.unwrap();
        registry.starting.lock().unwrap().insert("a".to_string());
        let err = registry.start("a").await.unwrap_err();
        assert!(matches!(err, RegistryError::StartInProgress(name) if name == "a"));
    }

    #[tokio::test]
    async fn delete_removes_stopped_instance() {
        let dir = tempdir().unwrap();
        let registry = registry(&dir, 4);
        registry.create("a", input("127.0.0.1", 1)).await.unwrap();
        registry.delete("a").await.unwrap();
        assert!(registry.get("a").await.is_none());
    }

    #[tokio::test]
    async fn delete_unknown_instance_is_not_found() {
        let dir = tempdir().unwrap();
        let registry = registry(&dir, 4);
        let err = registry.delete("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn start_at_capacity_without_eviction_fails() {
        let dir = tempdir().unwrap();
        let registry = registry(&dir, 0);
        registry.create("a", input("127.0.0.1", 1)).await.unwrap();
        let err = registry.start("a").await.unwrap_err();
        assert!(matches!(err, RegistryError::CapacityExceeded { max: 0 }));
    }
}
