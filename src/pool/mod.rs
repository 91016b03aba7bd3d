//! The pool reconciler.
//!
//! Owns the slot array and drives each slot through
//! `create → monitor → recreate`. The pool holds no durable state: at
//! startup and shutdown it sweeps the hypervisor and the registry for
//! anything matching its naming scheme, restoring the invariant that the
//! only resources named `<prefix><digits>` are the ones currently bound to
//! slots.
//!
//! Concurrency model: one cancellation token owned by the pool, one monitor
//! task per slot incarnation, one ad-hoc task per recreation. The admin lock
//! serializes `restart_all` against other admin operations; no external call
//! is made while holding it for a single slot.

mod health;
mod slot;

pub use health::{
    REASON_CREATION_TIMEOUT, REASON_MISSING_IN_REGISTRY, REASON_OFFLINE_IN_REGISTRY,
    REASON_POWER_OFF,
};
pub use slot::{Slot, SlotState, TransitionError};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::github::{IdentityClient, IdentityError};
use crate::vm::{pool_name_pattern, VmError, VmManager};

/// How long `shutdown` waits for monitors to observe cancellation before
/// sweeping.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no slot named {name} in the pool")]
    NoSuchSlot { name: String },
    #[error("failed to issue registration token for {name}")]
    Token {
        name: String,
        #[source]
        source: IdentityError,
    },
    #[error("failed to create VM for {name}")]
    Create {
        name: String,
        #[source]
        source: VmError,
    },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error("{operation}: {failed} of {total} slots failed: {details}")]
    Aggregate {
        operation: &'static str,
        failed: usize,
        total: usize,
        details: String,
    },
}

pub struct Pool {
    config: Config,
    vm: Arc<dyn VmManager>,
    identity: Arc<dyn IdentityClient>,
    slots: Vec<Arc<Slot>>,
    /// Serializes admin fan-outs (`restart_all`).
    admin_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl Pool {
    /// Allocate `pool_size` slots named `<prefix>1..=<prefix>N`. Nothing is
    /// created until [`initialize`](Pool::initialize).
    pub fn new(
        config: Config,
        vm: Arc<dyn VmManager>,
        identity: Arc<dyn IdentityClient>,
    ) -> Arc<Self> {
        let prefix = &config.runners.name_prefix;
        let slots = (1..=config.runners.pool_size)
            .map(|i| Arc::new(Slot::new(format!("{prefix}{i}"))))
            .collect();
        Arc::new(Self {
            config,
            vm,
            identity,
            slots,
            admin_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn slots(&self) -> &[Arc<Slot>] {
        &self.slots
    }

    pub fn slot(&self, name: &str) -> Option<&Arc<Slot>> {
        self.slots.iter().find(|s| s.name() == name)
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn vm(&self) -> &dyn VmManager {
        self.vm.as_ref()
    }

    pub(crate) fn identity(&self) -> &dyn IdentityClient {
        self.identity.as_ref()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sweep leftovers from previous runs, then bring every slot up in
    /// parallel.
    ///
    /// Per-slot failures are aggregated into the returned error but do not
    /// stop the other slots: each failed slot keeps its health monitor, which
    /// recreates it once the creation timeout lapses.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), PoolError> {
        let prefix = self.config.runners.name_prefix.clone();

        info!(name_prefix = %prefix, "performing startup cleanup");
        if let Err(e) = self.vm.cleanup_leftover(&prefix).await {
            warn!(error = %e, "local cleanup encountered errors (continuing anyway)");
        }
        if let Err(e) = self.sweep_registry().await {
            warn!(error = %e, "registry sweep encountered errors (continuing anyway)");
        }

        info!(pool_size = self.slots.len(), "initializing warm pool of VMs");

        let mut join = JoinSet::new();
        for slot in &self.slots {
            let pool = Arc::clone(self);
            let slot = Arc::clone(slot);
            join.spawn(async move {
                let name = slot.name().to_string();
                pool.create_and_register(&slot).await.map_err(|e| (name, e))
            });
        }

        let mut failures: Vec<(String, PoolError)> = Vec::new();
        while let Some(result) = join.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err((name, e))) => {
                    error!(vm_name = %name, error = %e, "failed to initialize slot");
                    failures.push((name, e));
                }
                Err(join_error) => {
                    error!(error = %join_error, "slot initialization task panicked");
                }
            }
        }

        if failures.is_empty() {
            info!("warm pool initialized successfully");
            Ok(())
        } else {
            Err(aggregate("initialize pool", failures, self.slots.len()))
        }
    }

    /// Bring one slot up: token, VM, monitor.
    ///
    /// The monitor is spawned as soon as the slot enters `Creating` so that
    /// a creation that hangs or fails is recovered via the creation-timeout
    /// rule; the incarnation counter keeps it at one live monitor per
    /// incarnation.
    async fn create_and_register(self: &Arc<Self>, slot: &Arc<Slot>) -> Result<(), PoolError> {
        let incarnation = slot.begin_creating()?;
        health::spawn_monitor(self, slot, incarnation);

        let registration =
            self.identity
                .issue_registration_token()
                .await
                .map_err(|source| PoolError::Token {
                    name: slot.name().to_string(),
                    source,
                })?;
        slot.set_token(registration.token.clone());

        self.vm
            .create_vm(slot.name(), &registration.token)
            .await
            .map_err(|source| PoolError::Create {
                name: slot.name().to_string(),
                source,
            })?;

        if !slot.mark_ready(incarnation) {
            warn!(
                vm_name = %slot.name(),
                "slot was recreated while its VM was being created; discarding stale creation"
            );
            return Ok(());
        }

        info!(vm_name = %slot.name(), "VM ready and waiting for jobs");
        Ok(())
    }

    /// Destroy and recreate one slot's VM.
    ///
    /// Destroy errors are logged and ignored so a stuck VM never blocks its
    /// replacement.
    pub async fn recreate_vm(self: &Arc<Self>, name: &str) -> Result<(), PoolError> {
        let slot = self
            .slot(name)
            .cloned()
            .ok_or_else(|| PoolError::NoSuchSlot {
                name: name.to_string(),
            })?;

        info!(vm_name = %name, "recreating VM");
        slot.begin_destroying()?;

        if let Err(e) = self.vm.destroy_vm(name).await {
            warn!(vm_name = %name, error = %e, "error destroying VM, continuing with recreation");
        }

        self.create_and_register(&slot).await?;
        info!(vm_name = %name, "VM recreated successfully");
        Ok(())
    }

    /// Recreate every slot in parallel. Serialized against other admin
    /// operations by the pool lock; per-slot failures are aggregated.
    pub async fn restart_all(self: &Arc<Self>) -> Result<(), PoolError> {
        let _admin = self.admin_lock.lock().await;
        info!(pool_size = self.slots.len(), "restarting all VMs");

        let mut join = JoinSet::new();
        for slot in &self.slots {
            let pool = Arc::clone(self);
            let name = slot.name().to_string();
            join.spawn(async move {
                let result = pool.recreate_vm(&name).await;
                (name, result)
            });
        }

        let mut failures: Vec<(String, PoolError)> = Vec::new();
        while let Some(result) = join.join_next().await {
            match result {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => {
                    error!(vm_name = %name, error = %e, "failed to restart slot");
                    failures.push((name, e));
                }
                Err(join_error) => {
                    error!(error = %join_error, "restart task panicked");
                }
            }
        }

        if failures.is_empty() {
            info!("all VMs restarted");
            Ok(())
        } else {
            Err(aggregate("restart all", failures, self.slots.len()))
        }
    }

    /// Stop all monitors, then sweep the registry and the hypervisor.
    ///
    /// Registry first: a quick restart must not find stale records that
    /// collide with re-registration. Returns the first sweep error and logs
    /// the rest. Idempotent.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        info!("shutting down orchestrator and cleaning up VMs");
        self.cancel.cancel();
        tokio::time::sleep(SHUTDOWN_GRACE).await;

        let registry_result = self.sweep_registry().await;
        if let Err(e) = &registry_result {
            warn!(error = %e, "errors during registry sweep at shutdown");
        }

        let local_result = self
            .vm
            .cleanup_leftover(&self.config.runners.name_prefix)
            .await;
        if let Err(e) = &local_result {
            warn!(error = %e, "errors during local cleanup at shutdown");
        }

        registry_result?;
        local_result?;
        info!("orchestrator shutdown complete");
        Ok(())
    }

    /// Deregister every registry record whose name matches the pool's
    /// ownership pattern, whatever its reported status: a stale "online"
    /// record from a previous run would collide on re-registration.
    async fn sweep_registry(&self) -> Result<(), IdentityError> {
        let pattern = pool_name_pattern(&self.config.runners.name_prefix);
        let runners = self.identity.list_runners().await?;

        let mut first_error = None;
        for runner in runners.iter().filter(|r| pattern.is_match(&r.name)) {
            info!(
                runner = %runner.name,
                id = runner.id,
                status = %runner.status,
                "deregistering pool runner from registry"
            );
            if let Err(e) = self.identity.deregister_runner(runner.id).await {
                warn!(runner = %runner.name, error = %e, "failed to deregister runner");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

fn aggregate(
    operation: &'static str,
    failures: Vec<(String, PoolError)>,
    total: usize,
) -> PoolError {
    let details = failures
        .iter()
        .map(|(name, e)| format!("{name}: {e}"))
        .collect::<Vec<_>>()
        .join("; ");
    PoolError::Aggregate {
        operation,
        failed: failures.len(),
        total,
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::github::mock::MockIdentityClient;
    use crate::vm::mock::MockVmManager;

    fn mock_pool(pool_size: usize) -> (Arc<Pool>, Arc<MockVmManager>, Arc<MockIdentityClient>) {
        let yaml = format!(
            "runners:\n  pool_size: {pool_size}\n  name_prefix: r-\ndebug:\n  use_mock: true\n"
        );
        let config = Config::from_yaml(&yaml).unwrap();
        let vm = Arc::new(MockVmManager::with_delays(
            Duration::ZERO,
            Duration::ZERO,
        ));
        let identity = Arc::new(MockIdentityClient::new());
        let pool = Pool::new(config, vm.clone(), identity.clone());
        (pool, vm, identity)
    }

    #[test]
    fn slots_are_named_prefix_one_through_n() {
        let (pool, _, _) = mock_pool(3);
        let names: Vec<&str> = pool.slots().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["r-1", "r-2", "r-3"]);
        assert!(pool.slot("r-2").is_some());
        assert!(pool.slot("r-4").is_none());
    }

    #[tokio::test]
    async fn recreate_unknown_slot_fails() {
        let (pool, _, _) = mock_pool(2);
        let err = pool.recreate_vm("nonexistent").await.unwrap_err();
        assert!(matches!(err, PoolError::NoSuchSlot { .. }));
    }

    #[tokio::test]
    async fn zero_size_pool_initializes_with_sweeps_only() {
        let (pool, vm, identity) = mock_pool(0);
        vm.insert_vm("r-7", crate::vm::PowerState::Running);
        identity.insert_runner("r-7", "online");

        pool.initialize().await.unwrap();

        assert!(pool.slots().is_empty());
        assert!(vm.vm_names().is_empty(), "startup sweep removes leftovers");
        assert!(identity.runner_names().is_empty());
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn registry_sweep_spares_non_pool_names() {
        let (pool, _, identity) = mock_pool(0);
        identity.insert_runner("r-1", "online");
        identity.insert_runner("r-basic", "online");
        identity.insert_runner("other", "offline");

        pool.sweep_registry().await.unwrap();
        assert_eq!(identity.runner_names(), vec!["other", "r-basic"]);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (pool, _, _) = mock_pool(1);
        pool.initialize().await.unwrap();
        pool.shutdown().await.unwrap();
        pool.shutdown().await.unwrap();
    }
}
