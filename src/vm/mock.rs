//! In-process mock driver.
//!
//! Selected by `debug.use_mock` so the daemon can run on a host without
//! Hyper-V, and used by the test suite to drive the pool through whole
//! lifecycles. The "hypervisor" is a name → power-state map; tests can flip
//! power states, pre-populate leftovers from a "previous run", and park the
//! next creation of a given VM to simulate a hung clone or boot.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::{pool_name_pattern, PowerState, VmError, VmManager};

/// Simulated clone + boot cost; keeps mock-mode timing shaped like the real
/// driver without slowing tests down much.
const DEFAULT_CREATE_DELAY: Duration = Duration::from_millis(50);
const DEFAULT_DESTROY_DELAY: Duration = Duration::from_millis(25);

#[derive(Default)]
struct MockState {
    vms: HashMap<String, PowerState>,
    /// Names whose next `create_vm` call parks until [`MockVmManager::release_hangs`].
    hang_create: HashSet<String>,
    hangs_released: bool,
    create_count: HashMap<String, u64>,
}

pub struct MockVmManager {
    state: Mutex<MockState>,
    release: Notify,
    create_delay: Duration,
    destroy_delay: Duration,
}

impl MockVmManager {
    pub fn new() -> Self {
        Self::with_delays(DEFAULT_CREATE_DELAY, DEFAULT_DESTROY_DELAY)
    }

    pub fn with_delays(create_delay: Duration, destroy_delay: Duration) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            release: Notify::new(),
            create_delay,
            destroy_delay,
        }
    }

    /// Flip the simulated power state of an existing VM, e.g. to `Off` to
    /// mimic a runner finishing its job and shutting down.
    pub fn set_power_state(&self, vm_name: &str, state: PowerState) {
        let mut inner = self.state.lock().expect("mock state mutex poisoned");
        inner.vms.insert(vm_name.to_string(), state);
    }

    /// Pre-populate a VM, as if left over from a previous process.
    pub fn insert_vm(&self, vm_name: &str, state: PowerState) {
        self.set_power_state(vm_name, state);
    }

    /// Sorted names of all simulated VMs.
    pub fn vm_names(&self) -> Vec<String> {
        let inner = self.state.lock().expect("mock state mutex poisoned");
        let mut names: Vec<String> = inner.vms.keys().cloned().collect();
        names.sort();
        names
    }

    /// How many times `create_vm` completed for `vm_name`.
    pub fn create_count(&self, vm_name: &str) -> u64 {
        let inner = self.state.lock().expect("mock state mutex poisoned");
        inner.create_count.get(vm_name).copied().unwrap_or(0)
    }

    /// Park the next `create_vm(vm_name)` call until [`release_hangs`] is
    /// called (simulates a clone or boot that never completes).
    ///
    /// [`release_hangs`]: MockVmManager::release_hangs
    pub fn hang_next_create(&self, vm_name: &str) {
        let mut inner = self.state.lock().expect("mock state mutex poisoned");
        inner.hang_create.insert(vm_name.to_string());
    }

    /// Let every parked creation proceed.
    pub fn release_hangs(&self) {
        let mut inner = self.state.lock().expect("mock state mutex poisoned");
        inner.hangs_released = true;
        drop(inner);
        self.release.notify_waiters();
    }
}

impl Default for MockVmManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmManager for MockVmManager {
    async fn create_vm(&self, vm_name: &str, _token: &str) -> Result<(), VmError> {
        let should_hang = {
            let mut inner = self.state.lock().expect("mock state mutex poisoned");
            inner.hang_create.remove(vm_name)
        };
        if should_hang {
            debug!(vm_name, "create parked (simulated hang)");
            loop {
                let notified = self.release.notified();
                tokio::pin!(notified);
                // Register interest before checking the flag so a release
                // between the check and the await is not missed.
                notified.as_mut().enable();
                if self.state.lock().expect("mock state mutex poisoned").hangs_released {
                    break;
                }
                notified.await;
            }
            debug!(vm_name, "parked create released");
        }

        tokio::time::sleep(self.create_delay).await;

        let mut inner = self.state.lock().expect("mock state mutex poisoned");
        inner.vms.insert(vm_name.to_string(), PowerState::Running);
        *inner.create_count.entry(vm_name.to_string()).or_insert(0) += 1;
        debug!(vm_name, "VM created (simulated)");
        Ok(())
    }

    async fn destroy_vm(&self, vm_name: &str) -> Result<(), VmError> {
        tokio::time::sleep(self.destroy_delay).await;

        let mut inner = self.state.lock().expect("mock state mutex poisoned");
        inner.vms.remove(vm_name);
        debug!(vm_name, "VM destroyed (simulated)");
        Ok(())
    }

    async fn get_power_state(&self, vm_name: &str) -> Result<PowerState, VmError> {
        let inner = self.state.lock().expect("mock state mutex poisoned");
        inner
            .vms
            .get(vm_name)
            .copied()
            .ok_or_else(|| VmError::NotFound {
                vm_name: vm_name.to_string(),
            })
    }

    async fn cleanup_leftover(&self, name_prefix: &str) -> Result<(), VmError> {
        let pattern = pool_name_pattern(name_prefix);
        let mut inner = self.state.lock().expect("mock state mutex poisoned");
        let before = inner.vms.len();
        inner.vms.retain(|name, _| !pattern.is_match(name));
        debug!(
            name_prefix,
            removed = before - inner.vms.len(),
            "cleanup leftover resources (simulated)"
        );
        Ok(())
    }
}
