//! Per-slot health monitoring.
//!
//! One cooperative task per slot incarnation. Each tick runs the checks in a
//! fixed order; the first one that fails produces a recreation reason:
//!
//! 1. power state: `Off`/`Stopped` means the guest finished its single job
//!    and shut down (the normal recycle path);
//! 2. creation timeout: a slot stuck in `Creating` past the deadline;
//! 3. registry presence/status: only after the grace period, since a fresh
//!    guest needs time to boot and register.
//!
//! Transient driver or registry errors only bump the slot's failure counter;
//! they never trigger recreation by themselves. When a monitor does decide
//! to recreate, it spawns the recreation as a detached task and exits; the
//! replacement incarnation spawns its own monitor.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use super::slot::{Slot, SlotState};
use super::Pool;

/// Recreation reasons surfaced in logs and asserted by tests.
pub const REASON_POWER_OFF: &str = "power off";
pub const REASON_CREATION_TIMEOUT: &str = "creation timeout";
pub const REASON_MISSING_IN_REGISTRY: &str = "missing in registry";
pub const REASON_OFFLINE_IN_REGISTRY: &str = "offline in registry";

/// Registry status of a healthy, job-less runner.
const STATUS_ONLINE: &str = "online";

pub(crate) fn spawn_monitor(pool: &Arc<Pool>, slot: &Arc<Slot>, incarnation: u64) {
    let pool = Arc::clone(pool);
    let slot = Arc::clone(slot);
    tokio::spawn(async move {
        run_monitor(pool, slot, incarnation).await;
    });
}

async fn run_monitor(pool: Arc<Pool>, slot: Arc<Slot>, incarnation: u64) {
    let mut ticker = tokio::time::interval(pool.config().monitoring.health_check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval completes immediately; consume it
    // so checks start one full interval after creation began.
    ticker.tick().await;

    debug!(vm_name = %slot.name(), incarnation, "started health monitoring");

    loop {
        tokio::select! {
            _ = pool.cancel_token().cancelled() => {
                debug!(vm_name = %slot.name(), "stopping VM monitoring due to shutdown");
                return;
            }
            _ = ticker.tick() => {}
        }

        if slot.incarnation() != incarnation {
            debug!(vm_name = %slot.name(), "slot moved to a new incarnation, monitor exiting");
            return;
        }

        if let Some(reason) = check_slot_health(&pool, &slot).await {
            warn!(
                vm_name = %slot.name(),
                reason,
                state = %slot.state(),
                consecutive_failures = slot.health_failures(),
                "VM health check failed, recreating"
            );

            let pool = Arc::clone(&pool);
            let vm_name = slot.name().to_string();
            tokio::spawn(async move {
                if let Err(e) = pool.recreate_vm(&vm_name).await {
                    error!(vm_name = %vm_name, error = %e, "error recreating VM");
                }
            });
            return;
        }
    }
}

/// Run all health checks against `slot`, returning a recreation reason or
/// `None` when the slot is healthy (or only transiently unobservable).
pub(crate) async fn check_slot_health(pool: &Pool, slot: &Slot) -> Option<&'static str> {
    // 1. Power state. An error here is transient (the driver may be busy, or
    // the VM not defined yet while creating) and must not mask the creation
    // timeout below.
    let power_ok = match pool.vm().get_power_state(slot.name()).await {
        Ok(state) if state.is_halted() => return Some(REASON_POWER_OFF),
        Ok(_) => true,
        Err(e) => {
            let failures = slot.record_health_failure();
            error!(
                vm_name = %slot.name(),
                error = %e,
                consecutive_failures = failures,
                "failed to get VM power state"
            );
            false
        }
    };

    // 2. Stuck in Creating. While the slot is still creating (and within the
    // deadline) the registry cannot know it yet, so skip the rest.
    if slot.state() == SlotState::Creating {
        let timeout = pool.config().monitoring.creation_timeout();
        if slot.created_elapsed().unwrap_or_default() > timeout {
            return Some(REASON_CREATION_TIMEOUT);
        }
        if power_ok {
            slot.record_health_pass();
        }
        return None;
    }

    // 3. Registry presence and status, once the guest has had time to boot
    // and register.
    if slot.created_elapsed().unwrap_or_default() > pool.config().monitoring.grace_period() {
        match pool.identity().list_runners().await {
            Err(e) => {
                let failures = slot.record_health_failure();
                error!(
                    vm_name = %slot.name(),
                    error = %e,
                    consecutive_failures = failures,
                    "failed to check runner status in registry"
                );
                return None;
            }
            Ok(runners) => match runners.iter().find(|r| r.name == slot.name()) {
                None => return Some(REASON_MISSING_IN_REGISTRY),
                Some(runner) if runner.status != STATUS_ONLINE => {
                    return Some(REASON_OFFLINE_IN_REGISTRY)
                }
                Some(runner) => {
                    debug!(
                        vm_name = %slot.name(),
                        registry_status = %runner.status,
                        "health check passed"
                    );
                }
            },
        }
    }

    if power_ok {
        slot.record_health_pass();
    }
    None
}
