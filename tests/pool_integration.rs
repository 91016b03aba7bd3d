//! End-to-end pool scenarios on the mock stack.
//!
//! These tests drive the real [`Pool`] (reconciler, slot state machine and
//! health monitors) against the in-process mock driver and mock registry,
//! with the health-check cadence turned down to one second so whole
//! lifecycles complete in a few seconds of wall time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hyperv_runner_pool::config::Config;
use hyperv_runner_pool::github::mock::MockIdentityClient;
use hyperv_runner_pool::pool::{Pool, SlotState};
use hyperv_runner_pool::vm::mock::MockVmManager;
use hyperv_runner_pool::vm::PowerState;

/// A pool of `size` slots named `r-1..r-N`, ticking every second.
fn mock_stack(size: usize) -> (Arc<Pool>, Arc<MockVmManager>, Arc<MockIdentityClient>) {
    mock_stack_with(size, "")
}

fn mock_stack_with(
    size: usize,
    monitoring_tail: &str,
) -> (Arc<Pool>, Arc<MockVmManager>, Arc<MockIdentityClient>) {
    let yaml = format!(
        "runners:\n  pool_size: {size}\n  name_prefix: r-\n\
         monitoring:\n  health_check_interval_seconds: 1\n{monitoring_tail}\
         debug:\n  use_mock: true\n"
    );
    let config = Config::from_yaml(&yaml).expect("test config must parse");
    let vm = Arc::new(MockVmManager::new());
    let identity = Arc::new(MockIdentityClient::new());
    let pool = Pool::new(config, vm.clone(), identity.clone());
    (pool, vm, identity)
}

/// Poll `pred` until it holds or `deadline` elapses.
async fn wait_until<F: Fn() -> bool>(deadline: Duration, what: &str, pred: F) {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out after {deadline:?} waiting for: {what}");
}

fn all_ready(pool: &Pool) -> bool {
    pool.slots().iter().all(|s| s.state() == SlotState::Ready)
}

#[tokio::test]
async fn warm_up_brings_every_slot_to_ready() {
    let (pool, vm, _identity) = mock_stack(3);

    pool.initialize().await.expect("initialize must succeed");

    assert!(all_ready(&pool));
    let names: Vec<&str> = pool.slots().iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["r-1", "r-2", "r-3"]);
    // The mock store holds exactly the pool's VMs and nothing else.
    assert_eq!(vm.vm_names(), vec!["r-1", "r-2", "r-3"]);
    assert!(
        pool.slots().iter().all(|s| !s.has_token()),
        "tokens are discarded once slots are ready"
    );

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn powered_off_vm_is_recycled_within_a_few_ticks() {
    let (pool, vm, _identity) = mock_stack(3);
    pool.initialize().await.unwrap();

    // The runner on r-2 finishes its single job; the guest powers off.
    vm.set_power_state("r-2", PowerState::Off);

    let vm_probe = vm.clone();
    let pool_probe = pool.clone();
    wait_until(Duration::from_secs(5), "r-2 recycled to a fresh Ready VM", || {
        vm_probe.create_count("r-2") == 2
            && pool_probe.slot("r-2").unwrap().state() == SlotState::Ready
    })
    .await;

    // The recycle replaced r-2 in place; the name set is unchanged.
    assert_eq!(vm.vm_names(), vec!["r-1", "r-2", "r-3"]);
    assert_eq!(vm.create_count("r-1"), 1);
    assert_eq!(vm.create_count("r-3"), 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_all_rebuilds_every_slot_in_place() {
    let (pool, vm, _identity) = mock_stack(3);
    pool.initialize().await.unwrap();

    pool.restart_all().await.expect("restart_all must succeed");

    assert!(all_ready(&pool));
    assert_eq!(vm.vm_names(), vec!["r-1", "r-2", "r-3"]);
    for slot in pool.slots() {
        assert_eq!(
            vm.create_count(slot.name()),
            2,
            "{} must have been rebuilt",
            slot.name()
        );
    }

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn startup_sweep_removes_pool_leftovers_but_spares_lookalikes() {
    let (pool, vm, identity) = mock_stack(3);

    // Leftovers from a "previous run": two stale pool VMs, one VM outside
    // the pool range, and one that merely shares the prefix.
    vm.insert_vm("r-1", PowerState::Running);
    vm.insert_vm("r-2", PowerState::Off);
    vm.insert_vm("r-9", PowerState::Running);
    vm.insert_vm("r-basic", PowerState::Running);
    identity.insert_runner("r-1", "online");
    identity.insert_runner("r-9", "offline");
    identity.insert_runner("other-runner", "online");

    pool.initialize().await.unwrap();

    // r-9 is gone, r-basic survived (no digit-only suffix match), and the
    // pool rebuilt r-1..r-3 from scratch.
    assert_eq!(vm.vm_names(), vec!["r-1", "r-2", "r-3", "r-basic"]);
    // Stale registry records matching the pool pattern were deregistered
    // regardless of status; foreign names were left alone.
    assert_eq!(identity.runner_names(), vec!["other-runner"]);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn hung_creation_is_recreated_after_the_timeout() {
    // creation_timeout 0: any slot still Creating at a tick is recreated.
    let (pool, vm, _identity) = mock_stack_with(1, "  creation_timeout_minutes: 0\n");

    vm.hang_next_create("r-1");

    let init_pool = pool.clone();
    let init = tokio::spawn(async move { init_pool.initialize().await });

    // The first creation parks forever; the monitor notices the slot stuck
    // in Creating and replaces it. The replacement creation is not hung.
    let vm_probe = vm.clone();
    let pool_probe = pool.clone();
    wait_until(
        Duration::from_secs(5),
        "r-1 recreated after hung creation",
        || {
            vm_probe.create_count("r-1") == 1
                && pool_probe.slot("r-1").unwrap().state() == SlotState::Ready
        },
    )
    .await;

    assert_eq!(vm.vm_names(), vec!["r-1"]);

    // Unpark the original creation; it discovers the slot has moved on and
    // discards its work instead of corrupting the fresh incarnation.
    vm.release_hangs();
    init.await.unwrap().unwrap();
    assert_eq!(pool.slot("r-1").unwrap().state(), SlotState::Ready);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn graceful_shutdown_destroys_vms_and_empties_the_registry() {
    let (pool, vm, identity) = mock_stack(3);
    pool.initialize().await.unwrap();

    // Simulate the three guests having registered with the registry.
    identity.insert_runner("r-1", "online");
    identity.insert_runner("r-2", "online");
    identity.insert_runner("r-3", "online");

    pool.shutdown().await.expect("shutdown must succeed");

    assert!(vm.vm_names().is_empty(), "all pool VMs are destroyed");
    assert!(
        identity.runner_names().is_empty(),
        "registry holds no pool records after shutdown"
    );
}

#[tokio::test]
async fn zero_size_pool_sweeps_and_idles() {
    let (pool, vm, identity) = mock_stack(0);
    vm.insert_vm("r-3", PowerState::Running);
    identity.insert_runner("r-3", "offline");

    pool.initialize().await.unwrap();

    assert!(pool.slots().is_empty());
    assert!(vm.vm_names().is_empty());
    assert!(identity.runner_names().is_empty());

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn eight_slots_initialize_in_parallel() {
    let (pool, vm, _identity) = mock_stack(8);

    let started = Instant::now();
    pool.initialize().await.unwrap();

    // Creation fans out: eight slots with a 50 ms simulated clone each must
    // finish far sooner than they would sequentially.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(all_ready(&pool));
    let expected: Vec<String> = (1..=8).map(|i| format!("r-{i}")).collect();
    let mut names = vm.vm_names();
    names.sort_by_key(|n| n[2..].parse::<u32>().unwrap());
    assert_eq!(names, expected);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn recreate_is_idempotent_under_repetition() {
    let (pool, vm, _identity) = mock_stack(1);
    pool.initialize().await.unwrap();

    pool.recreate_vm("r-1").await.unwrap();
    pool.recreate_vm("r-1").await.unwrap();

    assert_eq!(pool.slot("r-1").unwrap().state(), SlotState::Ready);
    assert_eq!(vm.vm_names(), vec!["r-1"]);
    assert_eq!(vm.create_count("r-1"), 3);

    pool.shutdown().await.unwrap();
}
