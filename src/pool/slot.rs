//! Per-slot state machine.
//!
//! A slot is a stable named position in the pool; the VM bound to it is
//! reborn on every cycle. All mutation goes through the slot's mutex and the
//! legal-successor table below, so observed transitions always form a path
//! through:
//!
//! ```text
//! Empty ─► Creating ─► Ready ─► Running ─► Destroying ─► Creating …
//!              └──────────────────────────────┘
//! ```
//!
//! Each entry into `Creating` or `Destroying` bumps an incarnation counter.
//! Workers (the creator and the health monitor) capture the counter when
//! they start and stand down when it no longer matches, which is what keeps
//! at most one active worker per slot even when a recreation overtakes a
//! hung creation.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No VM bound.
    Empty,
    /// Token issued; clone/inject/start/bootstrap in flight.
    Creating,
    /// VM up, runner registered, awaiting a job.
    Ready,
    /// Runner accepted a job.
    Running,
    /// Power-off and disk removal in flight.
    Destroying,
}

impl SlotState {
    fn can_transition_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Empty, Creating)
                | (Creating, Ready)
                | (Creating, Destroying)
                | (Ready, Running)
                | (Ready, Destroying)
                | (Running, Destroying)
                | (Destroying, Empty)
                | (Destroying, Creating)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SlotState::Empty => "empty",
            SlotState::Creating => "creating",
            SlotState::Ready => "ready",
            SlotState::Running => "running",
            SlotState::Destroying => "destroying",
        }
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("invalid transition {from} -> {to} for slot {name}")]
pub struct TransitionError {
    pub name: String,
    pub from: SlotState,
    pub to: SlotState,
}

#[derive(Debug)]
struct SlotInner {
    state: SlotState,
    token: Option<String>,
    created_at: Option<Instant>,
    last_health_check: Option<Instant>,
    health_failures: u32,
    incarnation: u64,
}

/// A pool slot. Shared by the reconciler and the slot's current monitor.
#[derive(Debug)]
pub struct Slot {
    name: String,
    inner: Mutex<SlotInner>,
}

impl Slot {
    pub fn new(name: String) -> Self {
        Self {
            name,
            inner: Mutex::new(SlotInner {
                state: SlotState::Empty,
                token: None,
                created_at: None,
                last_health_check: None,
                health_failures: 0,
                incarnation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SlotState {
        self.lock().state
    }

    pub fn incarnation(&self) -> u64 {
        self.lock().incarnation
    }

    pub fn health_failures(&self) -> u32 {
        self.lock().health_failures
    }

    /// Time since this incarnation entered `Creating`.
    pub fn created_elapsed(&self) -> Option<Duration> {
        self.lock().created_at.map(|at| at.elapsed())
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        self.lock().last_health_check
    }

    /// Enter `Creating`: stamps `created_at`, resets health counters and
    /// begins a new incarnation, which is returned for later fencing.
    pub fn begin_creating(&self) -> Result<u64, TransitionError> {
        let mut inner = self.lock();
        self.guard(&inner, SlotState::Creating)?;
        inner.state = SlotState::Creating;
        inner.created_at = Some(Instant::now());
        inner.last_health_check = None;
        inner.health_failures = 0;
        inner.token = None;
        inner.incarnation += 1;
        Ok(inner.incarnation)
    }

    /// Record the in-flight registration token.
    pub fn set_token(&self, token: String) {
        self.lock().token = Some(token);
    }

    /// Whether a token is currently held (it is discarded once the VM is
    /// ready; the guest owns its copy from injection onward).
    pub fn has_token(&self) -> bool {
        self.lock().token.is_some()
    }

    /// Move `Creating` → `Ready` if this incarnation is still current.
    ///
    /// Returns `false` when the slot was recreated underneath the caller;
    /// the stale creator must not touch the slot further.
    pub fn mark_ready(&self, incarnation: u64) -> bool {
        let mut inner = self.lock();
        if inner.incarnation != incarnation {
            return false;
        }
        debug_assert_eq!(inner.state, SlotState::Creating);
        inner.state = SlotState::Ready;
        inner.token = None;
        true
    }

    /// Enter `Destroying` and begin a new incarnation, fencing off any
    /// worker still attached to the previous one.
    pub fn begin_destroying(&self) -> Result<u64, TransitionError> {
        let mut inner = self.lock();
        self.guard(&inner, SlotState::Destroying)?;
        inner.state = SlotState::Destroying;
        inner.token = None;
        inner.incarnation += 1;
        Ok(inner.incarnation)
    }

    /// Count a transient health-check error; returns the new total.
    pub fn record_health_failure(&self) -> u32 {
        let mut inner = self.lock();
        inner.health_failures += 1;
        inner.health_failures
    }

    /// A passing health check resets the failure counter.
    pub fn record_health_pass(&self) {
        let mut inner = self.lock();
        inner.health_failures = 0;
        inner.last_health_check = Some(Instant::now());
    }

    fn guard(&self, inner: &SlotInner, to: SlotState) -> Result<(), TransitionError> {
        if inner.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(TransitionError {
                name: self.name.clone(),
                from: inner.state,
                to,
            })
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotInner> {
        self.inner.lock().expect("slot mutex poisoned")
    }
}
