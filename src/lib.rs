//! Warm pool of ephemeral Hyper-V VMs acting as single-use self-hosted
//! GitHub Actions runners.
//!
//! Every VM is a differencing-disk clone of a read-only template. A slot's
//! VM registers as an ephemeral runner, takes exactly one job, shuts itself
//! down, and is replaced with a fresh clone. No state leaks between jobs
//! and there is no inbound network exposure.
//!
//! The library target exists so the integration tests can drive the
//! [`pool::Pool`] against the in-process mocks; the binary in `main.rs` is a
//! thin CLI around the same modules.

pub mod config;
pub mod github;
pub mod logging;
pub mod pool;
pub mod vm;
