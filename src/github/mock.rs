//! In-memory mock identity client.
//!
//! Selected by `debug.use_mock`. Tokens are synthesized without network I/O;
//! the runner registry is a plain in-memory list that tests populate to
//! exercise the sweep and health-check paths. Issuing a token does not
//! fabricate a registration; in the real system registration happens from
//! inside the guest, which mock mode does not have.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::debug;

use super::{IdentityClient, IdentityError, RegistrationToken, RunnerRecord};

pub struct MockIdentityClient {
    runners: Mutex<Vec<RunnerRecord>>,
    next_id: AtomicU64,
}

impl MockIdentityClient {
    pub fn new() -> Self {
        Self {
            runners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a runner record directly, as the guest agent would after
    /// booting. Returns the assigned id.
    pub fn insert_runner(&self, name: &str, status: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.runners
            .lock()
            .expect("mock registry mutex poisoned")
            .push(RunnerRecord {
                id,
                name: name.to_string(),
                status: status.to_string(),
            });
        id
    }

    /// Sorted names of every registered runner.
    pub fn runner_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .runners
            .lock()
            .expect("mock registry mutex poisoned")
            .iter()
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for MockIdentityClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityClient for MockIdentityClient {
    async fn issue_registration_token(&self) -> Result<RegistrationToken, IdentityError> {
        let token = format!("mock-{}", unix_nanos());
        debug!(token = %token, "generated mock registration token");
        Ok(RegistrationToken {
            token,
            expires_at: Utc::now() + ChronoDuration::hours(1),
        })
    }

    async fn list_runners(&self) -> Result<Vec<RunnerRecord>, IdentityError> {
        Ok(self
            .runners
            .lock()
            .expect("mock registry mutex poisoned")
            .clone())
    }

    async fn deregister_runner(&self, id: u64) -> Result<(), IdentityError> {
        self.runners
            .lock()
            .expect("mock registry mutex poisoned")
            .retain(|r| r.id != id);
        debug!(id, "deregistered mock runner");
        Ok(())
    }
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
