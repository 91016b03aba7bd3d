//! VM management: the hypervisor driver seam and its two implementations.
//!
//! The pool talks to a [`VmManager`] trait object. One implementation shells
//! out to the Hyper-V PowerShell cmdlets ([`hyperv::HyperVManager`]); the
//! other is an in-process simulation ([`mock::MockVmManager`]) selected by
//! `debug.use_mock` and used by the test suite.
//!
//! ## Ownership rule
//!
//! The pool owns exactly the VMs and child disks whose names match
//! `<name_prefix><digits>`. [`pool_name_pattern`] is the single source of
//! that rule; anything not matching it (templates, manually created VMs that
//! happen to share the prefix) must never be touched.

pub mod hyperv;
pub mod inject;
pub mod mock;
pub mod powershell;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use inject::InjectError;
use powershell::PsError;

/// Labels every pool runner carries before user-supplied labels are appended.
pub const DEFAULT_LABELS: &[&str] = &["self-hosted", "Windows", "X64", "ephemeral"];

/// Power state of a VM as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Off,
    Stopped,
    Starting,
    Stopping,
    Unknown,
}

impl PowerState {
    /// Parse the output of `(Get-VM).State`. Anything unrecognized maps to
    /// `Unknown` rather than an error; the health monitor treats `Unknown`
    /// as alive.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "Running" => PowerState::Running,
            "Off" => PowerState::Off,
            "Stopped" => PowerState::Stopped,
            "Starting" => PowerState::Starting,
            "Stopping" => PowerState::Stopping,
            _ => PowerState::Unknown,
        }
    }

    /// `Off`/`Stopped` mean the guest ran its single job and shut itself
    /// down; the slot should be recycled.
    pub fn is_halted(self) -> bool {
        matches!(self, PowerState::Off | PowerState::Stopped)
    }
}

/// The record injected into each cloned image at `<drive>:\runner-config.json`.
///
/// The guest bootstrap script reads this file to register itself as an
/// ephemeral runner. Serialized as a single UTF-8 JSON document, no BOM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub token: String,
    /// Organization or user login the runner registers under.
    pub account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Equals the slot name.
    pub name: String,
    /// Comma-joined label list, defaults first.
    pub labels: String,
    /// Only meaningful for account-scoped runners; dropped for repository
    /// scopes before injection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_url: Option<String>,
}

/// Comma-join the default labels followed by `custom`. Duplicates are kept
/// as given.
pub fn join_labels(custom: &[String]) -> String {
    let mut labels: Vec<&str> = DEFAULT_LABELS.to_vec();
    labels.extend(custom.iter().map(String::as_str));
    labels.join(",")
}

/// The ownership pattern: `^<escape(prefix)>\d+$`.
///
/// The digit-suffix requirement is what keeps the sweeper away from VMs like
/// `runner-basic` or `runner-template` that merely share the prefix.
pub fn pool_name_pattern(prefix: &str) -> Regex {
    Regex::new(&format!(r"^{}\d+$", regex::escape(prefix)))
        .expect("escaped prefix always forms a valid pattern")
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("failed to clone differencing disk for {vm_name}")]
    Clone {
        vm_name: String,
        #[source]
        source: PsError,
    },
    #[error("failed to inject runner config into {vm_name}")]
    Inject {
        vm_name: String,
        #[source]
        source: InjectError,
    },
    #[error("failed to define VM {vm_name}")]
    Define {
        vm_name: String,
        #[source]
        source: PsError,
    },
    #[error("failed to start VM {vm_name}")]
    Start {
        vm_name: String,
        #[source]
        source: PsError,
    },
    #[error("bootstrap script failed in VM {vm_name}")]
    Bootstrap {
        vm_name: String,
        #[source]
        source: PsError,
    },
    #[error("failed to remove VM {vm_name}")]
    Destroy {
        vm_name: String,
        #[source]
        source: PsError,
    },
    #[error("failed to query power state of VM {vm_name}")]
    PowerState {
        vm_name: String,
        #[source]
        source: PsError,
    },
    #[error("VM {vm_name} is not known to the hypervisor")]
    NotFound { vm_name: String },
    #[error("leftover cleanup for prefix {prefix} failed")]
    Cleanup {
        prefix: String,
        #[source]
        source: PsError,
    },
}

/// The hypervisor driver capability set.
///
/// Implementations must support concurrent operations on distinct VM names;
/// the pool guarantees operations on the same name never overlap.
#[async_trait]
pub trait VmManager: Send + Sync {
    /// Clone, inject, define, start and bootstrap a VM named `vm_name`,
    /// registering with `token`.
    async fn create_vm(&self, vm_name: &str, token: &str) -> Result<(), VmError>;

    /// Force power-off, remove the VM record and delete the child disk.
    /// Idempotent: a VM that is already off or a disk that is already gone
    /// is not an error.
    async fn destroy_vm(&self, vm_name: &str) -> Result<(), VmError>;

    async fn get_power_state(&self, vm_name: &str) -> Result<PowerState, VmError>;

    /// Remove every VM and child disk whose name matches
    /// [`pool_name_pattern`] for `name_prefix`.
    async fn cleanup_leftover(&self, name_prefix: &str) -> Result<(), VmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> RunnerConfig {
        RunnerConfig {
            token: "AABBCC".to_string(),
            account: "acme".to_string(),
            repository: Some("widgets".to_string()),
            name: "runner-1".to_string(),
            labels: "self-hosted,Windows,X64,ephemeral".to_string(),
            runner_group: None,
            cache_url: Some("http://cache.local/".to_string()),
        }
    }

    #[test]
    fn runner_config_json_round_trip() {
        let cfg = sample_config();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RunnerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn runner_config_round_trips_with_optional_fields_absent() {
        let cfg = RunnerConfig {
            repository: None,
            runner_group: None,
            cache_url: None,
            ..sample_config()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("repository"));
        assert!(!json.contains("runner_group"));
        assert!(!json.contains("cache_url"));
        let back: RunnerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn runner_config_serializes_runner_group_when_present() {
        let cfg = RunnerConfig {
            runner_group: Some("build-pool".to_string()),
            ..sample_config()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"runner_group\":\"build-pool\""));
    }

    #[test]
    fn join_labels_appends_custom_after_defaults() {
        let labels = join_labels(&["gpu".to_string(), "win11".to_string()]);
        assert_eq!(labels, "self-hosted,Windows,X64,ephemeral,gpu,win11");
    }

    #[test]
    fn join_labels_does_not_deduplicate() {
        let labels = join_labels(&["ephemeral".to_string()]);
        assert_eq!(labels, "self-hosted,Windows,X64,ephemeral,ephemeral");
    }

    #[test]
    fn pool_name_pattern_matches_numbered_names_only() {
        let re = pool_name_pattern("runner-");
        assert!(re.is_match("runner-1"));
        assert!(re.is_match("runner-42"));
        assert!(!re.is_match("runner-"));
        assert!(!re.is_match("runner-basic"));
        assert!(!re.is_match("runner-1-old"));
        assert!(!re.is_match("other-runner-1"));
    }

    #[test]
    fn pool_name_pattern_escapes_regex_metacharacters() {
        // A prefix containing regex syntax must be treated literally.
        let re = pool_name_pattern("r.+");
        assert!(re.is_match("r.+7"));
        assert!(!re.is_match("rxx7"));
    }

    #[test]
    fn power_state_parse_known_values() {
        assert_eq!(PowerState::parse("Running\r\n"), PowerState::Running);
        assert_eq!(PowerState::parse("Off"), PowerState::Off);
        assert_eq!(PowerState::parse("Stopped"), PowerState::Stopped);
        assert_eq!(PowerState::parse("Starting"), PowerState::Starting);
        assert_eq!(PowerState::parse("Stopping"), PowerState::Stopping);
        assert_eq!(PowerState::parse("Paused"), PowerState::Unknown);
    }

    #[test]
    fn halted_states_trigger_recycling() {
        assert!(PowerState::Off.is_halted());
        assert!(PowerState::Stopped.is_halted());
        assert!(!PowerState::Running.is_halted());
        assert!(!PowerState::Unknown.is_halted());
    }
}
