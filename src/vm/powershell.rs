//! Temp-script PowerShell runner.
//!
//! Every hypervisor operation is a PowerShell script. Scripts are written to
//! a temp `.ps1` file and executed with `-File`, which is more robust than
//! `-Command` for multi-line scripts and avoids quoting issues.
//!
//! Setting `POWERSHELL_DEBUG_DIR` saves a copy of every script for manual
//! replay when debugging a misbehaving host.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Maximum length of the command preview included in logs and errors.
const PREVIEW_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum PsError {
    #[error("failed to write temp script file {path}: {source}")]
    TempScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn powershell.exe: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("powershell exited with code {code}: {output}")]
    Failed { code: i32, output: String },
}

/// Runs PowerShell scripts on the host.
///
/// Stateless apart from the optional debug directory; safe to share across
/// concurrent operations.
#[derive(Debug, Default)]
pub struct PowerShell {
    debug_dir: Option<PathBuf>,
}

impl PowerShell {
    pub fn new() -> Self {
        Self {
            debug_dir: std::env::var_os("POWERSHELL_DEBUG_DIR").map(PathBuf::from),
        }
    }

    /// Execute `script` and return its combined stdout + stderr.
    ///
    /// A non-zero exit status is an error; the captured output is carried in
    /// the error so callers can log what the host actually said.
    pub async fn run(&self, script: &str) -> Result<String, PsError> {
        let script_path = temp_script_path();
        tokio::fs::write(&script_path, script)
            .await
            .map_err(|source| PsError::TempScript {
                path: script_path.clone(),
                source,
            })?;

        debug!(
            script_file = %script_path.display(),
            command_preview = preview(script),
            command_length = script.len(),
            "executing PowerShell script"
        );

        if let Some(dir) = &self.debug_dir {
            self.save_debug_copy(dir, script).await;
        }

        let result = Command::new("powershell.exe")
            .args(["-ExecutionPolicy", "Bypass", "-NoProfile", "-File"])
            .arg(&script_path)
            .output()
            .await;

        let _ = tokio::fs::remove_file(&script_path).await;

        let output = result.map_err(PsError::Spawn)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let mut combined = stdout;
        if !stderr.is_empty() {
            combined.push_str(&stderr);
        }

        if !output.status.success() {
            return Err(PsError::Failed {
                code: output.status.code().unwrap_or(-1),
                output: combined,
            });
        }

        debug!(output_length = combined.len(), "PowerShell script executed successfully");
        Ok(combined)
    }

    async fn save_debug_copy(&self, dir: &PathBuf, script: &str) {
        static DEBUG_COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = DEBUG_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("ps-{}-{n}.ps1", std::process::id()));
        match tokio::fs::write(&path, script).await {
            Ok(()) => debug!(path = %path.display(), "saved PowerShell script to debug directory"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to save debug script"),
        }
    }
}

/// A process-unique temp path so parallel slot operations never collide.
fn temp_script_path() -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("hvpool-{}-{n}.ps1", std::process::id()))
}

fn preview(script: &str) -> String {
    if script.len() > PREVIEW_LEN {
        let cut = script
            .char_indices()
            .take_while(|(i, _)| *i < PREVIEW_LEN)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}... (truncated)", &script[..cut])
    } else {
        script.to_string()
    }
}
