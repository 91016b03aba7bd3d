//! Hyper-V driver: shells out to the Hyper-V PowerShell cmdlets.
//!
//! Creation pipeline for a slot:
//!
//! ```text
//! New-VHD -Differencing          clone, O(metadata) instead of a full copy
//!     └► inject runner-config.json into the offline child disk
//!         └► New-VM -Generation 2 (+ boot order pinned to the child disk)
//!             └► Start-VM
//!                 └► Invoke-Command -VMName …   guest bootstrap, retried
//! ```
//!
//! The differencing child stores only the delta from the read-only template;
//! the template must stay read-only or every child disk is corrupted.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::Config;

use super::inject::inject_runner_config;
use super::powershell::PowerShell;
use super::{join_labels, PowerState, RunnerConfig, VmError, VmManager};

/// Guest bootstrap executed over PowerShell Direct after the VM starts.
const BOOTSTRAP_SCRIPT: &str = include_str!("../../scripts/bootstrap-runner.ps1");

/// Sentinel printed by the bootstrap wrapper when the guest script ran to
/// completion.
const BOOTSTRAP_SENTINEL: &str = "SCRIPT_EXECUTION_SUCCESS";

/// Virtual switch every pool VM is attached to.
const SWITCH_NAME: &str = "Default Switch";

/// PowerShell Direct connection attempts and the fixed delay between them.
/// A gen-2 Windows guest typically accepts connections 30-60 s after start.
const BOOTSTRAP_MAX_RETRIES: u32 = 10;
const BOOTSTRAP_RETRY_DELAY_SECS: u32 = 10;

pub struct HyperVManager {
    config: Config,
    ps: PowerShell,
}

impl HyperVManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ps: PowerShell::new(),
        }
    }

    fn child_disk_path(&self, vm_name: &str) -> String {
        format!(r"{}\{}.vhdx", self.config.hyperv.storage_path, vm_name)
    }

    /// Assemble the record injected into the child disk.
    ///
    /// `runner_group` is meaningful only for account-scoped runners and is
    /// dropped when a repository scope is configured.
    fn runner_config(&self, vm_name: &str, token: &str) -> RunnerConfig {
        let repo = self.config.github.repo.clone();
        RunnerConfig {
            token: token.to_string(),
            account: self.config.github.account().unwrap_or_default().to_string(),
            runner_group: if repo.is_some() {
                None
            } else {
                self.config.runners.runner_group.clone()
            },
            repository: repo,
            name: vm_name.to_string(),
            labels: join_labels(&self.config.runners.labels),
            cache_url: self.config.runners.cache_url.clone(),
        }
    }
}

#[async_trait]
impl VmManager for HyperVManager {
    async fn create_vm(&self, vm_name: &str, token: &str) -> Result<(), VmError> {
        let vhdx_path = self.child_disk_path(vm_name);
        info!(vm_name, "starting VM creation");

        debug!(vm_name, "creating differencing disk");
        self.ps
            .run(&build_clone_script(
                &self.config.hyperv.template_path,
                &vhdx_path,
            ))
            .await
            .map_err(|source| VmError::Clone {
                vm_name: vm_name.to_string(),
                source,
            })?;
        debug!(vm_name, "differencing disk created");

        let runner_config = self.runner_config(vm_name, token);
        if let Some(cache_url) = &runner_config.cache_url {
            debug!(cache_url, "cache URL configured");
        }

        debug!(vm_name, "injecting runner config");
        inject_runner_config(&self.ps, &vhdx_path, &runner_config)
            .await
            .map_err(|source| VmError::Inject {
                vm_name: vm_name.to_string(),
                source,
            })?;
        debug!(vm_name, "runner config injected");

        debug!(
            vm_name,
            memory_mb = self.config.hyperv.vm_memory_mb,
            cpu_count = self.config.hyperv.vm_cpu_count,
            "defining VM in Hyper-V"
        );
        self.ps
            .run(&build_define_script(
                vm_name,
                self.config.hyperv.vm_memory_mb,
                self.config.hyperv.vm_cpu_count,
                &vhdx_path,
            ))
            .await
            .map_err(|source| VmError::Define {
                vm_name: vm_name.to_string(),
                source,
            })?;
        debug!(vm_name, "VM defined in Hyper-V");

        debug!(vm_name, "starting VM");
        self.ps
            .run(&format!(r#"Start-VM -Name "{vm_name}""#))
            .await
            .map_err(|source| VmError::Start {
                vm_name: vm_name.to_string(),
                source,
            })?;

        info!(vm_name, "VM created and started, waiting for guest bootstrap");
        let output = self
            .ps
            .run(&build_bootstrap_exec_script(
                vm_name,
                &self.config.hyperv.vm_username,
                &self.config.hyperv.vm_password,
                BOOTSTRAP_SCRIPT,
            ))
            .await
            .map_err(|source| VmError::Bootstrap {
                vm_name: vm_name.to_string(),
                source,
            })?;
        debug!(vm_name, output = %output, "bootstrap output");

        if !output.contains(BOOTSTRAP_SENTINEL) {
            return Err(VmError::Bootstrap {
                vm_name: vm_name.to_string(),
                source: super::powershell::PsError::Failed {
                    code: 0,
                    output,
                },
            });
        }

        info!(vm_name, "runner configured successfully in VM");
        Ok(())
    }

    async fn destroy_vm(&self, vm_name: &str) -> Result<(), VmError> {
        // Force power-off; tolerate a VM that is already off or gone.
        let stop = format!(r#"Stop-VM -Name "{vm_name}" -TurnOff -Force -ErrorAction SilentlyContinue"#);
        if let Err(e) = self.ps.run(&stop).await {
            debug!(vm_name, error = %e, "stop before destroy failed (VM may already be off)");
        }

        self.ps
            .run(&format!(r#"Remove-VM -Name "{vm_name}" -Force"#))
            .await
            .map_err(|source| VmError::Destroy {
                vm_name: vm_name.to_string(),
                source,
            })?;

        // Tolerate a disk that was already deleted.
        let vhdx_path = self.child_disk_path(vm_name);
        let delete = format!(r#"Remove-Item -Path "{vhdx_path}" -Force -ErrorAction SilentlyContinue"#);
        if let Err(e) = self.ps.run(&delete).await {
            debug!(vm_name, error = %e, "child disk removal failed (file may already be gone)");
        }

        info!(vm_name, "VM destroyed successfully");
        Ok(())
    }

    async fn get_power_state(&self, vm_name: &str) -> Result<PowerState, VmError> {
        let output = self
            .ps
            .run(&format!(r#"(Get-VM -Name "{vm_name}").State"#))
            .await
            .map_err(|source| VmError::PowerState {
                vm_name: vm_name.to_string(),
                source,
            })?;
        Ok(PowerState::parse(&output))
    }

    async fn cleanup_leftover(&self, name_prefix: &str) -> Result<(), VmError> {
        info!(name_prefix, "cleaning up leftover resources");

        let output = self
            .ps
            .run(&build_cleanup_script(
                name_prefix,
                &self.config.hyperv.storage_path,
            ))
            .await
            .map_err(|source| VmError::Cleanup {
                prefix: name_prefix.to_string(),
                source,
            })?;
        debug!(output = %output, "cleanup output");

        if output.contains("CLEANUP_PERFORMED") {
            info!(name_prefix, "leftover resources cleaned up");
        } else {
            debug!(name_prefix, "no leftover resources found");
        }
        Ok(())
    }
}

fn build_clone_script(template_path: &str, vhdx_path: &str) -> String {
    format!(r#"New-VHD -ParentPath "{template_path}" -Path "{vhdx_path}" -Differencing"#)
}

/// Gen-2 VM with pinned boot order.
///
/// Without `Set-VMFirmware -BootOrder` a generation-2 VM falls back to
/// network boot and sits at the UEFI prompt waiting for an operator.
fn build_define_script(vm_name: &str, memory_mb: u32, cpu_count: u32, vhdx_path: &str) -> String {
    format!(
        r#"
New-VM -Name "{vm_name}" -MemoryStartupBytes {memory_mb}MB -Generation 2 -VHDPath "{vhdx_path}"
Set-VM -Name "{vm_name}" -ProcessorCount {cpu_count}
Set-VM -Name "{vm_name}" -AutomaticStartAction Nothing
Set-VM -Name "{vm_name}" -AutomaticStopAction ShutDown
Add-VMNetworkAdapter -VMName "{vm_name}" -SwitchName "{SWITCH_NAME}"
$vmDrive = Get-VMHardDiskDrive -VMName "{vm_name}"
Set-VMFirmware -VMName "{vm_name}" -BootOrder $vmDrive
"#
    )
}

/// Run the guest bootstrap over PowerShell Direct with bounded retries.
///
/// The guest accepts connections only once the integration services are up,
/// so the connection attempt is retried with a fixed delay. The inner block
/// writes the script to a guest temp file and executes it there, bubbling a
/// non-zero exit code back as a thrown error.
fn build_bootstrap_exec_script(
    vm_name: &str,
    username: &str,
    password: &str,
    script_content: &str,
) -> String {
    format!(
        r#"
$ErrorActionPreference = "Stop"
$vmName = "{vm_name}"
$username = "{username}"
$password = "{password}"

$securePassword = ConvertTo-SecureString $password -AsPlainText -Force
$credential = New-Object System.Management.Automation.PSCredential ($username, $securePassword)

$scriptContent = @'
{script_content}
'@

$maxRetries = {BOOTSTRAP_MAX_RETRIES}
$retryCount = 0
$retryDelay = {BOOTSTRAP_RETRY_DELAY_SECS}

while ($retryCount -lt $maxRetries) {{
    try {{
        Write-Output "Attempt $($retryCount + 1) of $maxRetries to connect to VM..."

        $result = Invoke-Command -VMName $vmName -Credential $credential -ScriptBlock {{
            param($script)

            $tempScript = "$env:TEMP\bootstrap-runner-$([guid]::NewGuid()).ps1"
            Set-Content -Path $tempScript -Value $script -Force

            try {{
                & powershell.exe -ExecutionPolicy Bypass -NoProfile -File $tempScript 2>&1
                $exitCode = $LASTEXITCODE
                Remove-Item $tempScript -Force -ErrorAction SilentlyContinue

                if ($exitCode -ne 0) {{
                    throw "Script exited with code $exitCode"
                }}
            }} catch {{
                Remove-Item $tempScript -Force -ErrorAction SilentlyContinue
                throw
            }}
        }} -ArgumentList $scriptContent

        $result | ForEach-Object {{ Write-Output $_ }}

        Write-Output "{BOOTSTRAP_SENTINEL}"
        break
    }} catch {{
        $retryCount++
        if ($retryCount -lt $maxRetries) {{
            Write-Output "Connection failed: $_"
            Write-Output "Waiting $retryDelay seconds before retry..."
            Start-Sleep -Seconds $retryDelay
        }} else {{
            throw "Failed to execute script after $maxRetries attempts: $_"
        }}
    }}
}}
"#
    )
}

/// Remove leftover VMs and child disks from a previous run.
///
/// Matches `^<escape(prefix)>\d+$` only, so `runner-basic` or a template
/// sharing the prefix is never touched. Individual removal failures are
/// reported in the output but do not stop the sweep.
fn build_cleanup_script(name_prefix: &str, storage_path: &str) -> String {
    format!(
        r#"
$ErrorActionPreference = "Continue"
$namePrefix = "{name_prefix}"
$storagePath = "{storage_path}"
$cleaned = 0

$vms = Get-VM | Where-Object {{ $_.Name -match "^$([regex]::Escape($namePrefix))\d+$" }}
foreach ($vm in $vms) {{
    Write-Output "Removing VM: $($vm.Name)"
    try {{
        Stop-VM -Name $vm.Name -TurnOff -Force -ErrorAction SilentlyContinue
        Remove-VM -Name $vm.Name -Force -ErrorAction Stop
        $cleaned++
        Write-Output "  Removed successfully"
    }} catch {{
        Write-Output "  Warning: Failed to remove VM: $_"
    }}
}}

if (Test-Path $storagePath) {{
    $vhdxFiles = Get-ChildItem -Path $storagePath -Filter "$namePrefix*.vhdx" -ErrorAction SilentlyContinue |
        Where-Object {{ $_.BaseName -match "^$([regex]::Escape($namePrefix))\d+$" }}
    foreach ($file in $vhdxFiles) {{
        Write-Output "Removing VHDX: $($file.Name)"
        try {{
            Dismount-VHD -Path $file.FullName -ErrorAction SilentlyContinue

            Remove-Item -Path $file.FullName -Force -ErrorAction Stop
            $cleaned++
            Write-Output "  Removed successfully"
        }} catch {{
            Write-Output "  Warning: Failed to remove VHDX: $_"
        }}
    }}
}}

Write-Output "Cleanup complete. Removed $cleaned resources."
if ($cleaned -gt 0) {{
    Write-Output "CLEANUP_PERFORMED"
}}
"#
    )
}
