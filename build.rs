//! Build script: stamps the commit hash and build date into the binary so
//! the `version` subcommand can report them.

use std::process::Command;

fn main() {
    let commit = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .unwrap_or_else(|| "none".to_string());

    // UTC timestamp without pulling a date crate into the build.
    let date = Command::new("date")
        .args(["-u", "+%Y-%m-%dT%H:%M:%SZ"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=POOL_COMMIT={commit}");
    println!("cargo:rustc-env=POOL_BUILD_DATE={date}");

    println!("cargo:rerun-if-changed=build.rs");
}
