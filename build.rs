use std::process::Command;

fn main() {
    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "debug".to_string());
    let profile = if profile == "release" { "release" } else { "development" };

    let version = std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());

    // Short commit hash, "unknown" outside a git checkout
    let git_hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=USMKIT_VERSION={}", version);
    println!("cargo:rustc-env=USMKIT_PROFILE={}", profile);
    println!("cargo:rustc-env=USMKIT_GIT_HASH={}", git_hash);

    println!("cargo:rerun-if-env-changed=PROFILE");
}
