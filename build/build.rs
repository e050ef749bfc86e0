use std::env;
use std::path::Path;
use std::process::Command;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

fn main() {
    let git_sha = git_revision();
    let build_time = build_timestamp();
    let package = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());

    let version = if git_sha.is_empty() {
        format!("{package} (built {build_time})")
    } else {
        format!("{package} (git {git_sha}, built {build_time})")
    };

    println!("cargo:rustc-env=SSHMUX_GIT_SHA={git_sha}");
    println!("cargo:rustc-env=SSHMUX_BUILD_TIME={build_time}");
    println!("cargo:rustc-env=SSHMUX_VERSION={version}");

    println!("cargo:rerun-if-env-changed=SSHMUX_BUILD_TIME");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}

fn git_revision() -> String {
    if let Ok(value) = env::var("GITHUB_SHA") {
        let value = value.trim();
        return value.chars().take(7).collect();
    }
    if !Path::new(".git").exists() {
        return String::new();
    }
    let Some(sha) = git(&["rev-parse", "--short", "HEAD"]) else {
        return String::new();
    };
    let dirty = git(&["status", "--porcelain"]).is_some();
    if dirty { format!("{sha}-dirty") } else { sha }
}

fn build_timestamp() -> String {
    if let Ok(value) = env::var("SSHMUX_BUILD_TIME")
        && !value.trim().is_empty()
    {
        return value;
    }
    let pinned = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .and_then(|epoch| OffsetDateTime::from_unix_timestamp(epoch).ok());
    pinned
        .unwrap_or_else(OffsetDateTime::now_utc)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Trimmed stdout of a successful git invocation, `None` when empty or failed.
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}
