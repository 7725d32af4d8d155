//! Build version reporting.
//!
//! Git metadata is embedded at build time by vergen (see `build.rs`) and
//! surfaced through the edge cache's `get_version` command.

use serde::Serialize;

/// Package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git branch at build time, or "unknown" if unavailable.
pub const GIT_BRANCH: &str = match option_env!("VERGEN_GIT_BRANCH") {
    Some(branch) => branch,
    None => "unknown",
};

/// Git commit SHA at build time, or "unknown" if unavailable.
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// Build timestamp, or "unknown" if unavailable.
pub const BUILD_TIMESTAMP: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(ts) => ts,
    None => "unknown",
};

/// Snapshot of build information, as reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: &'static str,
    pub branch: &'static str,
    pub sha: &'static str,
    pub dirty: bool,
    pub built_at: &'static str,
    /// Cache generation tag. Bumping the package version invalidates
    /// caches keyed on it.
    pub cache_version: String,
}

/// Whether the working tree was dirty at build time.
pub fn git_dirty() -> bool {
    option_env!("VERGEN_GIT_DIRTY") == Some("true")
}

/// `{version}+{sha7}` with a `.dirty` suffix for dirty trees.
pub fn version_string() -> String {
    let dirty_suffix = if git_dirty() { ".dirty" } else { "" };
    format!("{PKG_VERSION}+{}{dirty_suffix}", short_sha())
}

/// Structured build information.
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: PKG_VERSION,
        branch: GIT_BRANCH,
        sha: GIT_SHA,
        dirty: git_dirty(),
        built_at: BUILD_TIMESTAMP,
        cache_version: format!("huginn-v{PKG_VERSION}"),
    }
}

fn short_sha() -> &'static str {
    &GIT_SHA[..7.min(GIT_SHA.len())]
}
