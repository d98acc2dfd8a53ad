//! Cache key computation
//!
//! The fingerprint is the cache key for a build's outputs. Identical inputs
//! must produce identical fingerprints, so the project path is canonicalized
//! and options are folded in sorted order.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Deterministic cache key over a build's inputs.
///
/// Inputs: canonical project path, task name, sorted build options, and the
/// build tool version (so a tool upgrade never serves stale outputs).
pub fn compute_fingerprint(
    project_path: &str,
    task_name: &str,
    build_options: &BTreeMap<String, String>,
    tool_version: &str,
) -> String {
    let canonical = Path::new(project_path)
        .canonicalize()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| project_path.to_string());

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update([0u8]);
    hasher.update(task_name.as_bytes());
    hasher.update([0u8]);
    for (key, value) in build_options {
        hasher.update(key.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(tool_version.as_bytes());

    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
