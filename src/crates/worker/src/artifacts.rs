//! Artifact collection and bundling
//!
//! After a successful build the worker enumerates the well-known output
//! subtrees of the project directory. For caching, the subtrees that exist
//! are bundled into a single gzipped tar keyed by the fingerprint; a cache
//! hit unpacks that bundle back over the project directory.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Path, PathBuf};

use crate::error::WorkerError;

/// Output subtrees collected after a build, relative to the project dir.
pub const ARTIFACT_SUBTREES: &[&str] = &[
    "build/libs",
    "build/distributions",
    "build/test-results",
    "build/reports",
];

/// Absolute paths of all artifact files under the well-known subtrees.
pub fn collect_artifacts(project_dir: &Path) -> Result<Vec<PathBuf>, WorkerError> {
    let mut artifacts = Vec::new();
    for subtree in ARTIFACT_SUBTREES {
        let root = project_dir.join(subtree);
        if root.is_dir() {
            walk_files(&root, &mut artifacts)?;
        }
    }
    artifacts.sort();
    Ok(artifacts)
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), WorkerError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Bundle the existing artifact subtrees into one gzipped tar.
///
/// Returns `None` when no subtree exists (nothing to cache).
pub fn bundle_artifacts(project_dir: &Path) -> Result<Option<Vec<u8>>, WorkerError> {
    let present: Vec<&str> = ARTIFACT_SUBTREES
        .iter()
        .copied()
        .filter(|subtree| project_dir.join(subtree).is_dir())
        .collect();
    if present.is_empty() {
        return Ok(None);
    }

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for subtree in present {
        builder.append_dir_all(subtree, project_dir.join(subtree))?;
    }
    let encoder = builder.into_inner()?;
    let bytes = encoder.finish()?;
    Ok(Some(bytes))
}

/// Unpack a bundle produced by [`bundle_artifacts`] into the project dir.
pub fn unpack_bundle(project_dir: &Path, bundle: &[u8]) -> Result<(), WorkerError> {
    let decoder = GzDecoder::new(bundle);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(project_dir)?;
    Ok(())
}
