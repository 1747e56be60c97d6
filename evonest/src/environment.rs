//! Cached project-tree inventory.
//!
//! A cheap scan of the working tree (gitignore-aware, skips hidden entries,
//! so `.evonest/` and `.git/` never count) feeding the observe phase's
//! ecosystem section and the file-count-based turn scaling. Refreshed when
//! the cached snapshot is older than `SCAN_MAX_AGE_CYCLES`.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use ignore::WalkBuilder;
use tracing::debug;

use crate::error::EngineResult;
use crate::state::types::EnvironmentSnapshot;
use crate::state::ProjectState;

/// Snapshots older than this many cycles are rescanned.
const SCAN_MAX_AGE_CYCLES: u64 = 10;

/// Build files worth calling out to the LM.
const BUILD_FILES: &[&str] = &[
    "Cargo.toml",
    "pyproject.toml",
    "package.json",
    "go.mod",
    "Makefile",
    "CMakeLists.txt",
    "build.gradle",
    "pom.xml",
];

/// Walk the project tree and build a fresh snapshot.
pub fn scan(project_root: &Path, cycle: u64) -> EnvironmentSnapshot {
    let mut file_count = 0usize;
    let mut files_by_extension: BTreeMap<String, usize> = BTreeMap::new();
    let mut build_files = Vec::new();
    let mut top_level_dirs = Vec::new();

    for entry in WalkBuilder::new(project_root).hidden(true).build().flatten() {
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(project_root) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
        if is_dir {
            if rel.components().count() == 1 {
                top_level_dirs.push(rel.to_string_lossy().into_owned());
            }
            continue;
        }
        file_count += 1;
        if let Some(ext) = rel.extension().and_then(|e| e.to_str()) {
            *files_by_extension.entry(ext.to_string()).or_insert(0) += 1;
        }
        if let Some(name) = rel.file_name().and_then(|n| n.to_str()) {
            if BUILD_FILES.contains(&name) {
                build_files.push(rel.to_string_lossy().into_owned());
            }
        }
    }

    top_level_dirs.sort();
    build_files.sort();
    debug!(file_count, cycle, "environment scanned");

    EnvironmentSnapshot {
        scanned_cycle: cycle,
        scanned_at: Utc::now(),
        file_count,
        files_by_extension,
        build_files,
        top_level_dirs,
    }
}

/// Return the cached snapshot, rescanning when absent or stale.
pub fn refresh_if_stale(
    state: &ProjectState,
    current_cycle: u64,
) -> EngineResult<EnvironmentSnapshot> {
    if let Some(cached) = state.read_environment()? {
        if current_cycle.saturating_sub(cached.scanned_cycle) < SCAN_MAX_AGE_CYCLES {
            return Ok(cached);
        }
    }
    let snapshot = scan(state.project_root(), current_cycle);
    state.write_environment(&snapshot)?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scan_counts_files_and_skips_state_dir() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "").unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        std::fs::create_dir_all(dir.path().join(".evonest")).unwrap();
        std::fs::write(dir.path().join(".evonest/progress.json"), "{}").unwrap();

        let snapshot = scan(dir.path(), 1);
        assert_eq!(snapshot.file_count, 3);
        assert_eq!(snapshot.files_by_extension.get("rs"), Some(&2));
        assert_eq!(snapshot.build_files, vec!["Cargo.toml"]);
        assert_eq!(snapshot.top_level_dirs, vec!["src"]);
    }

    #[test]
    fn refresh_uses_cache_until_stale() {
        let dir = tempdir().unwrap();
        let state = ProjectState::init_project(dir.path()).unwrap();
        std::fs::write(dir.path().join("one.rs"), "").unwrap();

        let first = refresh_if_stale(&state, 1).unwrap();
        assert_eq!(first.file_count, 1);

        // A new file appears but the cache is still fresh at cycle 5.
        std::fs::write(dir.path().join("two.rs"), "").unwrap();
        let cached = refresh_if_stale(&state, 5).unwrap();
        assert_eq!(cached.file_count, 1);

        // Past the max age the tree is rescanned.
        let rescanned = refresh_if_stale(&state, 12).unwrap();
        assert_eq!(rescanned.file_count, 2);
    }
}
