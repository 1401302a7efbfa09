use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Directory names never descended into while fingerprinting
const IGNORED_DIRS: &[&str] = &["node_modules", "target", "__pycache__"];

/// Deepest directory level inspected under a watched path
const MAX_DEPTH: usize = 16;

/// Detects file changes under each app's watch paths by polling
///
/// `scan` walks the file system and belongs on a blocking thread; `update`
/// compares its result with the previous one. The first scan of an app
/// records a baseline, later scans report the app once per change of its
/// fingerprint.
#[derive(Debug, Default)]
pub struct PathWatcher {
    fingerprints: HashMap<String, u64>,
}

impl PathWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the apps whose fingerprint differs from the previous scan
    pub fn update(&mut self, scanned: BTreeMap<String, u64>) -> Vec<String> {
        self.fingerprints.retain(|app, _| scanned.contains_key(app));

        let mut changed = Vec::new();
        for (app, current) in scanned {
            match self.fingerprints.insert(app.clone(), current) {
                Some(previous) if previous != current => {
                    debug!("Watched files of '{}' changed", app);
                    changed.push(app);
                }
                _ => {}
            }
        }
        changed
    }
}

/// Fingerprint every app's watch paths
pub fn scan(watches: &BTreeMap<String, BTreeSet<PathBuf>>) -> BTreeMap<String, u64> {
    watches
        .iter()
        .map(|(app, paths)| (app.clone(), fingerprint(paths)))
        .collect()
}

/// Hash of path, size and modification time of every file under `paths`
pub fn fingerprint(paths: &BTreeSet<PathBuf>) -> u64 {
    let mut entries = Vec::new();
    for path in paths {
        collect(path, 0, &mut entries);
    }
    entries.sort();

    let mut hasher = DefaultHasher::new();
    entries.hash(&mut hasher);
    hasher.finish()
}

fn collect(path: &Path, depth: usize, entries: &mut Vec<(PathBuf, u64, Option<SystemTime>)>) {
    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };

    if metadata.is_file() {
        entries.push((path.to_path_buf(), metadata.len(), metadata.modified().ok()));
        return;
    }

    if !metadata.is_dir() || depth >= MAX_DEPTH {
        return;
    }

    let Ok(dir) = std::fs::read_dir(path) else {
        return;
    };

    for entry in dir.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref()) {
            continue;
        }
        collect(&entry.path(), depth + 1, entries);
    }
}
