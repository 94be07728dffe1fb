//! Project file store and the mount/sync/unmount boundary.
//!
//! A [`FileStore`] is the project directory as the controller sees it. An
//! execution thread never works on it directly: before each run it mounts a
//! copy at its own mount point, and after the run it syncs writes back and
//! unmounts. Edits made to the store between runs are therefore picked up by
//! the next mount, and edits made by the script reach the store on sync.
//!
//! # Sync rules
//!
//! For every file, the digest taken at mount time is the baseline.
//!
//! - Changed or created inside the mount, untouched in the store: copied back.
//! - Deleted inside the mount, untouched in the store: removed from the store.
//! - Changed on both sides: the store wins and the conflict is reported.

use fs_err as fs;
use glob::Pattern;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::error::StoreError;

/// Directories never copied into a mount or back out of it.
const SKIPPED_DIRS: &[&str] = &[".git", "__pycache__"];

static PYTHON_SOURCES: Lazy<Pattern> = Lazy::new(|| Pattern::new("*.py").unwrap());

pub trait FileStore: Send + Sync + fmt::Debug {
    fn root(&self) -> &Path;

    /// Display name of the project (the root directory's name).
    fn name(&self) -> String {
        self.root()
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.root().display().to_string())
    }

    /// Path segments of `file` relative to the root, or `None` when the file
    /// is not under the root.
    fn resolve_path(&self, file: &Path) -> Option<Vec<String>>;

    /// Relative paths (with `/` separators) of every file whose name matches
    /// `pattern`, sorted lexicographically.
    fn enumerate(&self, pattern: &WatchPattern) -> Result<Vec<String>, StoreError>;

    fn read(&self, relative: &str) -> Result<Vec<u8>, StoreError>;

    /// Fails with [`StoreError::PermissionDenied`] when the store cannot be written.
    fn check_writable(&self) -> Result<(), StoreError>;

    fn mount(&self, mount_point: &Path) -> Result<Box<dyn MountedView>, StoreError>;
}

pub trait MountedView: Send {
    fn path(&self) -> &Path;

    fn sync(&mut self) -> Result<SyncReport, StoreError>;

    fn unmount(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub written: Vec<String>,
    pub removed: Vec<String>,
    pub conflicts: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.written.is_empty() && self.removed.is_empty() && self.conflicts.is_empty()
    }
}

/// File-name glob selecting the watched files, e.g. `*.py`.
#[derive(Debug, Clone)]
pub struct WatchPattern {
    pattern: Pattern,
}

impl WatchPattern {
    pub fn new(glob: &str) -> Result<Self, StoreError> {
        Pattern::new(glob)
            .map(|pattern| Self { pattern })
            .map_err(|err| StoreError::InvalidSegment(format!("{}: {}", glob, err.msg)))
    }

    pub fn python() -> Self {
        Self {
            pattern: PYTHON_SOURCES.clone(),
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.pattern.matches(file_name)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Local directory store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        let canonical = fs::canonicalize(root)
            .map_err(|_| StoreError::RootNotFound(root.to_path_buf()))?;
        if !canonical.is_dir() {
            return Err(StoreError::RootNotFound(root.to_path_buf()));
        }
        Ok(Self { root: canonical })
    }

    fn absolute(&self, relative: &str) -> Result<PathBuf, StoreError> {
        join_relative(&self.root, relative)
    }
}

impl FileStore for LocalStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_path(&self, file: &Path) -> Option<Vec<String>> {
        let absolute = if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.root.join(file)
        };
        let canonical = fs::canonicalize(&absolute).ok()?;
        let relative = canonical.strip_prefix(&self.root).ok()?;
        let segments: Vec<String> = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().to_string())
            .collect();
        if segments.is_empty() {
            None
        } else {
            Some(segments)
        }
    }

    fn enumerate(&self, pattern: &WatchPattern) -> Result<Vec<String>, StoreError> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden_or_skipped(entry));
        for entry in walker {
            let entry = entry.map_err(|err| {
                let context = format!("Failed to enumerate {}", self.root.display());
                StoreError::io(context, err.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if !pattern.matches(&file_name) {
                continue;
            }
            if let Some(relative) = relative_string(&self.root, entry.path()) {
                files.push(relative);
            }
        }
        files.sort();
        Ok(files)
    }

    fn read(&self, relative: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.absolute(relative)?;
        fs::read(&path).map_err(|err| StoreError::io(format!("Failed to read {}", relative), err))
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        match tempfile::Builder::new()
            .prefix(".pyrun-probe")
            .tempfile_in(&self.root)
        {
            Ok(_probe) => Ok(()),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                Err(StoreError::PermissionDenied(self.root.clone()))
            }
            Err(err) => Err(StoreError::io(
                format!("Failed to probe {}", self.root.display()),
                err,
            )),
        }
    }

    fn mount(&self, mount_point: &Path) -> Result<Box<dyn MountedView>, StoreError> {
        let view = MirrorView::create(self.root.clone(), mount_point.to_path_buf())?;
        tracing::debug!(
            root = %self.root.display(),
            mount_point = %mount_point.display(),
            files = view.baseline.len(),
            "Project mounted"
        );
        Ok(Box::new(view))
    }
}

/// A mount backed by a full copy of the store.
#[derive(Debug)]
pub struct MirrorView {
    store_root: PathBuf,
    mount_point: PathBuf,
    baseline: HashMap<String, md5::Digest>,
}

impl MirrorView {
    fn create(store_root: PathBuf, mount_point: PathBuf) -> Result<Self, StoreError> {
        if mount_point.exists() {
            fs::remove_dir_all(&mount_point)
                .map_err(|err| StoreError::io("Failed to clear stale mount", err))?;
        }
        fs::create_dir_all(&mount_point)
            .map_err(|err| StoreError::io("Failed to create mount point", err))?;

        let mut baseline = HashMap::new();
        for relative in walk_files(&store_root)? {
            let source = store_root.join(&relative);
            let target = mount_point.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| StoreError::io("Failed to create mount directory", err))?;
            }
            let bytes = fs::read(&source)
                .map_err(|err| StoreError::io(format!("Failed to read {}", relative), err))?;
            fs::write(&target, &bytes)
                .map_err(|err| StoreError::io(format!("Failed to mount {}", relative), err))?;
            baseline.insert(relative, md5::compute(&bytes));
        }

        Ok(Self {
            store_root,
            mount_point,
            baseline,
        })
    }

    fn store_digest(&self, relative: &str) -> Result<Option<md5::Digest>, StoreError> {
        match fs::read(self.store_root.join(relative)) {
            Ok(bytes) => Ok(Some(md5::compute(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(format!("Failed to read {}", relative), err)),
        }
    }

    fn write_back(&self, relative: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let target = self.store_root.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| self.write_error(relative, err))?;
        }
        fs::write(&target, bytes).map_err(|err| self.write_error(relative, err))
    }

    fn write_error(&self, relative: &str, err: std::io::Error) -> StoreError {
        if err.kind() == ErrorKind::PermissionDenied {
            StoreError::PermissionDenied(self.store_root.join(relative))
        } else {
            StoreError::io(format!("Failed to sync {}", relative), err)
        }
    }
}

impl MountedView for MirrorView {
    fn path(&self) -> &Path {
        &self.mount_point
    }

    fn sync(&mut self) -> Result<SyncReport, StoreError> {
        let mut report = SyncReport::default();
        let current = walk_files(&self.mount_point)?;

        for relative in &current {
            let bytes = fs::read(self.mount_point.join(relative))
                .map_err(|err| StoreError::io(format!("Failed to read {}", relative), err))?;
            let digest = md5::compute(&bytes);
            let baseline = self.baseline.get(relative).copied();
            if baseline == Some(digest) {
                continue;
            }
            if self.store_digest(relative)? != baseline {
                report.conflicts.push(relative.clone());
                continue;
            }
            self.write_back(relative, &bytes)?;
            self.baseline.insert(relative.clone(), digest);
            report.written.push(relative.clone());
        }

        let present: HashSet<&str> = current.iter().map(String::as_str).collect();
        let deleted: Vec<String> = self
            .baseline
            .keys()
            .filter(|relative| !present.contains(relative.as_str()))
            .cloned()
            .collect();
        for relative in deleted {
            let baseline = self.baseline.remove(&relative);
            if self.store_digest(&relative)? != baseline {
                report.conflicts.push(relative);
                continue;
            }
            match fs::remove_file(self.store_root.join(&relative)) {
                Ok(()) => report.removed.push(relative),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(self.write_error(&relative, err)),
            }
        }

        report.written.sort();
        report.removed.sort();
        report.conflicts.sort();
        if !report.conflicts.is_empty() {
            tracing::warn!(
                conflicts = ?report.conflicts,
                "Files changed in the project while a run was mounted; kept project copies"
            );
        }
        Ok(report)
    }

    fn unmount(self: Box<Self>) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.mount_point) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io("Failed to unmount project", err)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Path helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn is_hidden_or_skipped(entry: &walkdir::DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    entry.file_type().is_dir() && (name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref()))
}

fn is_skipped(entry: &walkdir::DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    entry.file_type().is_dir() && SKIPPED_DIRS.contains(&name.as_ref())
}

/// All regular files under `root`, relative and sorted.
fn walk_files(root: &Path) -> Result<Vec<String>, StoreError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped(entry));
    for entry in walker {
        let entry = entry.map_err(|err| {
            StoreError::io(format!("Failed to walk {}", root.display()), err.into())
        })?;
        if entry.file_type().is_file() {
            if let Some(relative) = relative_string(root, entry.path()) {
                files.push(relative);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn relative_string(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect();
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Joins a `/`-separated relative path onto `root`, refusing anything that
/// could climb out of it.
pub fn join_relative(root: &Path, relative: &str) -> Result<PathBuf, StoreError> {
    let candidate = Path::new(relative);
    let mut joined = root.to_path_buf();
    let mut pushed = false;
    for component in candidate.components() {
        match component {
            Component::Normal(segment) => {
                joined.push(segment);
                pushed = true;
            }
            Component::CurDir => {}
            _ => return Err(StoreError::OutsideRoot(candidate.to_path_buf())),
        }
    }
    if !pushed {
        return Err(StoreError::InvalidSegment(relative.to_string()));
    }
    Ok(joined)
}
