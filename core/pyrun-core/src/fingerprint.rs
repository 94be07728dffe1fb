//! Change detection over the watched files of a project.
//!
//! A [`Fingerprint`] is an md5 digest over the byte contents of every watched
//! file, folded in lexicographic path order. Paths themselves are not hashed,
//! so two trees with the same contents in the same order compare equal.

use std::fmt;

use crate::error::StoreError;
use crate::store::{FileStore, WatchPattern};

const READ_CHUNK_BYTES: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        format!("{:x}", md5::Digest(self.0))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Folds file contents into a fingerprint after sorting by path. `None` means
/// there were no files at all.
pub fn fold_contents(mut files: Vec<(String, Vec<u8>)>) -> Option<Fingerprint> {
    if files.is_empty() {
        return None;
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    let mut context = md5::Context::new();
    for (_, bytes) in &files {
        for chunk in bytes.chunks(READ_CHUNK_BYTES) {
            context.consume(chunk);
        }
    }
    Some(Fingerprint(context.compute().0))
}

/// Fingerprints the watched files of `store`; `None` when none match.
pub fn fingerprint(
    store: &dyn FileStore,
    pattern: &WatchPattern,
) -> Result<Option<Fingerprint>, StoreError> {
    let paths = store.enumerate(pattern)?;
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = store.read(&path)?;
        files.push((path, bytes));
    }
    Ok(fold_contents(files))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Unchanged,
    Changed(Fingerprint),
    /// The watched set became empty.
    NoSources,
    /// The project was deselected.
    NoDirectory,
}

impl ChangeOutcome {
    pub fn has_changed(&self) -> bool {
        !matches!(self, ChangeOutcome::Unchanged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Snapshot {
    Unknown,
    Unselected,
    Empty,
    Sources(Fingerprint),
}

/// Remembers the last observed fingerprint and reports transitions.
///
/// Every poll stores what it saw, so two polls with no edit in between
/// report a change and then no change.
#[derive(Debug, Clone)]
pub struct ChangeDetectionCache {
    pattern: WatchPattern,
    last: Snapshot,
}

impl ChangeDetectionCache {
    pub fn new(pattern: WatchPattern) -> Self {
        Self {
            pattern,
            last: Snapshot::Unknown,
        }
    }

    pub fn pattern(&self) -> &WatchPattern {
        &self.pattern
    }

    pub fn last_fingerprint(&self) -> Option<Fingerprint> {
        match self.last {
            Snapshot::Sources(fingerprint) => Some(fingerprint),
            _ => None,
        }
    }

    /// Forgets the stored snapshot, so the next poll reports a change.
    pub fn forget(&mut self) {
        self.last = Snapshot::Unknown;
    }

    pub fn poll(&mut self, store: Option<&dyn FileStore>) -> Result<ChangeOutcome, StoreError> {
        let current = match store {
            None => Snapshot::Unselected,
            Some(store) => match fingerprint(store, &self.pattern)? {
                None => Snapshot::Empty,
                Some(fingerprint) => Snapshot::Sources(fingerprint),
            },
        };
        if current == self.last {
            return Ok(ChangeOutcome::Unchanged);
        }
        self.last = current;
        Ok(match current {
            Snapshot::Sources(fingerprint) => {
                tracing::debug!(%fingerprint, "Project fingerprint changed");
                ChangeOutcome::Changed(fingerprint)
            }
            Snapshot::Empty => ChangeOutcome::NoSources,
            Snapshot::Unselected | Snapshot::Unknown => ChangeOutcome::NoDirectory,
        })
    }

    pub fn has_changed(&mut self, store: &dyn FileStore) -> Result<bool, StoreError> {
        Ok(self.poll(Some(store))?.has_changed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use tempfile::TempDir;

    fn files(entries: &[(&str, &str)]) -> Vec<(String, Vec<u8>)> {
        entries
            .iter()
            .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn order_of_traversal_does_not_matter() {
        let forward = fold_contents(files(&[("a.py", "x = 1"), ("b/c.py", "y = 2"), ("d.py", "")]));
        let shuffled = fold_contents(files(&[("d.py", ""), ("a.py", "x = 1"), ("b/c.py", "y = 2")]));
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn any_byte_change_changes_fingerprint() {
        let before = fold_contents(files(&[("a.py", "x = 1"), ("b.py", "y = 2")]));
        let after = fold_contents(files(&[("a.py", "x = 1"), ("b.py", "y = 3")]));
        assert_ne!(before, after);
    }

    #[test]
    fn empty_set_has_no_fingerprint() {
        assert_eq!(fold_contents(Vec::new()), None);
    }

    #[test]
    fn matches_md5_of_concatenated_contents() {
        let fingerprint = fold_contents(files(&[("b.py", "world"), ("a.py", "hello ")])).unwrap();
        assert_eq!(fingerprint.to_hex(), format!("{:x}", md5::compute("hello world")));
    }

    #[test]
    fn has_changed_true_then_false() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.py"), "print(1)").unwrap();
        let store = LocalStore::open(temp.path()).unwrap();
        let mut cache = ChangeDetectionCache::new(WatchPattern::python());
        assert!(cache.has_changed(&store).unwrap());
        assert!(!cache.has_changed(&store).unwrap());

        std::fs::write(temp.path().join("a.py"), "print(2)").unwrap();
        assert!(cache.has_changed(&store).unwrap());
        assert!(!cache.has_changed(&store).unwrap());
    }

    #[test]
    fn unwatched_files_are_ignored() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.py"), "print(1)").unwrap();
        let store = LocalStore::open(temp.path()).unwrap();
        let mut cache = ChangeDetectionCache::new(WatchPattern::python());
        cache.poll(Some(&store as &dyn FileStore)).unwrap();
        std::fs::write(temp.path().join("notes.txt"), "hello").unwrap();
        assert_eq!(cache.poll(Some(&store as &dyn FileStore)).unwrap(), ChangeOutcome::Unchanged);
    }

    #[test]
    fn empty_project_reports_no_sources_once() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::open(temp.path()).unwrap();
        let mut cache = ChangeDetectionCache::new(WatchPattern::python());
        assert_eq!(cache.poll(Some(&store as &dyn FileStore)).unwrap(), ChangeOutcome::NoSources);
        assert_eq!(cache.poll(Some(&store as &dyn FileStore)).unwrap(), ChangeOutcome::Unchanged);

        std::fs::write(temp.path().join("a.py"), "").unwrap();
        assert!(matches!(
            cache.poll(Some(&store as &dyn FileStore)).unwrap(),
            ChangeOutcome::Changed(_)
        ));
    }

    #[test]
    fn deselecting_reports_no_directory_once() {
        let mut cache = ChangeDetectionCache::new(WatchPattern::python());
        assert_eq!(cache.poll(None).unwrap(), ChangeOutcome::NoDirectory);
        assert_eq!(cache.poll(None).unwrap(), ChangeOutcome::Unchanged);
    }

    #[test]
    fn forget_forces_a_change() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.py"), "print(1)").unwrap();
        let store = LocalStore::open(temp.path()).unwrap();
        let mut cache = ChangeDetectionCache::new(WatchPattern::python());
        cache.poll(Some(&store as &dyn FileStore)).unwrap();
        cache.forget();
        assert!(cache.has_changed(&store).unwrap());
    }
}
