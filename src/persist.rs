//! Durable, priority-segmented storage for batches awaiting transmission.
//!
//! One file per batch, named by a random UUID, under `highpriority/` or
//! `regularpriority/`. This is the hand-off point between "batched" and
//! "sent": once a batch is written, the in-memory copy is gone and delivery
//! works purely off the file. Writes land under a `.tmp` name and are renamed
//! into place, so readers only ever see complete batches.
//!
//! All I/O is synchronous `std::fs` on purpose: the crash path must be able
//! to write on a dying thread with no runtime cooperation. Async callers wrap
//! calls in `spawn_blocking`.

use crate::error::PipelineError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const HIGH_PRIORITY_DIR: &str = "highpriority";
const REGULAR_PRIORITY_DIR: &str = "regularpriority";
// In-progress writes carry this extension until renamed into place, so a
// concurrent send cycle never sees a half-written batch.
const TMP_EXTENSION: &str = "tmp";

/// Handle to one persisted batch file.
///
/// Handles returned by [`PersistenceStore::next_available`] are claimed: the
/// store will not hand the same file to another caller until it is released
/// via [`delete`] or [`make_available`].
///
/// [`delete`]: PersistenceStore::delete
/// [`make_available`]: PersistenceStore::make_available
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedFile {
    path: PathBuf,
    high_priority: bool,
}

impl PersistedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn high_priority(&self) -> bool {
        self.high_priority
    }
}

/// Priority-segmented batch file store with a served-set claim protocol.
#[derive(Debug)]
pub struct PersistenceStore {
    high_dir: PathBuf,
    regular_dir: PathBuf,
    max_file_count: usize,
    served: Mutex<HashSet<PathBuf>>,
    // Serializes the cap check with the write so concurrent flushes cannot
    // overshoot `max_file_count`.
    write_gate: Mutex<()>,
}

impl PersistenceStore {
    /// Create the store, materializing both priority directories.
    pub fn new(storage_root: &Path, max_file_count: usize) -> Result<Self, PipelineError> {
        let high_dir = storage_root.join(HIGH_PRIORITY_DIR);
        let regular_dir = storage_root.join(REGULAR_PRIORITY_DIR);
        std::fs::create_dir_all(&high_dir)?;
        std::fs::create_dir_all(&regular_dir)?;
        Ok(Self {
            high_dir,
            regular_dir,
            max_file_count,
            served: Mutex::new(HashSet::new()),
            write_gate: Mutex::new(()),
        })
    }

    fn dir(&self, high_priority: bool) -> &Path {
        if high_priority {
            &self.high_dir
        } else {
            &self.regular_dir
        }
    }

    /// Number of batch files currently in one priority directory.
    pub fn file_count(&self, high_priority: bool) -> usize {
        list_files(self.dir(high_priority)).len()
    }

    /// Write one batch. Returns `false` (never errors) when the write was
    /// refused or failed; the batch is then lost, which is the documented
    /// trade against unbounded disk growth or crashing the host app.
    pub fn persist(&self, batch_bytes: &[u8], high_priority: bool) -> bool {
        let dir = self.dir(high_priority);
        let _gate = match self.write_gate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.file_count(high_priority) >= self.max_file_count {
            warn!(
                dir = %dir.display(),
                cap = self.max_file_count,
                "persistence cap reached, dropping batch"
            );
            return false;
        }
        let path = dir.join(Uuid::new_v4().to_string());
        let tmp = path.with_extension(TMP_EXTENSION);
        let written =
            std::fs::write(&tmp, batch_bytes).and_then(|()| std::fs::rename(&tmp, &path));
        match written {
            Ok(()) => {
                debug!(file = %path.display(), bytes = batch_bytes.len(), "batch persisted");
                true
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "failed to persist batch");
                let _ = std::fs::remove_file(&tmp);
                false
            }
        }
    }

    /// Claim the next deliverable file: high priority first, skipping files
    /// already out for delivery. `None` when everything is sent or claimed.
    pub fn next_available(&self) -> Option<PersistedFile> {
        let mut served = match self.served.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for high_priority in [true, false] {
            let mut files = list_files(self.dir(high_priority));
            files.sort();
            for path in files {
                if served.insert(path.clone()) {
                    return Some(PersistedFile { path, high_priority });
                }
            }
        }
        None
    }

    /// Read a claimed file's bytes.
    pub fn load(&self, file: &PersistedFile) -> Result<Vec<u8>, PipelineError> {
        Ok(std::fs::read(&file.path)?)
    }

    /// Terminal release: unlink the file and drop the claim. Unlink failures
    /// are logged, not fatal.
    pub fn delete(&self, file: &PersistedFile) {
        if let Err(e) = std::fs::remove_file(&file.path) {
            warn!(file = %file.path.display(), error = %e, "failed to delete batch file");
        }
        self.release(file);
    }

    /// Retry release: drop the claim so `next_available` can hand the same
    /// bytes out again.
    pub fn make_available(&self, file: &PersistedFile) {
        self.release(file);
    }

    fn release(&self, file: &PersistedFile) {
        match self.served.lock() {
            Ok(mut served) => {
                served.remove(&file.path);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&file.path);
            }
        }
    }
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| path.extension().map_or(true, |ext| ext != TMP_EXTENSION))
            .collect(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "failed to list batch directory");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(max_file_count: usize) -> (TempDir, PersistenceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path(), max_file_count).unwrap();
        (dir, store)
    }

    #[test]
    fn persist_and_load_round_trip() {
        let (_dir, store) = store(50);
        let bytes = br#"[{"ver":1}]"#;
        assert!(store.persist(bytes, false));

        let file = store.next_available().unwrap();
        assert!(!file.high_priority());
        assert_eq!(store.load(&file).unwrap(), bytes);
    }

    #[test]
    fn high_priority_drains_first() {
        let (_dir, store) = store(50);
        assert!(store.persist(b"regular", false));
        assert!(store.persist(b"crash", true));

        let first = store.next_available().unwrap();
        assert!(first.high_priority());
        assert_eq!(store.load(&first).unwrap(), b"crash");

        let second = store.next_available().unwrap();
        assert!(!second.high_priority());
    }

    #[test]
    fn claimed_files_are_not_served_twice() {
        let (_dir, store) = store(50);
        assert!(store.persist(b"one", false));

        let first = store.next_available().unwrap();
        assert!(store.next_available().is_none());

        store.make_available(&first);
        let again = store.next_available().unwrap();
        assert_eq!(again.path(), first.path());
    }

    #[test]
    fn delete_removes_file_and_claim() {
        let (_dir, store) = store(50);
        assert!(store.persist(b"one", false));

        let file = store.next_available().unwrap();
        store.delete(&file);

        assert!(store.next_available().is_none());
        assert_eq!(store.file_count(false), 0);
    }

    #[test]
    fn double_delete_is_harmless() {
        let (_dir, store) = store(50);
        assert!(store.persist(b"one", false));
        let file = store.next_available().unwrap();
        store.delete(&file);
        store.delete(&file);
        assert_eq!(store.file_count(false), 0);
    }

    #[test]
    fn cap_rejects_overflow_writes() {
        let (_dir, store) = store(3);
        for _ in 0..3 {
            assert!(store.persist(b"batch", false));
        }
        assert!(!store.persist(b"overflow", false));
        assert_eq!(store.file_count(false), 3);
    }

    #[test]
    fn cap_is_per_priority() {
        let (_dir, store) = store(1);
        assert!(store.persist(b"regular", false));
        assert!(store.persist(b"crash", true));
        assert!(!store.persist(b"overflow", false));
        assert!(!store.persist(b"overflow", true));
    }

    #[test]
    fn in_progress_writes_are_invisible() {
        let (dir, store) = store(50);
        let pending = dir.path().join(REGULAR_PRIORITY_DIR).join("half-written.tmp");
        std::fs::write(&pending, b"").unwrap();

        // A half-written file is neither claimable nor counted against the cap.
        assert!(store.next_available().is_none());
        assert_eq!(store.file_count(false), 0);

        // Once the writer renames it into place, the batch is deliverable.
        std::fs::write(&pending, b"[7]").unwrap();
        let published = dir.path().join(REGULAR_PRIORITY_DIR).join("half-written");
        std::fs::rename(&pending, &published).unwrap();
        let file = store.next_available().unwrap();
        assert_eq!(store.load(&file).unwrap(), b"[7]");
    }

    #[test]
    fn failed_publish_leaves_no_stray_files() {
        let (dir, store) = store(50);
        assert!(store.persist(b"[1]", false));

        let entries: Vec<_> = std::fs::read_dir(dir.path().join(REGULAR_PRIORITY_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].path().extension().is_none(), "no temp name after publish");
    }

    #[test]
    fn cap_drop_emits_a_warning() {
        use std::sync::Arc;
        use tracing_subscriber::fmt::writer::BoxMakeWriter;
        use tracing_subscriber::fmt::MakeWriter;

        #[derive(Clone)]
        struct SharedWriter(Arc<Mutex<Vec<u8>>>);

        impl<'a> MakeWriter<'a> for SharedWriter {
            type Writer = SharedGuard;
            fn make_writer(&'a self) -> Self::Writer {
                SharedGuard(self.0.clone())
            }
        }

        struct SharedGuard(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for SharedGuard {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(writer))
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (_dir, store) = store(1);
        assert!(store.persist(b"first", false));
        assert!(!store.persist(b"second", false));

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(
            logs.contains("persistence cap reached"),
            "cap drop should warn: {}",
            logs
        );
    }

    #[test]
    fn concurrent_claims_never_overlap() {
        use std::sync::Arc;

        let (_dir, store) = store(50);
        for _ in 0..10 {
            assert!(store.persist(b"batch", false));
        }

        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Some(file) = store.next_available() {
                    claimed.push(file.path().to_path_buf());
                }
                claimed
            }));
        }

        let mut all: Vec<PathBuf> =
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 10, "every file claimed exactly once");
        assert_eq!(all.len(), 10, "no file claimed twice");
    }
}
