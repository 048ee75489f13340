//! Bounded file-descriptor pool.
//!
//! All fingerprint output files are appended through one pool so the number
//! of simultaneously open handles never exceeds the configured capacity,
//! regardless of how many (vbucket, bin) files a run fans out into. Handles
//! are re-openable: correctness never depends on a handle surviving between
//! writes, only on per-path append ordering.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::trace;

/// Append-only file pool with an upper bound on open handles.
///
/// Writes to distinct paths proceed concurrently; writes to the same path
/// serialize on a per-path mutex so records never interleave mid-byte. On
/// capacity pressure the least-recently-used idle handle is closed to make
/// room. A returned `write` means the append syscall completed; the pool
/// never fsyncs and never retries.
pub struct FdPool {
    capacity: usize,
    tick: AtomicU64,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<PathBuf, Arc<PoolEntry>>,
    open_count: usize,
}

struct PoolEntry {
    file: Mutex<Option<File>>,
    last_use: AtomicU64,
}

impl FdPool {
    /// Create a pool that keeps at most `capacity` files open.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            capacity,
            tick: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                open_count: 0,
            }),
        }
    }

    /// Append `bytes` to `path`, opening (or re-opening) the file as needed.
    pub fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let entry = {
            let mut inner = self.inner.lock();
            Arc::clone(inner.entries.entry(path.to_path_buf()).or_insert_with(|| {
                Arc::new(PoolEntry {
                    file: Mutex::new(None),
                    last_use: AtomicU64::new(0),
                })
            }))
        };

        // Per-path mutual exclusion for the whole open+append sequence.
        let mut file = entry.file.lock();

        if file.is_none() {
            self.reserve_slot();

            let opened = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening {}", path.display()));

            match opened {
                Ok(f) => *file = Some(f),
                Err(e) => {
                    self.inner.lock().open_count -= 1;
                    return Err(e);
                }
            }
        }

        let f = file.as_mut().expect("handle opened above");
        f.write_all(bytes)
            .with_context(|| format!("appending to {}", path.display()))?;

        entry
            .last_use
            .store(self.tick.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);

        Ok(())
    }

    /// Number of currently open handles. Never exceeds the pool capacity.
    pub fn open_files(&self) -> usize {
        self.inner.lock().open_count
    }

    /// Close every open handle. Blocks on in-flight writes.
    pub fn close_all(&self) {
        // Entry locks are taken without holding the pool lock; a writer
        // blocked in reserve_slot holds its entry lock while waiting on the
        // pool lock.
        let entries: Vec<Arc<PoolEntry>> = {
            let inner = self.inner.lock();
            inner.entries.values().cloned().collect()
        };

        let mut closed = 0;
        for entry in entries {
            if entry.file.lock().take().is_some() {
                closed += 1;
            }
        }

        self.inner.lock().open_count -= closed;
    }

    /// Reserve one open-handle slot, evicting idle LRU handles under
    /// pressure. The slot is counted before the file is opened so the open
    /// count can never overshoot the capacity.
    fn reserve_slot(&self) {
        loop {
            let mut inner = self.inner.lock();
            if inner.open_count < self.capacity {
                inner.open_count += 1;
                return;
            }

            if !evict_lru_idle(&mut inner) {
                // Every open handle is mid-write. Let the writers finish.
                drop(inner);
                std::thread::yield_now();
            }
        }
    }
}

/// Close the least-recently-used idle open handle. An entry is idle when its
/// per-path mutex is uncontended. Returns false when nothing was evictable.
fn evict_lru_idle(inner: &mut Inner) -> bool {
    let mut victim: Option<(Arc<PoolEntry>, u64)> = None;

    for entry in inner.entries.values() {
        let Some(guard) = entry.file.try_lock() else {
            continue;
        };
        if guard.is_none() {
            continue;
        }
        drop(guard);

        let last_use = entry.last_use.load(Ordering::Relaxed);
        if victim.as_ref().map_or(true, |(_, v)| last_use < *v) {
            victim = Some((Arc::clone(entry), last_use));
        }
    }

    let Some((entry, last_use)) = victim else {
        return false;
    };

    // Re-check under the entry lock: a writer may have slipped in between
    // the scan and now.
    let Some(mut guard) = entry.file.try_lock() else {
        return false;
    };
    if guard.take().is_none() {
        return false;
    }

    trace!(last_use, "evicted idle file handle");
    inner.open_count -= 1;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn test_write_appends_and_reopens() {
        let dir = TempDir::new().expect("tempdir");
        let pool = FdPool::new(2);
        let path = dir.path().join("0000_000");

        pool.write(&path, b"abc").expect("write");
        pool.close_all();
        pool.write(&path, b"def").expect("write after close");

        let data = std::fs::read(&path).expect("read back");
        assert_eq!(data, b"abcdef");
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let dir = TempDir::new().expect("tempdir");
        let pool = FdPool::new(3);

        for round in 0..4 {
            for i in 0..16 {
                let path = dir.path().join(format!("{i:04}_000"));
                pool.write(&path, &[round as u8]).expect("write");
                assert!(pool.open_files() <= 3, "open={}", pool.open_files());
            }
        }

        // Every file got all four rounds despite constant eviction.
        for i in 0..16 {
            let data = std::fs::read(dir.path().join(format!("{i:04}_000"))).expect("read");
            assert_eq!(data, &[0, 1, 2, 3]);
        }
    }

    #[test]
    fn test_concurrent_writers_distinct_paths() {
        let dir = TempDir::new().expect("tempdir");
        let pool = Arc::new(FdPool::new(4));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                let path = dir.path().join(format!("{i:04}_000"));
                std::thread::spawn(move || {
                    for n in 0..200u32 {
                        pool.write(&path, &n.to_le_bytes()).expect("write");
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().expect("join");
        }

        assert!(pool.open_files() <= 4);
        for i in 0..8 {
            let data = std::fs::read(dir.path().join(format!("{i:04}_000"))).expect("read");
            assert_eq!(data.len(), 200 * 4);
            for n in 0..200u32 {
                let at = (n as usize) * 4;
                assert_eq!(&data[at..at + 4], &n.to_le_bytes());
            }
        }
    }

    #[test]
    fn test_same_path_writes_do_not_interleave() {
        let dir = TempDir::new().expect("tempdir");
        let pool = Arc::new(FdPool::new(1));
        let path = dir.path().join("0000_000");

        // Each writer appends 32-byte chunks of a single repeated byte; any
        // interleaving inside a chunk would mix the two fill bytes.
        let handles: Vec<_> = [0xAAu8, 0xBB]
            .into_iter()
            .map(|fill| {
                let pool = Arc::clone(&pool);
                let path = path.clone();
                std::thread::spawn(move || {
                    let chunk = [fill; 32];
                    for _ in 0..100 {
                        pool.write(&path, &chunk).expect("write");
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().expect("join");
        }

        let data = std::fs::read(&path).expect("read");
        assert_eq!(data.len(), 2 * 100 * 32);
        for chunk in data.chunks(32) {
            assert!(chunk.iter().all(|b| *b == chunk[0]), "interleaved chunk");
        }
    }

    #[test]
    fn test_open_error_releases_slot() {
        let dir = TempDir::new().expect("tempdir");
        let pool = FdPool::new(1);

        // A directory cannot be opened for append.
        let err = pool.write(dir.path(), b"x");
        assert!(err.is_err());
        assert_eq!(pool.open_files(), 0);

        // The slot is reusable afterwards.
        pool.write(&dir.path().join("0000_000"), b"x").expect("write");
        assert_eq!(pool.open_files(), 1);
    }
}
