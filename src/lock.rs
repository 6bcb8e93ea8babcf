use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Serialises writes to the shared prefix, keyed by destination path.
///
/// A caller acquires all of its paths at once; acquisition blocks until none
/// of them is held by anyone else. Taking the whole set in one step means two
/// installs can never wait on each other in a cycle.
#[derive(Debug, Default)]
pub struct PathLocks {
    held: Mutex<BTreeSet<PathBuf>>,
    released: Condvar,
}

/// Releases its paths when dropped.
#[derive(Debug)]
pub struct PathLockGuard<'a> {
    locks: &'a PathLocks,
    paths: BTreeSet<PathBuf>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until every path in `paths` is free, then holds them all.
    pub fn acquire<I>(&self, paths: I) -> PathLockGuard<'_>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let wanted: BTreeSet<PathBuf> = paths.into_iter().collect();
        let mut held = self.lock_held();
        while wanted.iter().any(|p| held.contains(p)) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        held.extend(wanted.iter().cloned());
        PathLockGuard {
            locks: self,
            paths: wanted,
        }
    }

    #[cfg(test)]
    fn is_held(&self, path: &std::path::Path) -> bool {
        self.lock_held().contains(path)
    }

    fn lock_held(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        // The set stays consistent even if a holder panicked.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PathLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.lock_held();
        for path in &self.paths {
            held.remove(path);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
