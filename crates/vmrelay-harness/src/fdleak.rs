//! File-descriptor leak detection.
//!
//! Sessions own sockets, and the invariant worth testing is that a full
//! lifecycle — hello, allocations, shim disconnects, bye — returns the
//! process to exactly the descriptors it started with. Snapshots read
//! `/proc/self/fd`, so this only works on Linux, which is where the proxy
//! runs anyway.

use std::{collections::BTreeMap, fs, io, path::PathBuf};

/// A snapshot of the process's open file descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdSnapshot {
    entries: BTreeMap<i32, String>,
}

impl FdSnapshot {
    /// Capture the currently open descriptors.
    ///
    /// The directory iterator used for the listing is itself an open fd;
    /// entries are re-checked after the iterator is dropped so it never
    /// shows up in the snapshot.
    ///
    /// # Errors
    ///
    /// `io::Error` if `/proc/self/fd` cannot be read.
    pub fn capture() -> io::Result<Self> {
        let mut candidates: Vec<(i32, String)> = Vec::new();

        for entry in fs::read_dir("/proc/self/fd")? {
            let entry = entry?;
            let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            let target = fs::read_link(entry.path())
                .map_or_else(|_| String::from("<gone>"), |p| p.to_string_lossy().into_owned());
            candidates.push((fd, target));
        }

        let mut entries = BTreeMap::new();
        for (fd, target) in candidates {
            let path = PathBuf::from(format!("/proc/self/fd/{fd}"));
            if fs::symlink_metadata(&path).is_ok() {
                entries.insert(fd, target);
            }
        }

        Ok(Self { entries })
    }

    /// Number of open descriptors in this snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty (it never is for a live process).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptors present in `later` but not in `self`.
    ///
    /// Each leak is rendered as `"fd -> target"` for the assertion message.
    #[must_use]
    pub fn leaked_since(&self, later: &Self) -> Vec<String> {
        later
            .entries
            .iter()
            .filter(|(fd, _)| !self.entries.contains_key(fd))
            .map(|(fd, target)| format!("{fd} -> {target}"))
            .collect()
    }
}
