// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Directory-backed store shared between processes.
//!
//! Each key is one file. Writes are atomic (temp file + rename) and other
//! processes learn about them through a `notify` watcher on the directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::kv::{Announced, ChangeFeed, ContextId, PersistentKv, StorageChange};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// File name suffix for stored keys.
const SUFFIX: &str = ".kv";

/// Last value this handle knows for each key (`None` = absent).
///
/// Own writes hold the lock across the filesystem operation and the watcher
/// reads files under the same lock, so the echo of an own write always
/// compares equal and is dropped.
type Known = Arc<Mutex<HashMap<String, Option<String>>>>;

/// A [`PersistentKv`] over a directory.
pub struct FileKv {
    dir: PathBuf,
    id: ContextId,
    known: Known,
    change_tx: broadcast::Sender<Announced>,
    _watcher: Option<notify::RecommendedWatcher>,
}

impl std::fmt::Debug for FileKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKv")
            .field("dir", &self.dir)
            .field("id", &self.id)
            .field("watching", &self._watcher.is_some())
            .finish()
    }
}

impl FileKv {
    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// If the filesystem watcher cannot be started the store still works,
    /// but its change feed stays silent.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut initial = HashMap::new();
        for key in list_keys(&dir)? {
            let value = std::fs::read_to_string(dir.join(file_name_for(&key))).ok();
            initial.insert(key, value);
        }
        let known: Known = Arc::new(Mutex::new(initial));
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        let watcher = setup_watcher(&dir, Arc::clone(&known), change_tx.clone());
        if watcher.is_none() {
            warn!(dir = %dir.display(), "file watcher unavailable, cross-process changes will not be observed");
        }

        Ok(Self { dir, id: ContextId::next(), known, change_tx, _watcher: watcher })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name_for(key))
    }
}

impl PersistentKv for FileKv {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: String) {
        let path = self.path_for(key);
        let mut known = self.known.lock();
        if let Err(e) = write_atomic(&path, &value) {
            warn!(key, path = %path.display(), "failed to write entry: {e}");
        }
        known.insert(key.to_owned(), Some(value));
    }

    fn remove(&self, key: &str) {
        let path = self.path_for(key);
        let mut known = self.known.lock();
        known.insert(key.to_owned(), None);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(key, path = %path.display(), "failed to remove entry: {e}"),
        }
    }

    fn keys(&self) -> Vec<String> {
        match list_keys(&self.dir) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(dir = %self.dir.display(), "failed to list entries: {e}");
                vec![]
            }
        }
    }

    fn subscribe(&self) -> ChangeFeed {
        ChangeFeed::new(self.change_tx.subscribe(), self.id)
    }
}

/// Write `contents` to `path` atomically (unique temp file + rename).
///
/// The temp name carries PID and a counter so concurrent writers never share
/// a temp file.
fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        ".{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}

fn list_keys(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut keys = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(key) = entry.file_name().to_str().and_then(key_for_file_name) {
            keys.push(key);
        }
    }
    keys.sort();
    Ok(keys)
}

/// Watch `dir` and announce changes that differ from what this handle knows.
fn setup_watcher(
    dir: &Path,
    known: Known,
    change_tx: broadcast::Sender<Announced>,
) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let root = dir.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                debug!("file watcher error: {e}");
                let _ = change_tx
                    .send(Announced { origin: ContextId::EXTERNAL, change: StorageChange::unknown() });
                return;
            }
        };
        for path in &event.paths {
            let Some(key) = path.file_name().and_then(|n| n.to_str()).and_then(key_for_file_name)
            else {
                continue;
            };
            let (old, current) = {
                let mut known = known.lock();
                let current = std::fs::read_to_string(root.join(file_name_for(&key))).ok();
                let old = known.insert(key.clone(), current.clone()).flatten();
                if old == current {
                    continue;
                }
                (old, current)
            };
            let _ = change_tx.send(Announced {
                origin: ContextId::EXTERNAL,
                change: StorageChange { key: Some(key), old_value: old, new_value: current },
            });
        }
    })
    .ok()?;

    watcher.watch(dir, RecursiveMode::NonRecursive).ok()?;
    Some(watcher)
}

/// Encode a key into a file name: `[A-Za-z0-9._-]` pass through (except a
/// leading `.`), everything else becomes `%XX`.
fn file_name_for(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + SUFFIX.len());
    for (i, b) in key.bytes().enumerate() {
        let plain = b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || (b == b'.' && i > 0);
        if plain {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out.push_str(SUFFIX);
    out
}

fn key_for_file_name(name: &str) -> Option<String> {
    if name.starts_with('.') {
        return None;
    }
    let encoded = name.strip_suffix(SUFFIX)?;
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;
