//! Shared weight state ("metagraph")
//!
//! The metagraph is owned outside the worker. A worker only ever pulls a
//! snapshot (`sync`), reads the weight matrix, and publishes its own row
//! (`emit`). Each handle is bound to the hotkey it publishes for.
//!
//! Two stores are provided: an in-process store shared through an `Arc`, and
//! a JSON document on disk that several worker processes can share. The file
//! store serializes writers with an exclusive `flock` on a sibling lock file
//! and replaces the document with an atomic rename, so readers never see a
//! partial write.

use crate::weights::{WeightMatrix, WeightVector};
use axonfleet_common::config::{MetagraphBackend, MetagraphConfig};
use axonfleet_common::{FleetError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Peers are identified by hotkey
pub type PeerId = String;

/// Shared-state access used by the weight synchronizer
pub trait Metagraph: Send {
    /// Pull the latest shared state into the local snapshot
    fn sync(&mut self) -> Result<()>;

    /// Weight matrix of the local snapshot
    fn weights(&self) -> &WeightMatrix;

    /// Peer ordering of the local snapshot
    fn neurons(&self) -> &[PeerId];

    /// Hotkey this handle publishes for
    fn hotkey(&self) -> &str;

    /// Add this handle's hotkey to the shared state if missing; returns its uid
    fn register(&mut self) -> Result<usize>;

    /// Publish this handle's row. With `wait_for_inclusion` the call returns
    /// only once the row is visible in the shared state.
    fn emit(&mut self, row: &WeightVector, wait_for_inclusion: bool) -> Result<()>;

    /// Position of a hotkey in the snapshot
    fn uid_of(&self, hotkey: &str) -> Option<usize> {
        self.neurons().iter().position(|n| n == hotkey)
    }

    /// Position of this handle's hotkey in the snapshot
    fn own_uid(&self) -> Option<usize> {
        self.uid_of(self.hotkey())
    }
}

/// The shared document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    /// Incremented on every applied change
    pub version: u64,

    /// Peer ordering; index = uid
    pub neurons: Vec<PeerId>,

    /// `W[i, j]`
    pub weights: WeightMatrix,
}

impl SharedState {
    /// Register a hotkey, growing the matrix; returns its uid
    pub fn register(&mut self, hotkey: &str) -> usize {
        if let Some(uid) = self.neurons.iter().position(|n| n == hotkey) {
            return uid;
        }
        self.neurons.push(hotkey.to_string());
        self.weights.grow(self.neurons.len());
        self.version += 1;
        self.neurons.len() - 1
    }

    /// Replace the row of `hotkey`. A row published from an older snapshot
    /// (fewer peers) is zero-padded for peers that joined since.
    pub fn apply_row(&mut self, hotkey: &str, row: &WeightVector) -> Result<u64> {
        let uid = self
            .neurons
            .iter()
            .position(|n| n == hotkey)
            .ok_or_else(|| FleetError::metagraph(format!("hotkey {} is not registered", hotkey)))?;

        let n = self.neurons.len();
        if row.len() > n {
            return Err(FleetError::metagraph(format!(
                "row has {} entries but only {} peers are registered",
                row.len(),
                n
            )));
        }

        let mut padded = row.as_slice().to_vec();
        padded.resize(n, 0.0);
        self.weights.set_row(uid, &WeightVector::new(padded))?;
        self.version += 1;
        Ok(self.version)
    }

    fn row_of(&self, hotkey: &str) -> Option<WeightVector> {
        let uid = self.neurons.iter().position(|n| n == hotkey)?;
        self.weights.row(uid)
    }
}

/// In-process shared state
#[derive(Debug, Clone)]
pub struct InMemoryMetagraph {
    store: Arc<RwLock<SharedState>>,
    hotkey: String,
    snapshot: SharedState,
}

impl InMemoryMetagraph {
    /// Create a fresh store with a handle bound to `hotkey`
    pub fn new(hotkey: impl Into<String>) -> Self {
        Self::with_state(SharedState::default(), hotkey)
    }

    /// Create a store seeded with `state`
    pub fn with_state(state: SharedState, hotkey: impl Into<String>) -> Self {
        Self {
            store: Arc::new(RwLock::new(state)),
            hotkey: hotkey.into(),
            snapshot: SharedState::default(),
        }
    }

    /// Another handle on the same store, bound to a different hotkey
    pub fn handle(&self, hotkey: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            hotkey: hotkey.into(),
            snapshot: SharedState::default(),
        }
    }

    /// Copy of the current shared state (not the local snapshot)
    pub fn shared_state(&self) -> SharedState {
        self.store.read().clone()
    }
}

impl Metagraph for InMemoryMetagraph {
    fn sync(&mut self) -> Result<()> {
        self.snapshot = self.store.read().clone();
        trace!(version = self.snapshot.version, "metagraph synced");
        Ok(())
    }

    fn weights(&self) -> &WeightMatrix {
        &self.snapshot.weights
    }

    fn neurons(&self) -> &[PeerId] {
        &self.snapshot.neurons
    }

    fn hotkey(&self) -> &str {
        &self.hotkey
    }

    fn register(&mut self) -> Result<usize> {
        let uid = self.store.write().register(&self.hotkey);
        self.sync()?;
        Ok(uid)
    }

    fn emit(&mut self, row: &WeightVector, _wait_for_inclusion: bool) -> Result<()> {
        // Applied under the write lock, so inclusion is immediate.
        let version = self.store.write().apply_row(&self.hotkey, row)?;
        debug!(hotkey = %self.hotkey, version, "row emitted");
        Ok(())
    }
}

/// Shared state stored as a JSON document on disk
#[derive(Debug)]
pub struct FileMetagraph {
    path: PathBuf,
    lock_path: PathBuf,
    hotkey: String,
    snapshot: SharedState,
    inclusion_timeout: Duration,
}

/// Exclusive writer lock; released on drop (and by the OS if the holder dies)
struct WriterLock {
    file: File,
}

impl WriterLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| FleetError::metagraph(format!("Failed to open lock {}: {}", path.display(), e)))?;

        let deadline = Instant::now() + timeout;
        loop {
            if try_lock_exclusive(&file)? {
                return Ok(Self { file });
            }
            if Instant::now() >= deadline {
                return Err(FleetError::timeout(format!(
                    "metagraph lock {} still held after {:?}",
                    path.display(),
                    timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(FleetError::metagraph(format!("flock failed: {}", err)))
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

impl FileMetagraph {
    /// Open (or lazily create) the document at `path`
    pub fn open(path: impl Into<PathBuf>, hotkey: impl Into<String>, inclusion_timeout: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let lock_path = path.with_extension("lock");

        Ok(Self {
            path,
            lock_path,
            hotkey: hotkey.into(),
            snapshot: SharedState::default(),
            inclusion_timeout,
        })
    }

    /// Document location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document as it is on disk right now
    pub fn read_state(&self) -> Result<SharedState> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SharedState::default()),
            Err(e) => Err(FleetError::metagraph(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn write_state(&self, state: &SharedState) -> Result<()> {
        let temp_path = self
            .path
            .with_extension(format!("tmp.{}", std::process::id()));
        let bytes = serde_json::to_vec(state)?;
        std::fs::write(&temp_path, bytes).map_err(|e| {
            FleetError::metagraph(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        std::fs::rename(&temp_path, &self.path).map_err(|e| {
            FleetError::metagraph(format!(
                "Failed to rename {} -> {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn update<T>(&self, f: impl FnOnce(&mut SharedState) -> Result<T>) -> Result<T> {
        let _lock = WriterLock::acquire(&self.lock_path, self.inclusion_timeout)?;
        let mut state = self.read_state()?;
        let out = f(&mut state)?;
        self.write_state(&state)?;
        Ok(out)
    }

    fn wait_for_inclusion(&self, version: u64, row: &WeightVector) -> Result<()> {
        let deadline = Instant::now() + self.inclusion_timeout;
        loop {
            let state = self.read_state()?;
            let included = state.version >= version
                && state
                    .row_of(&self.hotkey)
                    .map(|r| r.as_slice().starts_with(row.as_slice()))
                    .unwrap_or(false);
            if included || state.version > version {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FleetError::timeout(format!(
                    "row for {} not included after {:?}",
                    self.hotkey, self.inclusion_timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Metagraph for FileMetagraph {
    fn sync(&mut self) -> Result<()> {
        self.snapshot = self.read_state()?;
        trace!(version = self.snapshot.version, path = %self.path.display(), "metagraph synced");
        Ok(())
    }

    fn weights(&self) -> &WeightMatrix {
        &self.snapshot.weights
    }

    fn neurons(&self) -> &[PeerId] {
        &self.snapshot.neurons
    }

    fn hotkey(&self) -> &str {
        &self.hotkey
    }

    fn register(&mut self) -> Result<usize> {
        let hotkey = self.hotkey.clone();
        let uid = self.update(|state| Ok(state.register(&hotkey)))?;
        self.sync()?;
        Ok(uid)
    }

    fn emit(&mut self, row: &WeightVector, wait_for_inclusion: bool) -> Result<()> {
        let hotkey = self.hotkey.clone();
        let version = self.update(|state| state.apply_row(&hotkey, row))?;
        debug!(hotkey = %self.hotkey, version, "row emitted");

        if wait_for_inclusion {
            self.wait_for_inclusion(version, row)?;
        }
        Ok(())
    }
}

/// Open the configured store for `hotkey`
pub fn open(config: &MetagraphConfig, hotkey: &str) -> Result<Box<dyn Metagraph>> {
    match config.backend {
        MetagraphBackend::Memory => {
            warn!("in-memory metagraph is private to this process");
            Ok(Box::new(InMemoryMetagraph::new(hotkey)))
        }
        MetagraphBackend::File => Ok(Box::new(FileMetagraph::open(
            config.path.clone(),
            hotkey,
            Duration::from_millis(config.inclusion_timeout_ms),
        )?)),
    }
}
