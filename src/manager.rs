// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide registry of mapped shared files.
//
// Every create, open and final close of a shared file runs under two locks:
// the registry mutex, which serializes this process's threads, and an
// exclusive flock on the scope's shm directory, which serializes processes.
// The flock is always released before the registry mutex.

use std::collections::HashMap;
use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::config::{Config, LockStrategy};
use crate::error::{SharedMemoryError, SystemCallErrors};
use crate::paths::{self, FileKind};
use crate::platform::{self, FileLockGuard, FileLockKind};
use crate::resource_id::ResourceId;
use crate::shm::ProcessDataHeader;

type Registry = HashMap<ResourceId, Arc<ProcessDataHeader>>;

pub struct SharedMemoryManager {
    config: Config,
    lock_strategy: LockStrategy,
    registry: Mutex<Registry>,
}

/// Both creation/deletion locks, held for the duration of a create, open
/// or final close.
pub(crate) struct CreationDeletionLock<'a> {
    // Field order matters: the flock must be released first.
    _scope_lock: FileLockGuard,
    registry: MutexGuard<'a, Registry>,
}

impl CreationDeletionLock<'_> {
    pub(crate) fn find(&self, id: &ResourceId) -> Option<Arc<ProcessDataHeader>> {
        self.registry.get(id).cloned()
    }

    pub(crate) fn insert(&mut self, header: Arc<ProcessDataHeader>) {
        self.registry.insert(header.id().clone(), header);
    }

    fn remove(&mut self, id: &ResourceId) -> Option<Arc<ProcessDataHeader>> {
        self.registry.remove(id)
    }
}

impl SharedMemoryManager {
    /// Build a manager; the lock strategy is resolved here, once.
    pub fn new(config: Config) -> Arc<Self> {
        let lock_strategy = config.resolve_lock_strategy();
        tracing::debug!(
            strategy = ?lock_strategy,
            root = %config.runtime_temp_dir.display(),
            "Shared memory manager initialized"
        );
        Arc::new(Self {
            config,
            lock_strategy,
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// The process-wide manager, configured from the environment on first use.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<SharedMemoryManager>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| SharedMemoryManager::new(Config::from_env())))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lock_strategy(&self) -> LockStrategy {
        self.lock_strategy
    }

    /// Number of distinct shared files this manager currently has mapped.
    pub fn mapped_count(&self) -> usize {
        self.lock_registry().len()
    }

    /// In-process reference count for `id`, if it is mapped.
    pub fn ref_count(&self, id: &ResourceId) -> Option<usize> {
        self.lock_registry().get(id).map(|header| header.ref_count())
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_creation_deletion(
        &self,
        id: &ResourceId,
        errors: &mut SystemCallErrors,
    ) -> Result<CreationDeletionLock<'_>, SharedMemoryError> {
        let registry = self.lock_registry();
        let scope_lock = self.lock_scope_dir(id, errors)?;
        Ok(CreationDeletionLock {
            _scope_lock: scope_lock,
            registry,
        })
    }

    /// Exclusive flock on the scope's shm directory.
    ///
    /// Session directories are removed when their last file goes away, so
    /// the directory we waited on may have been unlinked by the time we own
    /// it. Retry until the locked inode is the one at the path.
    fn lock_scope_dir(
        &self,
        id: &ResourceId,
        errors: &mut SystemCallErrors,
    ) -> Result<FileLockGuard, SharedMemoryError> {
        let temp_dir = self.config.runtime_temp_dir.as_path();
        loop {
            let dir = paths::ensure_scope_dir(temp_dir, id, FileKind::Shared, errors)?;
            let file = match File::open(&dir) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    errors.append("open", dir.display(), &err);
                    continue;
                }
                Err(err) => {
                    errors.append("open", dir.display(), &err);
                    return Err(SharedMemoryError::io_traced(
                        format!("failed to open {}", dir.display()),
                        err,
                        errors,
                    ));
                }
            };
            platform::lock_file(&file, FileLockKind::Exclusive, true).map_err(|err| {
                errors.append("flock(LOCK_EX)", dir.display(), &err);
                SharedMemoryError::io_traced(
                    format!("failed to lock {}", dir.display()),
                    err,
                    errors,
                )
            })?;
            let guard = FileLockGuard::new(file);

            let held = guard.file().metadata().map_err(|err| {
                errors.append("fstat", dir.display(), &err);
                SharedMemoryError::io_traced("failed to stat locked directory", err, errors)
            })?;
            match fs::metadata(&dir) {
                Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
                    return Ok(guard)
                }
                _ => {
                    tracing::debug!(path = %dir.display(), "Scope directory replaced while waiting; retrying");
                }
            }
        }
    }

    /// Drop one reference to `header`, tearing it down if it was the last.
    ///
    /// Failures are logged: a close never fails from the caller's point of
    /// view.
    pub(crate) fn release_header(&self, header: &Arc<ProcessDataHeader>) {
        let mut errors = SystemCallErrors::new(self.config.trace_system_calls);
        match self.lock_creation_deletion(header.id(), &mut errors) {
            Ok(mut lock) => self.release_header_locked(&mut lock, header),
            Err(err) => {
                tracing::warn!(name = %header.id(), error = %err, "Closing without the scope lock; shared files are left for reclamation");
                let mut registry = self.lock_registry();
                if header.dec_ref_count() == 0 {
                    registry.remove(header.id());
                    if let Some(data) = header.take_data() {
                        data.close(false);
                    }
                }
            }
        }
    }

    pub(crate) fn release_header_locked(
        &self,
        lock: &mut CreationDeletionLock<'_>,
        header: &Arc<ProcessDataHeader>,
    ) {
        if header.dec_ref_count() > 0 {
            return;
        }

        let data = header.data();
        // An owning thread holds its own reference until it releases.
        debug_assert!(
            data.as_ref().map_or(true, |data| data.can_close()),
            "last reference to {} dropped while the payload is in use",
            header.id()
        );

        lock.remove(header.id());
        header.take_data();

        // Our own shared lock converts in place; anyone else's blocks it.
        let is_last_process =
            match platform::lock_file(header.file(), FileLockKind::Exclusive, false) {
                Ok(acquired) => acquired,
                Err(err) => {
                    tracing::warn!(name = %header.id(), error = %err, "Failed to probe for other processes");
                    false
                }
            };

        if let Some(data) = data {
            data.close(is_last_process);
        }

        if is_last_process {
            paths::remove_files(&self.config.runtime_temp_dir, header.id());
        }
        tracing::debug!(name = %header.id(), is_last_process, "Closed shared file");
    }
}
