// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared files: the versioned header at the start of every mapping, and the
// per-process, reference-counted handle on one mapped file.

use std::any::Any;
use std::fs::File;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{SharedMemoryError, SystemCallErrors};
use crate::manager::{CreationDeletionLock, SharedMemoryManager};
use crate::paths::{self, FileKind};
use crate::platform::{self, FileLockKind, SharedMapping};
use crate::resource_id::ResourceId;

/// Payload kinds that can live in a shared file.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedMemoryType {
    Mutex = 0,
}

/// `{type, version}` tag written at offset 0 of every shared file.
///
/// Padded to 8 bytes so the payload that follows is pointer-aligned.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedHeader {
    kind: u8,
    version: u8,
}

impl SharedHeader {
    pub const SIZE: usize = std::mem::size_of::<SharedHeader>();

    pub const fn new(kind: SharedMemoryType, version: u8) -> Self {
        Self {
            kind: kind as u8,
            version,
        }
    }

    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// # Safety
    /// `mem` must point to at least `SIZE` mapped, 8-aligned bytes.
    unsafe fn read_from(mem: *const u8) -> Self {
        ptr::read_volatile(mem as *const SharedHeader)
    }

    /// # Safety
    /// Same as [`SharedHeader::read_from`], and the bytes must be writable.
    unsafe fn write_to(&self, mem: *mut u8) {
        ptr::write_volatile(mem as *mut SharedHeader, *self);
    }
}

/// Payload-specific, per-process state attached to a [`ProcessDataHeader`].
pub trait ProcessData: Send + Sync {
    /// Whether the payload can be torn down now that no handle refers to it.
    fn can_close(&self) -> bool;

    /// Release process-local resources. With `release_shared_data` this is
    /// the last process attached, so shared state must be torn down as well.
    fn close(&self, release_shared_data: bool);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// One process's view of one shared file.
///
/// Every handle in the process that names the same resource shares this
/// header. The shared `flock` held on `file` marks this process as attached;
/// the last process to detach is the one that can upgrade it to exclusive.
pub struct ProcessDataHeader {
    id: ResourceId,
    ref_count: AtomicUsize,
    file: File,
    mapping: SharedMapping,
    data: Mutex<Option<Arc<dyn ProcessData>>>,
}

impl ProcessDataHeader {
    /// Find `id` in the registry or map its shared file, creating the file
    /// when `create_if_not_exist` is set.
    ///
    /// Returns `None` if the file does not exist and may not be created, and
    /// otherwise the header plus whether the shared payload is new and must
    /// be initialized by the caller while `lock` is still held.
    pub(crate) fn create_or_open(
        manager: &SharedMemoryManager,
        lock: &mut CreationDeletionLock<'_>,
        id: &ResourceId,
        expected: SharedHeader,
        payload_size: usize,
        create_if_not_exist: bool,
        errors: &mut SystemCallErrors,
    ) -> Result<Option<(Arc<Self>, bool)>, SharedMemoryError> {
        if let Some(header) = lock.find(id) {
            header.inc_ref_count();
            return Ok(Some((header, false)));
        }

        let temp_dir = manager.config().runtime_temp_dir.as_path();
        let path = paths::file_path(temp_dir, id, FileKind::Shared);
        let total_size = SharedHeader::SIZE + payload_size;

        let (file, mut created) = loop {
            match paths::open_file(&path, id, false) {
                Ok(file) => break (file, false),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    errors.append("open", path.display(), &err);
                    if !create_if_not_exist {
                        return Ok(None);
                    }
                }
                Err(err) => {
                    errors.append("open", path.display(), &err);
                    return Err(SharedMemoryError::io_traced(
                        format!("failed to open shared file {}", path.display()),
                        err,
                        errors,
                    ));
                }
            }
            match paths::open_file(&path, id, true) {
                Ok(file) => break (file, true),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    errors.append("open(O_CREAT|O_EXCL)", path.display(), &err);
                }
                Err(err) => {
                    errors.append("open(O_CREAT|O_EXCL)", path.display(), &err);
                    return Err(SharedMemoryError::io_traced(
                        format!("failed to create shared file {}", path.display()),
                        err,
                        errors,
                    ));
                }
            }
        };

        if !created {
            // Nobody else holding the file means it was left behind by a
            // process that died without cleaning up.
            let stale = platform::lock_file(&file, FileLockKind::Exclusive, false)
                .map_err(|err| {
                    errors.append("flock(LOCK_EX|LOCK_NB)", path.display(), &err);
                    SharedMemoryError::io_traced("failed to lock shared file", err, errors)
                })?;
            if stale {
                if !create_if_not_exist {
                    tracing::debug!(name = %id, "Removing stale shared file on open");
                    drop(file);
                    paths::remove_files(temp_dir, id);
                    return Ok(None);
                }
                tracing::debug!(name = %id, "Reinitializing stale shared file");
                file.set_len(0).map_err(|err| {
                    errors.append("ftruncate", path.display(), &err);
                    SharedMemoryError::io_traced("failed to truncate shared file", err, errors)
                })?;
                created = true;
            }
        }

        let result = Self::map(&file, &path, total_size, expected, created, errors);
        let mapping = match result {
            Ok(mapping) => mapping,
            Err(err) => {
                if created {
                    drop(file);
                    paths::remove_files(temp_dir, id);
                }
                return Err(err);
            }
        };

        let header = Arc::new(Self {
            id: id.clone(),
            ref_count: AtomicUsize::new(1),
            file,
            mapping,
            data: Mutex::new(None),
        });
        lock.insert(Arc::clone(&header));
        tracing::debug!(name = %id, created, size = total_size, "Mapped shared file");
        Ok(Some((header, created)))
    }

    fn map(
        file: &File,
        path: &std::path::Path,
        total_size: usize,
        expected: SharedHeader,
        created: bool,
        errors: &mut SystemCallErrors,
    ) -> Result<SharedMapping, SharedMemoryError> {
        if created {
            file.set_len(total_size as u64).map_err(|err| {
                errors.append("ftruncate", path.display(), &err);
                SharedMemoryError::io_traced("failed to size shared file", err, errors)
            })?;
        }

        // Converts an exclusive lock taken above, otherwise waits out a
        // closer that is probing for exclusivity.
        platform::lock_file(file, FileLockKind::Shared, true).map_err(|err| {
            errors.append("flock(LOCK_SH)", path.display(), &err);
            SharedMemoryError::io_traced("failed to lock shared file", err, errors)
        })?;

        if !created {
            let len = file.metadata().map_err(|err| {
                errors.append("fstat", path.display(), &err);
                SharedMemoryError::io_traced("failed to stat shared file", err, errors)
            })?;
            if len.len() < total_size as u64 {
                return Err(SharedMemoryError::HeaderMismatch);
            }
        }

        let mapping = SharedMapping::map(file, total_size).map_err(|err| {
            errors.append("mmap", path.display(), &err);
            SharedMemoryError::io_traced("failed to map shared file", err, errors)
        })?;

        if created {
            unsafe { expected.write_to(mapping.as_mut_ptr()) };
        } else if unsafe { SharedHeader::read_from(mapping.as_ptr()) } != expected {
            return Err(SharedMemoryError::HeaderMismatch);
        }
        Ok(mapping)
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Add a reference. The caller must already hold one, or hold the
    /// manager's creation/deletion lock.
    pub(crate) fn inc_ref_count(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference, returning how many remain. Only called under the
    /// manager's creation/deletion lock.
    pub(crate) fn dec_ref_count(&self) -> usize {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "reference count underflow for {}", self.id);
        prev - 1
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    /// The header as currently stored in the mapping.
    pub fn shared_header(&self) -> SharedHeader {
        unsafe { SharedHeader::read_from(self.mapping.as_ptr()) }
    }

    /// Start of the payload that follows the header.
    pub(crate) fn shared_data_ptr(&self) -> *mut u8 {
        unsafe { self.mapping.as_mut_ptr().add(SharedHeader::SIZE) }
    }

    pub fn mapped_len(&self) -> usize {
        self.mapping.len()
    }

    pub(crate) fn data(&self) -> Option<Arc<dyn ProcessData>> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_data(&self, data: Arc<dyn ProcessData>) {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = Some(data);
    }

    pub(crate) fn take_data(&self) -> Option<Arc<dyn ProcessData>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const TEST_HEADER: SharedHeader = SharedHeader::new(SharedMemoryType::Mutex, 200);

    fn manager(temp: &std::path::Path) -> Arc<SharedMemoryManager> {
        SharedMemoryManager::new(Config::default().with_runtime_temp_dir(temp))
    }

    fn open(
        manager: &SharedMemoryManager,
        id: &ResourceId,
        expected: SharedHeader,
        create: bool,
    ) -> Result<Option<(Arc<ProcessDataHeader>, bool)>, SharedMemoryError> {
        let mut errors = SystemCallErrors::new(true);
        let mut lock = manager.lock_creation_deletion(id, &mut errors)?;
        ProcessDataHeader::create_or_open(manager, &mut lock, id, expected, 64, create, &mut errors)
    }

    #[test]
    fn header_is_pointer_aligned() {
        assert_eq!(SharedHeader::SIZE, 8);
        assert_eq!(std::mem::align_of::<SharedHeader>(), 8);
    }

    #[test]
    fn create_then_reuse_in_process() {
        let temp = tempfile::tempdir().unwrap();
        let m = manager(temp.path());
        let id = ResourceId::new("Global\\hdr", false).unwrap();

        let (h1, created) = open(&m, &id, TEST_HEADER, true).unwrap().unwrap();
        assert!(created);
        assert_eq!(h1.shared_header(), TEST_HEADER);
        assert_eq!(h1.mapped_len(), SharedHeader::SIZE + 64);

        let (h2, created) = open(&m, &id, TEST_HEADER, true).unwrap().unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&h1, &h2));
        assert_eq!(h1.ref_count(), 2);
    }

    #[test]
    fn open_missing_returns_none() {
        let temp = tempfile::tempdir().unwrap();
        let m = manager(temp.path());
        let id = ResourceId::new("Global\\missing", false).unwrap();
        assert!(open(&m, &id, TEST_HEADER, false).unwrap().is_none());
    }

    #[test]
    fn mismatch_with_live_holder_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let a = manager(temp.path());
        let b = manager(temp.path());
        let id = ResourceId::new("Global\\mismatch", false).unwrap();

        let (_held, _) = open(&a, &id, TEST_HEADER, true).unwrap().unwrap();
        let other = SharedHeader::new(SharedMemoryType::Mutex, 201);
        assert!(matches!(
            open(&b, &id, other, true),
            Err(SharedMemoryError::HeaderMismatch)
        ));
    }

    #[test]
    fn mismatch_without_holder_is_reinitialized() {
        let temp = tempfile::tempdir().unwrap();
        let m = manager(temp.path());
        let id = ResourceId::new("Global\\stale", false).unwrap();

        let mut errors = SystemCallErrors::new(false);
        paths::ensure_scope_dir(temp.path(), &id, FileKind::Shared, &mut errors).unwrap();
        let path = paths::file_path(temp.path(), &id, FileKind::Shared);
        std::fs::write(&path, b"garbage that is not a header").unwrap();

        let (header, created) = open(&m, &id, TEST_HEADER, true).unwrap().unwrap();
        assert!(created);
        assert_eq!(header.shared_header(), TEST_HEADER);
    }

    #[test]
    fn stale_file_is_removed_on_open_only() {
        let temp = tempfile::tempdir().unwrap();
        let m = manager(temp.path());
        let id = ResourceId::new("Global\\stale_open", false).unwrap();

        let mut errors = SystemCallErrors::new(false);
        paths::ensure_scope_dir(temp.path(), &id, FileKind::Shared, &mut errors).unwrap();
        let path = paths::file_path(temp.path(), &id, FileKind::Shared);
        std::fs::write(&path, [0u8; 72]).unwrap();

        assert!(open(&m, &id, TEST_HEADER, false).unwrap().is_none());
        assert!(!path.exists());
    }
}
