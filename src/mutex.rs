// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process named mutex with Windows semantics: recursive ownership by
// the owning thread, timed acquisition, and abandonment detection when the
// owner thread or process dies while holding it.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::fs::File;
use std::mem::{self, ManuallyDrop};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::backoff::PollBackoff;
use crate::config::LockStrategy;
use crate::error::{Error, NamedMutexError, Result, SharedMemoryError, SystemCallErrors};
use crate::local_lock::ProcessLocalLock;
use crate::manager::SharedMemoryManager;
use crate::mutex_helpers::{self, INFINITE};
use crate::owned;
use crate::paths;
use crate::platform::{self, FileLockKind};
use crate::resource_id::ResourceId;
use crate::scoped_lock::ScopedLock;
use crate::shm::{ProcessData, ProcessDataHeader, SharedHeader, SharedMemoryType};

/// Outcome of a successful call to acquire a named mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexTryAcquireLockResult {
    AcquiredLock,
    /// Acquired, but the previous owner died while holding it; whatever it
    /// protected may be inconsistent. Reported to exactly one acquirer.
    AcquiredLockButAbandoned,
    TimedOut,
}

impl MutexTryAcquireLockResult {
    pub fn is_acquired(self) -> bool {
        self != MutexTryAcquireLockResult::TimedOut
    }
}

/// Options for [`NamedMutex::create`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutexAttributes {
    /// Restrict the mutex to the current effective user.
    pub current_user_only: bool,
}

// ---------------------------------------------------------------------------
// MutexSharedData: lives in the shared file, identical in every process
// ---------------------------------------------------------------------------

const INVALID_PROCESS_ID: u32 = 0;
const INVALID_THREAD_ID: u64 = 0;

/// The lock itself. Which member is live is fixed by the lock strategy,
/// which is also encoded in the header version.
#[repr(C)]
union LockStorage {
    robust: ManuallyDrop<UnsafeCell<libc::pthread_mutex_t>>,
    timed_waiter_count: ManuallyDrop<AtomicU32>,
}

#[repr(C)]
pub(crate) struct MutexSharedData {
    lock: LockStorage,
    lock_owner_process_id: AtomicU32,
    lock_owner_thread_id: AtomicU64,
    is_abandoned: AtomicBool,
}

impl MutexSharedData {
    pub(crate) const SIZE: usize = mem::size_of::<MutexSharedData>();

    /// Header identifying a mutex payload. Each strategy has its own layout
    /// version so processes using different strategies never share a file.
    pub(crate) fn shared_header(strategy: LockStrategy) -> SharedHeader {
        let version = match strategy {
            LockStrategy::Robust => 1,
            LockStrategy::FileLock => 2,
        };
        SharedHeader::new(SharedMemoryType::Mutex, version)
    }

    /// # Safety
    /// `mem` must point to `SIZE` mapped bytes that outlive `'a`.
    unsafe fn from_ptr<'a>(mem: *mut u8) -> &'a Self {
        &*(mem as *const MutexSharedData)
    }

    /// Set up a freshly created (zero-filled) payload.
    fn initialize(&self, strategy: LockStrategy) -> std::io::Result<()> {
        self.clear_lock_owner();
        self.is_abandoned.store(false, Ordering::Release);
        match strategy {
            LockStrategy::Robust => mutex_helpers::initialize(self.robust_lock()),
            LockStrategy::FileLock => {
                self.timed_waiter_count().store(0, Ordering::Release);
                Ok(())
            }
        }
    }

    fn robust_lock(&self) -> *mut libc::pthread_mutex_t {
        unsafe { self.lock.robust.get() }
    }

    fn timed_waiter_count(&self) -> &AtomicU32 {
        unsafe { &self.lock.timed_waiter_count }
    }

    fn is_lock_owned_by_any_thread(&self) -> bool {
        self.lock_owner_process_id.load(Ordering::Acquire) != INVALID_PROCESS_ID
            || self.lock_owner_thread_id.load(Ordering::Acquire) != INVALID_THREAD_ID
    }

    fn lock_owner(&self) -> (u32, u64) {
        (
            self.lock_owner_process_id.load(Ordering::Acquire),
            self.lock_owner_thread_id.load(Ordering::Acquire),
        )
    }

    fn set_lock_owner(&self, process_id: u32, thread_id: u64) {
        self.lock_owner_process_id.store(process_id, Ordering::Release);
        self.lock_owner_thread_id.store(thread_id, Ordering::Release);
    }

    fn clear_lock_owner(&self) {
        self.set_lock_owner(INVALID_PROCESS_ID, INVALID_THREAD_ID);
    }

    fn is_abandoned(&self) -> bool {
        self.is_abandoned.load(Ordering::Acquire)
    }

    fn set_is_abandoned(&self, value: bool) {
        self.is_abandoned.store(value, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// NamedMutexProcessData: one per (process, name)
// ---------------------------------------------------------------------------

enum LockBackend {
    Robust,
    FileLock {
        local_lock: ProcessLocalLock,
        lock_file: File,
    },
}

#[derive(Debug, Default)]
struct OwnershipState {
    lock_count: u32,
    owner: Option<ThreadId>,
    /// Set while the owner thread's held-list keeps a header reference.
    has_implicit_ref: bool,
}

impl OwnershipState {
    fn increment(&mut self) -> std::result::Result<(), NamedMutexError> {
        self.lock_count = self
            .lock_count
            .checked_add(1)
            .ok_or(NamedMutexError::MaximumRecursiveLocksReached)?;
        Ok(())
    }
}

pub(crate) struct NamedMutexProcessData {
    manager: Arc<SharedMemoryManager>,
    header: Arc<ProcessDataHeader>,
    backend: LockBackend,
    state: Mutex<OwnershipState>,
}

impl NamedMutexProcessData {
    fn shared(&self) -> &MutexSharedData {
        unsafe { MutexSharedData::from_ptr(self.header.shared_data_ptr()) }
    }

    fn lock_state(&self) -> MutexGuard<'_, OwnershipState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> &ResourceId {
        self.header.id()
    }

    pub(crate) fn try_acquire_lock(
        self: &Arc<Self>,
        timeout_ms: u32,
    ) -> Result<MutexTryAcquireLockResult> {
        let me = thread::current().id();
        {
            let mut state = self.lock_state();
            if state.owner == Some(me) {
                state.increment()?;
                return Ok(MutexTryAcquireLockResult::AcquiredLock);
            }
        }

        // A mutex acquired now could never be swept on thread exit.
        if !owned::is_tracking_available() {
            tracing::warn!(name = %self.id(), "Refusing to acquire named mutex during thread teardown");
            return Err(NamedMutexError::Unknown.into());
        }

        let result = match &self.backend {
            LockBackend::Robust => self.acquire_robust(timeout_ms)?,
            LockBackend::FileLock {
                local_lock,
                lock_file,
            } => self.acquire_file_lock(local_lock, lock_file, timeout_ms)?,
        };
        if result == MutexTryAcquireLockResult::TimedOut {
            return Ok(result);
        }

        self.shared()
            .set_lock_owner(platform::current_process_id(), platform::current_thread_id());
        {
            let mut state = self.lock_state();
            state.lock_count = 1;
            state.owner = Some(me);
            state.has_implicit_ref = true;
        }
        self.header.inc_ref_count();
        owned::add(Arc::clone(self));

        if result == MutexTryAcquireLockResult::AcquiredLockButAbandoned {
            tracing::debug!(name = %self.id(), "Acquired abandoned named mutex");
        }
        Ok(result)
    }

    fn acquire_robust(&self, timeout_ms: u32) -> Result<MutexTryAcquireLockResult> {
        let shared = self.shared();
        let result = mutex_helpers::try_acquire_lock(shared.robust_lock(), timeout_ms)
            .map_err(|err| {
                tracing::error!(name = %self.id(), error = %err, "Robust mutex lock failed");
                NamedMutexError::Unknown
            })?;
        if result == MutexTryAcquireLockResult::TimedOut {
            return Ok(result);
        }
        if result == MutexTryAcquireLockResult::AcquiredLockButAbandoned || shared.is_abandoned() {
            shared.set_is_abandoned(false);
            return Ok(MutexTryAcquireLockResult::AcquiredLockButAbandoned);
        }
        Ok(MutexTryAcquireLockResult::AcquiredLock)
    }

    fn acquire_file_lock(
        &self,
        local_lock: &ProcessLocalLock,
        lock_file: &File,
        timeout_ms: u32,
    ) -> Result<MutexTryAcquireLockResult> {
        let start = Instant::now();
        let timeout = (timeout_ms != INFINITE).then(|| Duration::from_millis(timeout_ms as u64));

        if !local_lock.try_acquire(timeout) {
            return Ok(MutexTryAcquireLockResult::TimedOut);
        }

        let acquired = match self.poll_file_lock(lock_file, start, timeout) {
            Ok(acquired) => acquired,
            Err(err) => {
                local_lock.release();
                return Err(err);
            }
        };
        if !acquired {
            local_lock.release();
            return Ok(MutexTryAcquireLockResult::TimedOut);
        }

        // The OS drops a dead process's flock, but not its owner stamp.
        let shared = self.shared();
        if shared.is_abandoned() || shared.is_lock_owned_by_any_thread() {
            let (pid, tid) = shared.lock_owner();
            tracing::debug!(name = %self.id(), owner_pid = pid, owner_tid = tid, "Previous owner died holding the lock");
            shared.set_is_abandoned(false);
            return Ok(MutexTryAcquireLockResult::AcquiredLockButAbandoned);
        }
        Ok(MutexTryAcquireLockResult::AcquiredLock)
    }

    /// flock(2) has no timed wait: block for an infinite timeout, otherwise
    /// poll until `start + timeout`.
    fn poll_file_lock(
        &self,
        lock_file: &File,
        start: Instant,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let lock_err =
            |err: std::io::Error| -> Error { SharedMemoryError::io("failed to lock lock file", err).into() };

        let Some(timeout) = timeout else {
            platform::lock_file(lock_file, FileLockKind::Exclusive, true).map_err(lock_err)?;
            return Ok(true);
        };

        if platform::lock_file(lock_file, FileLockKind::Exclusive, false).map_err(lock_err)? {
            return Ok(true);
        }

        let waiters = self.shared().timed_waiter_count();
        waiters.fetch_add(1, Ordering::AcqRel);
        let mut backoff = PollBackoff::new(self.manager.config().poll_max_sleep_ms);
        let result = loop {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                break Ok(false);
            }
            backoff.sleep(timeout - elapsed);
            match platform::lock_file(lock_file, FileLockKind::Exclusive, false) {
                Ok(true) => break Ok(true),
                Ok(false) => {}
                Err(err) => break Err(lock_err(err)),
            }
        };
        waiters.fetch_sub(1, Ordering::AcqRel);
        result
    }

    pub(crate) fn release_lock(&self) -> Result<()> {
        let had_implicit_ref = {
            let mut state = self.lock_state();
            if state.owner != Some(thread::current().id()) {
                return Err(NamedMutexError::ThreadHasNotAcquiredMutex.into());
            }
            state.lock_count -= 1;
            if state.lock_count > 0 {
                return Ok(());
            }
            state.owner = None;
            mem::take(&mut state.has_implicit_ref)
        };

        owned::remove(self);
        self.actually_release_lock(false);
        if had_implicit_ref {
            self.manager.release_header(&self.header);
        }
        Ok(())
    }

    /// Give up ownership on behalf of a thread that is exiting while still
    /// holding the mutex. The next acquirer sees `AcquiredLockButAbandoned`.
    pub(crate) fn abandon(&self) {
        let had_implicit_ref = {
            let mut state = self.lock_state();
            if state.owner.is_none() {
                return;
            }
            state.lock_count = 0;
            state.owner = None;
            mem::take(&mut state.has_implicit_ref)
        };

        tracing::debug!(name = %self.id(), "Abandoning named mutex held by exiting thread");
        self.actually_release_lock(true);
        if had_implicit_ref {
            self.manager.release_header(&self.header);
        }
    }

    fn actually_release_lock(&self, abandoned: bool) {
        let shared = self.shared();
        shared.clear_lock_owner();
        if abandoned {
            shared.set_is_abandoned(true);
        }

        match &self.backend {
            LockBackend::Robust => {
                if let Err(err) = mutex_helpers::release_lock(shared.robust_lock()) {
                    tracing::error!(name = %self.id(), error = %err, "Robust mutex unlock failed");
                }
            }
            LockBackend::FileLock {
                local_lock,
                lock_file,
            } => {
                let has_timed_waiters = shared.timed_waiter_count().load(Ordering::Acquire) != 0;
                if let Err(err) = platform::unlock_file(lock_file) {
                    tracing::error!(name = %self.id(), error = %err, "Lock file unlock failed");
                }
                local_lock.release();
                // Pollers only look every few milliseconds; give them a
                // chance before this thread can take the lock again.
                if has_timed_waiters {
                    thread::yield_now();
                }
            }
        }
    }

    fn is_locked_by_current_thread(&self) -> bool {
        self.lock_state().owner == Some(thread::current().id())
    }

    fn lock_count(&self) -> u32 {
        let state = self.lock_state();
        if state.owner == Some(thread::current().id()) {
            state.lock_count
        } else {
            0
        }
    }
}

impl ProcessData for NamedMutexProcessData {
    fn can_close(&self) -> bool {
        let state = self.lock_state();
        state.lock_count == 0 && !state.has_implicit_ref
    }

    fn close(&self, release_shared_data: bool) {
        if release_shared_data {
            if let LockBackend::Robust = self.backend {
                mutex_helpers::destroy(self.shared().robust_lock());
            }
        }
        tracing::debug!(name = %self.id(), release_shared_data, "Closed named mutex");
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------------------
// NamedMutex: a handle
// ---------------------------------------------------------------------------

/// A handle to a named, inter-process mutex.
///
/// Handles to the same name within one process share ownership state, so a
/// thread holding the mutex through one handle re-enters it through any
/// other. Dropping the last handle while the current thread still holds the
/// mutex keeps it alive until the thread releases it or exits.
pub struct NamedMutex {
    data: Arc<NamedMutexProcessData>,
    created: bool,
}

impl NamedMutex {
    /// Create the mutex or open it if it already exists.
    ///
    /// With `initial_owner`, the calling thread owns the mutex on return if,
    /// and only if, this call created it (see [`NamedMutex::created_new`]).
    pub fn create(name: &str, attributes: MutexAttributes, initial_owner: bool) -> Result<Self> {
        Self::create_in(&SharedMemoryManager::global(), name, attributes, initial_owner)
    }

    pub fn create_in(
        manager: &Arc<SharedMemoryManager>,
        name: &str,
        attributes: MutexAttributes,
        initial_owner: bool,
    ) -> Result<Self> {
        Self::create_or_open(manager, name, attributes, true, initial_owner)?
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Open an existing mutex; fails with [`Error::NotFound`] otherwise.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_in(&SharedMemoryManager::global(), name, MutexAttributes::default())
    }

    pub fn open_in(
        manager: &Arc<SharedMemoryManager>,
        name: &str,
        attributes: MutexAttributes,
    ) -> Result<Self> {
        Self::create_or_open(manager, name, attributes, false, false)?
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn create_or_open(
        manager: &Arc<SharedMemoryManager>,
        name: &str,
        attributes: MutexAttributes,
        create_if_not_exist: bool,
        acquire_if_created: bool,
    ) -> Result<Option<Self>> {
        let id = ResourceId::new(name, attributes.current_user_only)?;
        let strategy = manager.lock_strategy();
        let mut errors = SystemCallErrors::new(manager.config().trace_system_calls);

        let mut lock = manager.lock_creation_deletion(&id, &mut errors)?;
        let Some((header, created)) = ProcessDataHeader::create_or_open(
            manager,
            &mut lock,
            &id,
            MutexSharedData::shared_header(strategy),
            MutexSharedData::SIZE,
            create_if_not_exist,
            &mut errors,
        )?
        else {
            return Ok(None);
        };

        let data = match Self::attach(manager, &header, created, strategy, &mut errors) {
            Ok(data) => data,
            Err(err) => {
                manager.release_header_locked(&mut lock, &header);
                return Err(err);
            }
        };
        let mutex = NamedMutex { data, created };

        // Still under the creation lock, so no other process can have opened
        // the name and taken the lock first.
        if created && acquire_if_created {
            let acquired = mutex.try_acquire_lock(0);
            if !matches!(acquired, Ok(MutexTryAcquireLockResult::AcquiredLock)) {
                // The handle's drop takes the creation lock itself.
                drop(lock);
                drop(mutex);
                tracing::warn!(name = %id, result = ?acquired, "Newly created mutex could not be acquired");
                return Err(match acquired {
                    Err(err) => err,
                    Ok(_) => NamedMutexError::Unknown.into(),
                });
            }
        }
        drop(lock);

        tracing::debug!(name = %id, created, strategy = ?strategy, "Opened named mutex");
        Ok(Some(mutex))
    }

    /// Bind the per-process state to `header`, creating it on first use.
    fn attach(
        manager: &Arc<SharedMemoryManager>,
        header: &Arc<ProcessDataHeader>,
        created: bool,
        strategy: LockStrategy,
        errors: &mut SystemCallErrors,
    ) -> Result<Arc<NamedMutexProcessData>> {
        if created {
            let shared = unsafe { MutexSharedData::from_ptr(header.shared_data_ptr()) };
            shared.initialize(strategy).map_err(|err| {
                SharedMemoryError::io_traced("failed to initialize shared mutex", err, errors)
            })?;
        }

        if let Some(existing) = header.data() {
            return existing
                .as_any()
                .downcast::<NamedMutexProcessData>()
                .map_err(|_| SharedMemoryError::HeaderMismatch.into());
        }

        let backend = match strategy {
            LockStrategy::Robust => LockBackend::Robust,
            LockStrategy::FileLock => LockBackend::FileLock {
                local_lock: ProcessLocalLock::new(),
                lock_file: paths::open_or_create_lock_file(
                    &manager.config().runtime_temp_dir,
                    header.id(),
                    errors,
                )?,
            },
        };
        let data = Arc::new(NamedMutexProcessData {
            manager: Arc::clone(manager),
            header: Arc::clone(header),
            backend,
            state: Mutex::new(OwnershipState::default()),
        });
        header.set_data(Arc::clone(&data) as Arc<dyn ProcessData>);
        Ok(data)
    }

    /// Whether this handle's create call brought the mutex into existence.
    pub fn created_new(&self) -> bool {
        self.created
    }

    pub fn id(&self) -> &ResourceId {
        self.data.id()
    }

    pub fn lock_strategy(&self) -> LockStrategy {
        match self.data.backend {
            LockBackend::Robust => LockStrategy::Robust,
            LockBackend::FileLock { .. } => LockStrategy::FileLock,
        }
    }

    /// Acquire within `timeout_ms` milliseconds (0 = try once,
    /// [`INFINITE`] = wait forever).
    pub fn try_acquire_lock(&self, timeout_ms: u32) -> Result<MutexTryAcquireLockResult> {
        self.data.try_acquire_lock(timeout_ms)
    }

    /// Acquire, waiting as long as it takes.
    pub fn lock(&self) -> Result<MutexTryAcquireLockResult> {
        self.try_acquire_lock(INFINITE)
    }

    /// Acquire, returning a guard that releases on drop.
    pub fn scoped(&self) -> Result<ScopedLock<'_>> {
        ScopedLock::new(self)
    }

    /// Release one level of ownership held by the calling thread.
    pub fn release_lock(&self) -> Result<()> {
        self.data.release_lock()
    }

    pub fn is_locked_by_current_thread(&self) -> bool {
        self.data.is_locked_by_current_thread()
    }

    /// Recursion depth held by the calling thread (0 if it is not the owner).
    pub fn lock_count(&self) -> u32 {
        self.data.lock_count()
    }

    /// Whether both handles refer to the same in-process mutex state.
    pub fn shares_state_with(&self, other: &NamedMutex) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Clone for NamedMutex {
    fn clone(&self) -> Self {
        self.data.header.inc_ref_count();
        Self {
            data: Arc::clone(&self.data),
            created: false,
        }
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        self.data.manager.release_header(&self.data.header);
    }
}

impl fmt::Debug for NamedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedMutex")
            .field("id", self.id())
            .field("strategy", &self.lock_strategy())
            .field("created", &self.created)
            .finish()
    }
}
