// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

#[cfg(unix)]
pub mod posix;

// Re-export the platform-specific implementations under a uniform name.

#[cfg(unix)]
pub use posix::{
    current_process_id, current_thread_id, lock_file, session_id, unlock_file, FileLockGuard,
    FileLockKind, SharedMapping,
};
