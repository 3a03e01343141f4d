// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error types for shared memory files and named mutexes.

use std::fmt;
use std::io;

use thiserror::Error;

/// Failures while naming, creating, opening or mapping a shared file.
#[derive(Debug, Error)]
pub enum SharedMemoryError {
    #[error("name is empty")]
    NameEmpty,

    #[error("name is longer than {max} bytes")]
    NameTooLong { max: usize },

    #[error("name {0:?} is not a valid file name")]
    NameInvalid(String),

    /// The file exists and is in use, but does not hold the expected payload.
    #[error("shared file header does not match the expected type or version")]
    HeaderMismatch,

    #[error("out of memory while mapping shared file")]
    OutOfMemory,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl SharedMemoryError {
    /// Wrap an OS error, folding `ENOMEM` into [`SharedMemoryError::OutOfMemory`].
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        #[cfg(unix)]
        if source.raw_os_error() == Some(libc::ENOMEM) {
            return Self::OutOfMemory;
        }
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Like [`SharedMemoryError::io`], appending the collected syscall trail.
    pub(crate) fn io_traced(
        context: impl Into<String>,
        source: io::Error,
        errors: &SystemCallErrors,
    ) -> Self {
        let mut context = context.into();
        if !errors.is_empty() {
            context.push_str(" (");
            context.push_str(&errors.to_string());
            context.push(')');
        }
        Self::io(context, source)
    }
}

/// Misuse of a named mutex by the calling thread.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NamedMutexError {
    #[error("maximum number of recursive locks reached")]
    MaximumRecursiveLocksReached,

    #[error("calling thread does not own the mutex")]
    ThreadHasNotAcquiredMutex,

    #[error("unexpected failure in the underlying lock primitive")]
    Unknown,
}

/// Top-level error returned by the public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    SharedMemory(#[from] SharedMemoryError),

    #[error(transparent)]
    NamedMutex(#[from] NamedMutexError),

    #[error("named mutex {0:?} does not exist")]
    NotFound(String),

    #[error("invalid handle {0}")]
    InvalidHandle(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Trail of failed system calls seen while creating or opening a shared file.
///
/// Only filled in when `Config::trace_system_calls` is set; the trail is
/// appended to the final I/O error so a failure after several retries can be
/// diagnosed from the message alone.
#[derive(Debug, Default)]
pub struct SystemCallErrors {
    enabled: bool,
    entries: Vec<String>,
}

impl SystemCallErrors {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Record one failed call, e.g. `append("open", path, &err)`.
    pub fn append(&mut self, call: &str, target: impl fmt::Display, err: &io::Error) {
        if !self.enabled {
            return;
        }
        self.entries.push(match err.raw_os_error() {
            Some(errno) => format!("{call}(\"{target}\") == -1; errno == {errno}"),
            None => format!("{call}(\"{target}\") failed: {err}"),
        });
    }
}

impl fmt::Display for SystemCallErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entries.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_collector_records_nothing() {
        let mut errors = SystemCallErrors::new(false);
        errors.append("open", "/tmp/x", &io::Error::from_raw_os_error(2));
        assert!(errors.is_empty());
    }

    #[test]
    fn traced_io_error_carries_trail() {
        let mut errors = SystemCallErrors::new(true);
        errors.append("open", "/tmp/x", &io::Error::from_raw_os_error(2));
        errors.append("open", "/tmp/y", &io::Error::from_raw_os_error(13));
        assert_eq!(errors.len(), 2);

        let err = SharedMemoryError::io_traced(
            "failed to open shared file",
            io::Error::from_raw_os_error(13),
            &errors,
        );
        let msg = err.to_string();
        assert!(msg.contains("open(\"/tmp/x\") == -1; errno == 2"));
        assert!(msg.contains("/tmp/y"));
    }

    #[cfg(unix)]
    #[test]
    fn enomem_maps_to_out_of_memory() {
        let err = SharedMemoryError::io("mmap", io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(matches!(err, SharedMemoryError::OutOfMemory));
    }

    #[test]
    fn named_mutex_error_converts() {
        let err: Error = NamedMutexError::ThreadHasNotAcquiredMutex.into();
        assert!(matches!(
            err,
            Error::NamedMutex(NamedMutexError::ThreadHasNotAcquiredMutex)
        ));
    }
}
