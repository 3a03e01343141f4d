// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Parsing and validation of named resource identifiers.
// `Global\name` is visible system-wide, `Local\name` and bare names are
// visible within the caller's session.

use std::fmt;

use crate::error::SharedMemoryError;

/// Longest accepted name, in bytes. Names become file names, so this is
/// the usual `NAME_MAX`.
pub const MAX_NAME_CHAR_COUNT: usize = 255;

pub const GLOBAL_PREFIX: &str = "Global\\";
pub const LOCAL_PREFIX: &str = "Local\\";

/// Identity of a named resource: its bare name plus the scope it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    name: String,
    is_session_scope: bool,
    is_user_scope: bool,
    user_scope_uid: u32,
}

impl ResourceId {
    /// Parse `name`, stripping a `Global\` or `Local\` prefix.
    ///
    /// With `is_user_scope` the resource is additionally restricted to the
    /// current effective user.
    pub fn new(name: &str, is_user_scope: bool) -> Result<Self, SharedMemoryError> {
        let (is_session_scope, bare) = if let Some(rest) = name.strip_prefix(GLOBAL_PREFIX) {
            (false, rest)
        } else if let Some(rest) = name.strip_prefix(LOCAL_PREFIX) {
            (true, rest)
        } else {
            (true, name)
        };

        validate(bare)?;

        Ok(Self {
            name: bare.to_string(),
            is_session_scope,
            is_user_scope,
            user_scope_uid: if is_user_scope { current_uid() } else { 0 },
        })
    }

    /// The name without its scope prefix; also the file name on disk.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_len(&self) -> usize {
        self.name.len()
    }

    pub fn is_session_scope(&self) -> bool {
        self.is_session_scope
    }

    pub fn is_user_scope(&self) -> bool {
        self.is_user_scope
    }

    /// Owner uid for user-scoped ids, 0 otherwise.
    pub fn user_scope_uid(&self) -> u32 {
        self.user_scope_uid
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_session_scope {
            LOCAL_PREFIX
        } else {
            GLOBAL_PREFIX
        };
        write!(f, "{prefix}{}", self.name)
    }
}

fn validate(name: &str) -> Result<(), SharedMemoryError> {
    if name.is_empty() {
        return Err(SharedMemoryError::NameEmpty);
    }
    if name.len() > MAX_NAME_CHAR_COUNT {
        return Err(SharedMemoryError::NameTooLong {
            max: MAX_NAME_CHAR_COUNT,
        });
    }
    if name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(SharedMemoryError::NameInvalid(name.to_string()));
    }
    Ok(())
}

#[cfg(unix)]
fn current_uid() -> u32 {
    unsafe { libc::geteuid() as u32 }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}
