// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// On-disk layout of shared files and lock files.
//
//   <temp>/.namedmutex[-uid<uid>]/shm/global/<name>
//   <temp>/.namedmutex[-uid<uid>]/shm/session<sid>/<name>
//   <temp>/.namedmutex[-uid<uid>]/lockfiles/global/<name>
//   <temp>/.namedmutex[-uid<uid>]/lockfiles/session<sid>/<name>

use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::error::{SharedMemoryError, SystemCallErrors};
use crate::platform;
use crate::resource_id::ResourceId;

pub const RUNTIME_DIR_NAME: &str = ".namedmutex";
pub const SHARED_FILES_DIR_NAME: &str = "shm";
pub const LOCK_FILES_DIR_NAME: &str = "lockfiles";
pub const GLOBAL_DIR_NAME: &str = "global";
pub const SESSION_DIR_PREFIX: &str = "session";

const ROOT_DIR_MODE: u32 = 0o1777;
const SCOPE_DIR_MODE: u32 = 0o777;
const FILE_MODE: u32 = 0o666;
const USER_DIR_MODE: u32 = 0o700;
const USER_FILE_MODE: u32 = 0o600;

/// Which of the two parallel trees a path lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Mapped files holding shared state.
    Shared,
    /// Empty companion files used only for `flock`.
    Lock,
}

impl FileKind {
    fn dir_name(self) -> &'static str {
        match self {
            FileKind::Shared => SHARED_FILES_DIR_NAME,
            FileKind::Lock => LOCK_FILES_DIR_NAME,
        }
    }
}

/// `<temp>/.namedmutex` or, for user-scoped ids, `<temp>/.namedmutex-uid<uid>`.
pub fn runtime_root(temp_dir: &Path, id: &ResourceId) -> PathBuf {
    if id.is_user_scope() {
        temp_dir.join(format!("{RUNTIME_DIR_NAME}-uid{}", id.user_scope_uid()))
    } else {
        temp_dir.join(RUNTIME_DIR_NAME)
    }
}

pub fn scope_dir_name(id: &ResourceId) -> String {
    if id.is_session_scope() {
        format!("{SESSION_DIR_PREFIX}{}", platform::session_id())
    } else {
        GLOBAL_DIR_NAME.to_string()
    }
}

pub fn scope_dir(temp_dir: &Path, id: &ResourceId, kind: FileKind) -> PathBuf {
    runtime_root(temp_dir, id)
        .join(kind.dir_name())
        .join(scope_dir_name(id))
}

pub fn file_path(temp_dir: &Path, id: &ResourceId, kind: FileKind) -> PathBuf {
    scope_dir(temp_dir, id, kind).join(id.name())
}

fn dir_mode(id: &ResourceId, is_root: bool) -> u32 {
    match (id.is_user_scope(), is_root) {
        (true, _) => USER_DIR_MODE,
        (false, true) => ROOT_DIR_MODE,
        (false, false) => SCOPE_DIR_MODE,
    }
}

pub fn file_mode(id: &ResourceId) -> u32 {
    if id.is_user_scope() {
        USER_FILE_MODE
    } else {
        FILE_MODE
    }
}

/// Create `<root>/<kind>/<scope>` and its parents as needed, returning the
/// scope directory.
pub fn ensure_scope_dir(
    temp_dir: &Path,
    id: &ResourceId,
    kind: FileKind,
    errors: &mut SystemCallErrors,
) -> Result<PathBuf, SharedMemoryError> {
    let root = runtime_root(temp_dir, id);
    ensure_directory(&root, id, dir_mode(id, true), errors)?;

    let kind_dir = root.join(kind.dir_name());
    ensure_directory(&kind_dir, id, dir_mode(id, true), errors)?;

    let scope = kind_dir.join(scope_dir_name(id));
    ensure_directory(&scope, id, dir_mode(id, false), errors)?;
    Ok(scope)
}

/// Create `path` with `mode`, or accept it if it already exists.
///
/// The mode is applied with an explicit chmod so the umask does not narrow
/// it. For user-scoped ids an existing directory must be owned by the user.
fn ensure_directory(
    path: &Path,
    id: &ResourceId,
    mode: u32,
    errors: &mut SystemCallErrors,
) -> Result<(), SharedMemoryError> {
    match DirBuilder::new().mode(mode).create(path) {
        Ok(()) => {
            if let Err(err) = fs::set_permissions(path, Permissions::from_mode(mode)) {
                errors.append("chmod", path.display(), &err);
                let _ = fs::remove_dir(path);
                return Err(SharedMemoryError::io_traced(
                    format!("failed to set permissions on {}", path.display()),
                    err,
                    errors,
                ));
            }
            tracing::debug!(path = %path.display(), mode = %format!("{mode:o}"), "Created directory");
            return Ok(());
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => {
            errors.append("mkdir", path.display(), &err);
            return Err(SharedMemoryError::io_traced(
                format!("failed to create directory {}", path.display()),
                err,
                errors,
            ));
        }
    }

    let meta = fs::symlink_metadata(path).map_err(|err| {
        errors.append("lstat", path.display(), &err);
        SharedMemoryError::io_traced(format!("failed to stat {}", path.display()), err, errors)
    })?;
    if !meta.is_dir() {
        return Err(SharedMemoryError::io_traced(
            format!("{} exists and is not a directory", path.display()),
            io::Error::from(io::ErrorKind::AlreadyExists),
            errors,
        ));
    }

    if id.is_user_scope() && meta.uid() != id.user_scope_uid() {
        return Err(SharedMemoryError::io_traced(
            format!(
                "{} is owned by uid {}, expected {}",
                path.display(),
                meta.uid(),
                id.user_scope_uid()
            ),
            io::Error::from(io::ErrorKind::PermissionDenied),
            errors,
        ));
    }

    if meta.mode() & 0o7777 != mode {
        // Only the owner may chmod; a shared directory created by another
        // user is used as is.
        if let Err(err) = fs::set_permissions(path, Permissions::from_mode(mode)) {
            if id.is_user_scope() {
                errors.append("chmod", path.display(), &err);
                return Err(SharedMemoryError::io_traced(
                    format!("failed to restrict permissions on {}", path.display()),
                    err,
                    errors,
                ));
            }
        }
    }
    Ok(())
}

/// Open `path` read/write, optionally creating it exclusively.
///
/// With `create_new`, fails with `AlreadyExists` if another process won the
/// race, so the caller can fall back to opening it.
pub fn open_file(path: &Path, id: &ResourceId, create_new: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    if create_new {
        options.create_new(true).mode(file_mode(id));
    }
    let file = options.open(path)?;
    if create_new {
        file.set_permissions(Permissions::from_mode(file_mode(id)))?;
    }
    Ok(file)
}

/// Open the lock file for `id`, creating it if missing.
pub fn open_or_create_lock_file(
    temp_dir: &Path,
    id: &ResourceId,
    errors: &mut SystemCallErrors,
) -> Result<File, SharedMemoryError> {
    ensure_scope_dir(temp_dir, id, FileKind::Lock, errors)?;
    let path = file_path(temp_dir, id, FileKind::Lock);
    loop {
        match open_file(&path, id, false) {
            Ok(file) => return Ok(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                errors.append("open", path.display(), &err);
            }
            Err(err) => {
                errors.append("open", path.display(), &err);
                return Err(SharedMemoryError::io_traced(
                    format!("failed to open lock file {}", path.display()),
                    err,
                    errors,
                ));
            }
        }
        match open_file(&path, id, true) {
            Ok(file) => return Ok(file),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                errors.append("open(O_CREAT|O_EXCL)", path.display(), &err);
            }
            Err(err) => {
                errors.append("open(O_CREAT|O_EXCL)", path.display(), &err);
                return Err(SharedMemoryError::io_traced(
                    format!("failed to create lock file {}", path.display()),
                    err,
                    errors,
                ));
            }
        }
    }
}

/// Delete the shared file and lock file of `id`, then the session
/// directories if they became empty. Failures are logged and ignored.
pub fn remove_files(temp_dir: &Path, id: &ResourceId) {
    for kind in [FileKind::Shared, FileKind::Lock] {
        let path = file_path(temp_dir, id, kind);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "Failed to delete file")
            }
        }
    }

    if !id.is_session_scope() {
        return;
    }
    for kind in [FileKind::Shared, FileKind::Lock] {
        let dir = scope_dir(temp_dir, id, kind);
        if let Err(err) = fs::remove_dir(&dir) {
            // Another name still lives in this session, or the tree was never
            // created for this kind.
            let expected = matches!(
                err.raw_os_error(),
                Some(libc::ENOTEMPTY) | Some(libc::EEXIST) | Some(libc::ENOENT)
            );
            if !expected {
                tracing::warn!(error = %err, path = %dir.display(), "Failed to remove session directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_paths() {
        let id = ResourceId::new("Global\\foo", false).unwrap();
        let temp = Path::new("/tmp/x");
        assert_eq!(
            file_path(temp, &id, FileKind::Shared),
            Path::new("/tmp/x/.namedmutex/shm/global/foo")
        );
        assert_eq!(
            file_path(temp, &id, FileKind::Lock),
            Path::new("/tmp/x/.namedmutex/lockfiles/global/foo")
        );
    }

    #[test]
    fn session_paths_include_session_id() {
        let id = ResourceId::new("foo", false).unwrap();
        let path = file_path(Path::new("/t"), &id, FileKind::Shared);
        let expected = format!("/t/.namedmutex/shm/session{}/foo", platform::session_id());
        assert_eq!(path, PathBuf::from(expected));
    }

    #[test]
    fn user_scope_gets_own_root() {
        let id = ResourceId::new("Global\\foo", true).unwrap();
        let root = runtime_root(Path::new("/t"), &id);
        assert_eq!(
            root,
            PathBuf::from(format!("/t/.namedmutex-uid{}", id.user_scope_uid()))
        );
    }

    #[test]
    fn ensure_scope_dir_is_idempotent_and_sets_modes() {
        let temp = tempfile::tempdir().unwrap();
        let id = ResourceId::new("Global\\foo", false).unwrap();
        let mut errors = SystemCallErrors::new(true);

        let dir = ensure_scope_dir(temp.path(), &id, FileKind::Shared, &mut errors).unwrap();
        let again = ensure_scope_dir(temp.path(), &id, FileKind::Shared, &mut errors).unwrap();
        assert_eq!(dir, again);

        let root_mode = fs::metadata(runtime_root(temp.path(), &id)).unwrap().mode() & 0o7777;
        assert_eq!(root_mode, ROOT_DIR_MODE);
        let scope_mode = fs::metadata(&dir).unwrap().mode() & 0o7777;
        assert_eq!(scope_mode, SCOPE_DIR_MODE);
    }

    #[test]
    fn user_scope_dirs_are_private() {
        let temp = tempfile::tempdir().unwrap();
        let id = ResourceId::new("Global\\foo", true).unwrap();
        let mut errors = SystemCallErrors::new(false);
        let dir = ensure_scope_dir(temp.path(), &id, FileKind::Lock, &mut errors).unwrap();
        assert_eq!(fs::metadata(dir).unwrap().mode() & 0o7777, USER_DIR_MODE);
    }

    #[test]
    fn file_in_place_of_directory_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let id = ResourceId::new("Global\\foo", false).unwrap();
        fs::write(runtime_root(temp.path(), &id), b"not a dir").unwrap();
        let mut errors = SystemCallErrors::new(false);
        assert!(matches!(
            ensure_scope_dir(temp.path(), &id, FileKind::Shared, &mut errors),
            Err(SharedMemoryError::Io { .. })
        ));
    }

    #[test]
    fn remove_files_keeps_global_dirs_and_drops_empty_session_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let mut errors = SystemCallErrors::new(false);

        let global = ResourceId::new("Global\\g", false).unwrap();
        let session = ResourceId::new("s", false).unwrap();
        for id in [&global, &session] {
            let _ = open_or_create_lock_file(temp.path(), id, &mut errors).unwrap();
            ensure_scope_dir(temp.path(), id, FileKind::Shared, &mut errors).unwrap();
            open_file(&file_path(temp.path(), id, FileKind::Shared), id, true).unwrap();
        }

        remove_files(temp.path(), &global);
        assert!(!file_path(temp.path(), &global, FileKind::Shared).exists());
        assert!(!file_path(temp.path(), &global, FileKind::Lock).exists());
        assert!(scope_dir(temp.path(), &global, FileKind::Shared).is_dir());

        remove_files(temp.path(), &session);
        assert!(!scope_dir(temp.path(), &session, FileKind::Shared).exists());
        assert!(!scope_dir(temp.path(), &session, FileKind::Lock).exists());
        assert!(runtime_root(temp.path(), &session).join(SHARED_FILES_DIR_NAME).is_dir());
    }
}
