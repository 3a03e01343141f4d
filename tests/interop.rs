// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Multi-process tests: this test process and `demo_named_mutex` children
// share one runtime root and contend for the same names.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use named_mutex::{
    Config, LockStrategy, MutexAttributes, MutexTryAcquireLockResult, NamedMutex,
    SharedMemoryManager,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("Global\\{prefix}_{}_{n}", std::process::id())
}

fn strategies() -> Vec<LockStrategy> {
    let mut all = vec![LockStrategy::FileLock];
    if LockStrategy::robust_supported() {
        all.push(LockStrategy::Robust);
    }
    all
}

fn strategy_env(strategy: LockStrategy) -> &'static str {
    match strategy {
        LockStrategy::Robust => "robust",
        LockStrategy::FileLock => "file",
    }
}

fn manager(root: &Path, strategy: LockStrategy) -> Arc<SharedMemoryManager> {
    SharedMemoryManager::new(
        Config::default()
            .with_runtime_temp_dir(root)
            .with_lock_strategy(strategy),
    )
}

fn demo(root: &Path, strategy: LockStrategy, args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_demo_named_mutex"));
    cmd.args(args)
        .env("NAMED_MUTEX_TEMP_DIR", root)
        .env("NAMED_MUTEX_LOCK_STRATEGY", strategy_env(strategy))
        .env_remove("NAMED_MUTEX_DEBUG_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    cmd
}

/// A `hold` child, with the lines it has printed available one at a time.
struct Holder {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl Holder {
    fn spawn(root: &Path, strategy: LockStrategy, name: &str, extra: &[&str]) -> Self {
        let mut args = vec!["hold", name];
        args.extend_from_slice(extra);
        let mut child = demo(root, strategy, &args)
            .stdin(Stdio::piped())
            .spawn()
            .expect("spawn demo_named_mutex");
        let stdin = child.stdin.take();
        let stdout = BufReader::new(child.stdout.take().expect("child stdout"));
        Self {
            child,
            stdin,
            stdout,
        }
    }

    fn next_line(&mut self) -> String {
        let mut line = String::new();
        self.stdout.read_line(&mut line).expect("read child stdout");
        line.trim().to_string()
    }

    fn release(mut self) -> String {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = writeln!(stdin);
        }
        let line = self.next_line();
        let status = self.child.wait().expect("wait child");
        assert!(status.success(), "holder exited with {status}");
        line
    }

    fn kill(mut self) {
        self.child.kill().expect("kill child");
        let _ = self.child.wait();
    }
}

fn try_in_child(root: &Path, strategy: LockStrategy, name: &str, timeout_ms: u32) -> String {
    let timeout = timeout_ms.to_string();
    let output = demo(root, strategy, &["try", name, &timeout])
        .output()
        .expect("run demo_named_mutex");
    assert!(output.status.success(), "try exited with {}", output.status);
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[test]
fn child_holds_parent_waits() {
    for strategy in strategies() {
        let temp = tempfile::tempdir().unwrap();
        let m = manager(temp.path(), strategy);
        let name = unique_name("child_holds");
        let mtx = NamedMutex::create_in(&m, &name, MutexAttributes::default(), false).unwrap();

        let mut holder = Holder::spawn(temp.path(), strategy, &name, &[]);
        assert_eq!(holder.next_line(), "acquired");

        assert_eq!(
            mtx.try_acquire_lock(100).unwrap(),
            MutexTryAcquireLockResult::TimedOut,
            "{strategy:?}"
        );

        assert_eq!(holder.release(), "released");
        assert_eq!(
            mtx.try_acquire_lock(1_000).unwrap(),
            MutexTryAcquireLockResult::AcquiredLock,
            "{strategy:?}"
        );
        mtx.release_lock().unwrap();
    }
}

#[test]
fn parent_holds_child_times_out() {
    for strategy in strategies() {
        let temp = tempfile::tempdir().unwrap();
        let m = manager(temp.path(), strategy);
        let name = unique_name("parent_holds");
        let mtx = NamedMutex::create_in(&m, &name, MutexAttributes::default(), true).unwrap();
        assert!(mtx.is_locked_by_current_thread());

        assert_eq!(try_in_child(temp.path(), strategy, &name, 0), "timeout");
        assert_eq!(try_in_child(temp.path(), strategy, &name, 50), "timeout");

        mtx.release_lock().unwrap();
        assert_eq!(try_in_child(temp.path(), strategy, &name, 0), "acquired");
    }
}

#[test]
fn killed_owner_is_reported_as_abandoned() {
    for strategy in strategies() {
        let temp = tempfile::tempdir().unwrap();
        let m = manager(temp.path(), strategy);
        let name = unique_name("killed");
        // Stay attached so the shared state outlives the child.
        let mtx = NamedMutex::create_in(&m, &name, MutexAttributes::default(), false).unwrap();

        let mut holder = Holder::spawn(temp.path(), strategy, &name, &[]);
        assert_eq!(holder.next_line(), "acquired");
        holder.kill();

        assert_eq!(
            mtx.try_acquire_lock(2_000).unwrap(),
            MutexTryAcquireLockResult::AcquiredLockButAbandoned,
            "{strategy:?}"
        );
        mtx.release_lock().unwrap();
        assert_eq!(
            mtx.try_acquire_lock(0).unwrap(),
            MutexTryAcquireLockResult::AcquiredLock,
            "{strategy:?}: abandonment reported twice"
        );
        mtx.release_lock().unwrap();
    }
}

#[test]
fn exiting_owner_abandons_to_next_child() {
    for strategy in strategies() {
        let temp = tempfile::tempdir().unwrap();
        let m = manager(temp.path(), strategy);
        let name = unique_name("exit_abandon");
        let _attached =
            NamedMutex::create_in(&m, &name, MutexAttributes::default(), false).unwrap();

        let mut holder = Holder::spawn(temp.path(), strategy, &name, &["--abandon"]);
        assert_eq!(holder.next_line(), "acquired");
        let status = holder.child.wait().unwrap();
        assert!(status.success());

        assert_eq!(try_in_child(temp.path(), strategy, &name, 2_000), "abandoned");
        assert_eq!(try_in_child(temp.path(), strategy, &name, 0), "acquired");
    }
}

#[test]
fn files_removed_after_every_process_detaches() {
    for strategy in strategies() {
        let temp = tempfile::tempdir().unwrap();
        let name = unique_name("cleanup");

        assert_eq!(try_in_child(temp.path(), strategy, &name, 0), "acquired");

        let id = named_mutex::ResourceId::new(&name, false).unwrap();
        let shared = named_mutex::paths::file_path(
            temp.path(),
            &id,
            named_mutex::paths::FileKind::Shared,
        );
        assert!(!shared.exists(), "{strategy:?}: {} left behind", shared.display());
    }
}
