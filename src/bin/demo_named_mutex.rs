// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   demo_named_mutex hold <name> [--abandon]
//   demo_named_mutex try <name> <timeout_ms>
//
// `hold` acquires the mutex, prints the outcome, and keeps it until a line
// (or EOF) arrives on stdin. With --abandon it exits right after acquiring,
// leaving the mutex abandoned for the next process.
//
// `try` makes one timed acquisition attempt and prints `acquired`,
// `abandoned` or `timeout`.
//
// NAMED_MUTEX_TEMP_DIR / NAMED_MUTEX_LOCK_STRATEGY select the runtime root
// and lock strategy; NAMED_MUTEX_DEBUG_LOG=1 turns on debug logging (stderr).

use std::env;
use std::io::{self, BufRead, Write};
use std::process;

use named_mutex::{MutexAttributes, MutexTryAcquireLockResult, NamedMutex};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let debug_enabled = env::var("NAMED_MUTEX_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn outcome(result: MutexTryAcquireLockResult) -> &'static str {
    match result {
        MutexTryAcquireLockResult::AcquiredLock => "acquired",
        MutexTryAcquireLockResult::AcquiredLockButAbandoned => "abandoned",
        MutexTryAcquireLockResult::TimedOut => "timeout",
    }
}

fn report(line: &str) {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn open(name: &str) -> NamedMutex {
    match NamedMutex::create(name, MutexAttributes::default(), false) {
        Ok(mutex) => mutex,
        Err(err) => {
            eprintln!("failed to open {name}: {err}");
            process::exit(2);
        }
    }
}

fn do_hold(name: &str, abandon: bool) {
    let mutex = open(name);
    let result = match mutex.lock() {
        Ok(result) => result,
        Err(err) => {
            eprintln!("lock failed: {err}");
            process::exit(2);
        }
    };
    report(outcome(result));

    if abandon {
        // Skip every destructor, as a crash would.
        unsafe { libc::_exit(0) };
    }

    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);

    if let Err(err) = mutex.release_lock() {
        eprintln!("release failed: {err}");
        process::exit(2);
    }
    report("released");
}

fn do_try(name: &str, timeout_ms: u32) {
    let mutex = open(name);
    match mutex.try_acquire_lock(timeout_ms) {
        Ok(result) => {
            report(outcome(result));
            if result.is_acquired() {
                let _ = mutex.release_lock();
            }
        }
        Err(err) => {
            eprintln!("acquire failed: {err}");
            process::exit(2);
        }
    }
}

fn usage() -> ! {
    eprintln!("usage: demo_named_mutex hold <name> [--abandon]");
    eprintln!("       demo_named_mutex try <name> <timeout_ms>");
    process::exit(1);
}

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage();
    }

    match args[1].as_str() {
        "hold" => do_hold(&args[2], args.get(3).is_some_and(|a| a == "--abandon")),
        "try" => {
            let Some(timeout_ms) = args.get(3).and_then(|t| t.parse().ok()) else {
                usage();
            };
            do_try(&args[2], timeout_ms);
        }
        other => {
            eprintln!("unknown mode: {other}");
            usage();
        }
    }
}
