//! End-to-end tests: each spawns a real child process, traces it through
//! the full reactor, and inspects both the child's observed return value
//! and the actual state left on disk.
//!
//! These fork a genuine tracee per spec's scenarios in the testable-
//! properties section, rather than mocking the kernel boundary: the
//! whole point of this crate is what happens at that boundary.

use nix::sys::ptrace;
use nix::sys::signal::{raise, Signal};
use nix::unistd::{fork, ForkResult};
use pathwarden::event_loop;
use pathwarden::path::MAGIC_PREFIX;
use pathwarden::policy::PolicyState;
use std::ffi::CString;
use tempfile::tempdir;

/// Forks a tracee that calls `body` after stopping for setup, then exits
/// with whatever `i32` `body` returns. Runs the reactor on it with the
/// given policy and returns the reactor's own exit code (the tracee's
/// exit status).
fn run_sandboxed<F>(policy: PolicyState, body: F) -> i32
where
    F: FnOnce() -> i32,
{
    match unsafe { fork() }.expect("fork failed") {
        ForkResult::Child => {
            ptrace::traceme().expect("PTRACE_TRACEME failed");
            raise(Signal::SIGSTOP).expect("raise(SIGSTOP) failed");
            std::process::exit(body());
        }
        ForkResult::Parent { child } => event_loop::run(policy, child).expect("reactor failed"),
    }
}

fn raw_open_wronly_creat(path: &str) -> i32 {
    let c = CString::new(path).unwrap();
    let fd = unsafe { libc::open(c.as_ptr(), libc::O_WRONLY | libc::O_CREAT, 0o644) };
    if fd < 0 {
        unsafe { *libc::__errno_location() }
    } else {
        unsafe { libc::close(fd) };
        0
    }
}

fn raw_unlink(path: &str) -> i32 {
    let c = CString::new(path).unwrap();
    let ret = unsafe { libc::unlink(c.as_ptr()) };
    if ret < 0 {
        unsafe { *libc::__errno_location() }
    } else {
        0
    }
}

fn policy_with(write: Vec<&str>, predict: Vec<&str>, paranoid: bool, net: bool) -> PolicyState {
    PolicyState::new(
        write.into_iter().map(String::from).collect(),
        predict.into_iter().map(String::from).collect(),
        paranoid,
        net,
    )
    .expect("PolicyState::new failed")
}

#[test]
fn write_denial_blocks_outside_allowed_prefix() {
    let target_dir = tempdir().unwrap();
    let target = target_dir.path().join("denied-file");
    let policy = policy_with(vec!["/nonexistent-allow-list-entry"], vec![], false, false);

    let path = target.to_str().unwrap().to_string();
    let status = run_sandboxed(policy, move || raw_open_wronly_creat(&path));

    assert_eq!(status, libc::EPERM);
    assert!(!target.exists());
}

#[test]
fn write_allowed_inside_prefix_creates_file() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("allowed-file");
    let policy = policy_with(vec![dir.path().to_str().unwrap()], vec![], false, false);

    let path = target.to_str().unwrap().to_string();
    let status = run_sandboxed(policy, move || raw_open_wronly_creat(&path));

    assert_eq!(status, 0);
    assert!(target.exists());
}

#[test]
fn predict_only_unlink_fakes_success_without_touching_disk() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("predicted-file");
    std::fs::write(&target, b"keep me").unwrap();
    let policy = policy_with(vec![], vec![dir.path().to_str().unwrap()], false, false);

    let path = target.to_str().unwrap().to_string();
    let status = run_sandboxed(policy, move || raw_unlink(&path));

    assert_eq!(status, 0);
    assert!(target.exists(), "predict-only unlink must not actually remove the file");
}

#[test]
fn magic_addwrite_grants_access_for_the_rest_of_the_run() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("granted-via-magic");
    let policy = policy_with(vec![], vec![], false, false);

    let magic_path = format!("{}/write{}/", MAGIC_PREFIX, dir.path().to_str().unwrap());
    let target_path = target.to_str().unwrap().to_string();
    let status = run_sandboxed(policy, move || {
        let rc = raw_open_wronly_creat(&magic_path);
        if rc != 0 {
            return rc;
        }
        raw_open_wronly_creat(&target_path)
    });

    assert_eq!(status, 0);
    assert!(target.exists());
}

#[test]
fn lchown_on_symlink_is_denied_even_when_target_is_writable() {
    let allowed_dir = tempdir().unwrap();
    let outside_dir = tempdir().unwrap();
    let real = allowed_dir.path().join("real");
    std::fs::write(&real, b"x").unwrap();
    let link = outside_dir.path().join("link");
    std::os::unix::fs::symlink(&real, &link).unwrap();

    let policy = policy_with(vec![allowed_dir.path().to_str().unwrap()], vec![], false, false);
    let link_path = link.to_str().unwrap().to_string();
    let status = run_sandboxed(policy, move || {
        let c = CString::new(link_path).unwrap();
        let ret = unsafe { libc::lchown(c.as_ptr(), libc::getuid(), libc::getgid()) };
        if ret < 0 {
            unsafe { *libc::__errno_location() }
        } else {
            0
        }
    });

    assert_eq!(status, libc::EPERM);
}
