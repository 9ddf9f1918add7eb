//! The reactor: a single-threaded wait/classify/decide/resume cycle over
//! every live tracee. Owns no locking, because there's nothing shared
//! across threads to lock.

use crate::arch::ArchBackend;
use crate::decision::{self, EntryOutcome};
use crate::errors::{Result, SandboxError};
use crate::policy::PolicyState;
use crate::syscalls;
use crate::log::LogLevel::{LogDebug, LogNotice, LogWarn};
use crate::tracee::{self, StopEvent, TraceeTable, DENIED_SYSCALL};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{SigHandler, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn mark_interrupted(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Installs a `SIGINT` handler that flags the reactor to detach every
/// tracee and exit on its next loop iteration, rather than dying with
/// tracees left frozen mid-syscall.
pub fn install_signal_handler() -> Result<()> {
    unsafe { nix::sys::signal::signal(Signal::SIGINT, SigHandler::Handler(mark_interrupted)) }
        .map_err(|e| SandboxError::Fatal(format!("failed to install SIGINT handler: {}", e)))?;
    Ok(())
}

fn apply_ptrace_options(pid: Pid) -> Result<()> {
    let opts = ptrace::Options::PTRACE_O_TRACESYSGOOD
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEEXEC;
    ptrace::setoptions(pid, opts).map_err(|e| SandboxError::from_nix(pid, e))
}

fn resume_to_syscall(pid: Pid) -> Result<()> {
    ptrace::syscall(pid, None).map_err(|e| SandboxError::from_nix(pid, e))
}

fn resume_delivering(pid: Pid, sig: Signal) -> Result<()> {
    ptrace::syscall(pid, Some(sig)).map_err(|e| SandboxError::from_nix(pid, e))
}

/// Handles one SYSCALL stop: entry-side decision or exit-side
/// deny-restoration/chdir bookkeeping, then toggles the tracee's
/// in-syscall flag. `before_initial_execve` is a sandbox-wide (not
/// per-tracee) flag: the very first execve observed — the sandboxed
/// command's own startup exec — never clears a tracee's magic-command
/// eligibility, but every execve after that does, for whichever tracee
/// calls it.
fn handle_syscall_stop(
    backend: &dyn ArchBackend,
    table: &mut TraceeTable,
    pid: Pid,
    before_initial_execve: &mut bool,
) -> Result<()> {
    let no = backend.get_syscall(pid)?;
    let tracee = table.get_mut(pid).ok_or(SandboxError::TraceeVanished(pid))?;

    if !tracee.in_syscall() {
        if syscalls::is_execve(no) {
            if *before_initial_execve {
                *before_initial_execve = false;
            } else if tracee.hasmagic {
                crate::log!(LogDebug, "pid {} exec'd past its first execve, disabling magic commands", pid);
                tracee.hasmagic = false;
            }
        }

        match decision::evaluate_entry(backend, tracee, pid, no)? {
            EntryOutcome::Allow => {}
            EntryOutcome::Deny { retval } => {
                crate::log!(LogDebug, "pid {} denied syscall {} (retval {})", pid, no, retval);
                tracee.saved_sno = no;
                tracee.saved_retval = retval;
                backend.set_syscall(pid, DENIED_SYSCALL)?;
            }
        }
    } else if no == DENIED_SYSCALL {
        backend.set_syscall(pid, tracee.saved_sno)?;
        backend.set_return(pid, tracee.saved_retval)?;
    } else if syscalls::is_chdir(no) {
        decision::refresh_cwd_after_chdir(backend, tracee, pid)?;
    }

    tracee.toggle_in_syscall();
    resume_to_syscall(pid)
}

fn wait_for_event(ignore_echild: bool) -> Result<Option<(Pid, i32)>> {
    let mut status: i32 = 0;
    let waited = unsafe { libc::waitpid(-1, &mut status, 0) };
    if waited == -1 {
        let errno = Errno::last();
        if ignore_echild && errno == Errno::ECHILD {
            return Ok(None);
        }
        return Err(SandboxError::Errno(errno));
    }
    Ok(Some((Pid::from_raw(waited), status)))
}

/// Runs the reactor to completion, starting from a freshly-spawned and
/// stopped `root_pid`. Returns the process exit code to propagate:
/// the eldest tracee's own exit status, or 128+signal if it was killed.
pub fn run(policy: PolicyState, root_pid: Pid) -> Result<i32> {
    let backend = crate::arch::native_backend();
    let mut table = TraceeTable::new();
    table.insert_root(root_pid, &policy);

    let mut eldest_status: Option<i32> = None;
    let mut before_initial_execve = true;

    loop {
        if table.is_empty() {
            break;
        }
        if INTERRUPTED.load(Ordering::SeqCst) {
            crate::log!(LogNotice, "interrupted, detaching all tracees");
            shutdown(&table);
            break;
        }

        let (pid, status) = match wait_for_event(true)? {
            Some(pair) => pair,
            None => break,
        };
        let record_exists = table.get(pid).is_some();
        let event = tracee::classify(status, record_exists);

        match event {
            StopEvent::SetupPremature => {
                table.insert_premature(pid, &policy);
                apply_ptrace_options(pid)?;
                if let Some(t) = table.get_mut(pid) {
                    t.mark_setup_done();
                }
                resume_to_syscall(pid)?;
            }
            StopEvent::Setup => {
                apply_ptrace_options(pid)?;
                if let Some(t) = table.get_mut(pid) {
                    t.mark_setup_done();
                }
                resume_to_syscall(pid)?;
            }
            StopEvent::Syscall => {
                if let Err(e) = handle_syscall_stop(&*backend, &mut table, pid, &mut before_initial_execve) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    // Errno/TraceeVanished are recoverable at the call site: the
                    // tracee's own register/memory I/O just failed or it's gone,
                    // so drop its record and keep tracing everyone else.
                    crate::log!(LogWarn, "pid {} dropped after syscall-stop error: {}", pid, e);
                    table.remove(pid);
                }
            }
            StopEvent::Fork => {
                if let Ok(new_raw) = ptrace::getevent(pid) {
                    let child_pid = Pid::from_raw(new_raw as i32);
                    table.link_child(child_pid, pid);
                }
                resume_to_syscall(pid)?;
            }
            StopEvent::Execv => {
                resume_to_syscall(pid)?;
            }
            StopEvent::Genuine(sig) => {
                crate::log!(LogNotice, "pid {} received signal {:?}", pid, sig);
                resume_delivering(pid, sig)?;
            }
            StopEvent::Exit(code) => {
                crate::log!(LogNotice, "pid {} exited with status {}", pid, code);
                let was_eldest = table.is_eldest(pid);
                table.remove(pid);
                if was_eldest {
                    eldest_status = Some(code);
                }
            }
            StopEvent::ExitSignal(sig) => {
                crate::log!(LogWarn, "pid {} killed by signal {:?}", pid, sig);
                let was_eldest = table.is_eldest(pid);
                table.remove(pid);
                if was_eldest {
                    eldest_status = Some(128 + sig as i32);
                }
            }
            StopEvent::Unknown => {
                return Err(SandboxError::Fatal(format!("unrecognized wait status {:#x} for pid {}", status, pid)));
            }
        }
    }

    Ok(eldest_status.unwrap_or(0))
}

/// Best-effort detach of every live tracee, for SIGINT/shutdown. If a
/// detach comes back `ESRCH` (the tracee is stopped in a state ptrace
/// won't release cleanly) falls back to a plain `SIGKILL` rather than
/// leaving it frozen.
pub fn shutdown(table: &TraceeTable) {
    for pid in table.pids() {
        match ptrace::detach(pid, None) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
            }
            Err(e) => crate::log!(LogWarn, "failed to detach pid {}: {}", pid, e),
        }
    }
}
