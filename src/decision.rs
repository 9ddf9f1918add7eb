//! The syscall decision engine: given a stopped tracee at syscall entry,
//! decide whether the call proceeds, is denied with a synthetic errno,
//! or is quietly turned into a no-op success. This is the policy core;
//! everything here is architecture-neutral and goes through
//! [`ArchBackend`] for register/memory access.

use crate::arch::{ArchBackend, SupportedArch};
use crate::errors::{Result, SandboxError};
use crate::path::{self, MagicCommand};
use crate::policy;
use crate::syscalls::{self, ModeCheck, PathArg, PathCheck, SyscallRule};
use crate::tracee::Tracee;
use nix::unistd::Pid;

/// What syscall entry evaluation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Allow,
    /// Deny the call; `retval` is what the tracee should see as its
    /// return value (a negative errno, or 0 for a quietly-faked success).
    Deny { retval: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeResult {
    Write,
    NoWrite,
    Creat,
}

enum PathOutcome {
    Allow,
    /// Path argument was rewritten to `/dev/null` and the call should
    /// proceed (predict-only access to an fd-returning call).
    AllowRedirected,
    DenyErrno(i32),
    /// Predict-only access to a non-fd call: fake a successful no-op.
    DenySuccess,
}

fn path_arg_index(arg: PathArg) -> usize {
    match arg {
        PathArg::Plain(i) => i,
        PathArg::At { path_idx, .. } => path_idx,
    }
}

/// Reads the path argument named by `arg`, resolving an `*at` dirfd
/// against `/proc/<pid>/fd/<n>` when the path itself is relative and
/// the dirfd isn't `AT_FDCWD`.
fn read_raw_path(
    backend: &dyn ArchBackend,
    pid: Pid,
    pers: SupportedArch,
    arg: PathArg,
    already_read: Option<&str>,
) -> Result<Option<String>> {
    match arg {
        PathArg::Plain(i) => match already_read {
            Some(p) => Ok(Some(p.to_string())),
            None => backend.get_path(pid, pers, i),
        },
        PathArg::At { dirfd_idx, path_idx } => {
            let raw = match already_read {
                Some(p) => p.to_string(),
                None => match backend.get_path(pid, pers, path_idx)? {
                    Some(p) => p,
                    None => return Ok(None),
                },
            };
            if raw.starts_with('/') {
                return Ok(Some(raw));
            }
            let dirfd = backend.get_arg(pid, pers, dirfd_idx)? as i64 as i32;
            if dirfd == libc::AT_FDCWD {
                return Ok(Some(raw));
            }
            let link = format!("/proc/{}/fd/{}", pid, dirfd);
            let dir = std::fs::read_link(&link)
                .map_err(|_| SandboxError::Fatal(format!("failed to resolve dirfd via {}", link)))?;
            Ok(Some(format!("{}/{}", dir.to_string_lossy(), raw)))
        }
    }
}

fn check_mode(
    backend: &dyn ArchBackend,
    pid: Pid,
    pers: SupportedArch,
    mode: ModeCheck,
) -> Result<ModeResult> {
    match mode {
        ModeCheck::Access(i) => {
            let m = backend.get_arg(pid, pers, i)? as i32;
            Ok(if m & libc::W_OK != 0 { ModeResult::Write } else { ModeResult::NoWrite })
        }
        ModeCheck::Open(i) => {
            let m = backend.get_arg(pid, pers, i)? as i32;
            Ok(if m & libc::O_CREAT != 0 {
                ModeResult::Creat
            } else if m & libc::O_WRONLY != 0 || m & libc::O_RDWR != 0 {
                ModeResult::Write
            } else {
                ModeResult::NoWrite
            })
        }
    }
}

fn write_cstr(backend: &dyn ArchBackend, pid: Pid, pers: SupportedArch, arg: usize, s: &str) -> Result<()> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    backend.set_path(pid, pers, arg, &bytes)
}

fn evaluate_path_check(
    backend: &dyn ArchBackend,
    tracee: &Tracee,
    pid: Pid,
    pers: SupportedArch,
    check: &PathCheck,
    mode_result: Option<ModeResult>,
    returns_fd: bool,
    already_read: Option<&str>,
) -> Result<PathOutcome> {
    let raw = match read_raw_path(backend, pid, pers, check.arg, already_read)? {
        Some(p) => p,
        None => return Ok(PathOutcome::Allow),
    };
    let absolute = if raw.starts_with('/') {
        raw
    } else {
        format!("{}/{}", tracee.cwd, raw)
    };

    let can_create = check.can_create || matches!(mode_result, Some(ModeResult::Creat));
    let mode = if can_create { path::Mode::AllButLast } else { path::Mode::Existing };

    let resolved = match path::canonicalize(&absolute, mode, check.resolve_symlinks, &tracee.cwd) {
        Ok(r) => r,
        Err(e) => return Ok(PathOutcome::DenyErrno(e as i32)),
    };

    let allow_write = path::pathlist_check(&tracee.write_prefixes, &resolved);
    let allow_predict = path::pathlist_check(&tracee.predict_prefixes, &resolved);

    if !allow_write && !allow_predict {
        return Ok(PathOutcome::DenyErrno(libc::EPERM));
    }
    if !allow_write && allow_predict {
        return if returns_fd {
            write_cstr(backend, pid, pers, path_arg_index(check.arg), "/dev/null")?;
            Ok(PathOutcome::AllowRedirected)
        } else {
            Ok(PathOutcome::DenySuccess)
        };
    }

    if tracee.paranoid && check.resolve_symlinks {
        write_cstr(backend, pid, pers, path_arg_index(check.arg), &resolved)?;
    }

    Ok(PathOutcome::Allow)
}

/// Applies a magic `write`/`predict`/`rmwrite`/`rmpredict` command found
/// in `open`'s path argument, if any, and rewrites the path to
/// `/dev/null` so the real syscall becomes an inert no-op read.
fn handle_magic_open(
    tracee: &mut Tracee,
    backend: &dyn ArchBackend,
    pid: Pid,
    pers: SupportedArch,
    path: &str,
) -> Result<Option<EntryOutcome>> {
    let cmd = match path::parse_magic_command(path) {
        Some(c) => c,
        None => return Ok(None),
    };
    if tracee.locked {
        write_cstr(backend, pid, pers, 0, "/dev/null")?;
        return Ok(Some(EntryOutcome::Allow));
    }
    match cmd {
        MagicCommand::AddWrite(p) => {
            // Canonicalization failures fall back to a literal push so a
            // magic addwrite command never silently loses the grant.
            if policy::add_prefix(&mut tracee.write_prefixes, &p, &tracee.cwd).is_err() {
                tracee.write_prefixes.push(p);
            }
        }
        MagicCommand::AddPredict(p) => {
            if policy::add_prefix(&mut tracee.predict_prefixes, &p, &tracee.cwd).is_err() {
                tracee.predict_prefixes.push(p);
            }
        }
        MagicCommand::RemoveWrite(p) => policy::remove_prefix(&mut tracee.write_prefixes, &p, &tracee.cwd),
        MagicCommand::RemovePredict(p) => policy::remove_prefix(&mut tracee.predict_prefixes, &p, &tracee.cwd),
    }
    write_cstr(backend, pid, pers, 0, "/dev/null")?;
    Ok(Some(EntryOutcome::Allow))
}

/// The full entry-side decision for one syscall-entry stop: magic
/// commands, mode short-circuits, path checks in the rule's order, and
/// the net-call gate, mirroring the dispatcher's early-return-on-deny
/// shape (a denial on the first path check skips any remaining ones;
/// an allow falls through to the next).
pub fn evaluate_entry(
    backend: &dyn ArchBackend,
    tracee: &mut Tracee,
    pid: Pid,
    no: i64,
) -> Result<EntryOutcome> {
    let pers = backend.personality(pid)?;
    let rule: &SyscallRule = match syscalls::rule_for(no) {
        Some(r) => r,
        None => return Ok(EntryOutcome::Allow),
    };

    // Read once, for the call's own sake, if `open`'s path argument turns
    // out not to be a magic command: re-used below instead of letting
    // `evaluate_path_check` read it a second time from the tracee.
    let mut already_read_path: Option<String> = None;

    if tracee.hasmagic {
        if rule.magic_open {
            if let Some(path) = backend.get_path(pid, pers, 0)? {
                if let Some(outcome) = handle_magic_open(tracee, backend, pid, pers, &path)? {
                    return Ok(outcome);
                }
                already_read_path = Some(path);
            }
        } else if rule.magic_stat {
            if let Some(path) = backend.get_path(pid, pers, 0)? {
                if path::is_magic_dir(&path) {
                    write_cstr(backend, pid, pers, 0, "/dev/null")?;
                    return Ok(EntryOutcome::Allow);
                }
            }
        }
    }

    let mode_result = match rule.mode {
        Some(m) => Some(check_mode(backend, pid, pers, m)?),
        None => None,
    };
    if matches!(mode_result, Some(ModeResult::NoWrite)) {
        return Ok(EntryOutcome::Allow);
    }

    for check in &rule.paths {
        let reuse = already_read_path
            .as_deref()
            .filter(|_| path_arg_index(check.arg) == 0);
        match evaluate_path_check(backend, tracee, pid, pers, check, mode_result, rule.returns_fd, reuse)? {
            PathOutcome::Allow | PathOutcome::AllowRedirected => continue,
            PathOutcome::DenyErrno(e) => return Ok(EntryOutcome::Deny { retval: -(e as i64) }),
            PathOutcome::DenySuccess => return Ok(EntryOutcome::Deny { retval: 0 }),
        }
    }

    if rule.net_call && !tracee.net_allowed {
        return Ok(EntryOutcome::Deny { retval: -(libc::EACCES as i64) });
    }

    Ok(EntryOutcome::Allow)
}

/// After a successful `chdir`/`fchdir` exit, refreshes the tracee's
/// recorded cwd from `/proc/<pid>/cwd` rather than trying to reconstruct
/// it from the syscall argument (which may have been a plain fd).
pub fn refresh_cwd_after_chdir(backend: &dyn ArchBackend, tracee: &mut Tracee, pid: Pid) -> Result<()> {
    let retval = backend.get_return(pid)?;
    if retval != 0 {
        return Ok(());
    }
    let link = format!("/proc/{}/cwd", pid);
    let cwd = std::fs::read_link(&link)
        .map_err(|_| SandboxError::Fatal(format!("failed to read cwd via {}", link)))?;
    tracee.cwd = cwd.to_string_lossy().into_owned();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyState;
    use crate::tracee::Tracee;

    fn tracee_with(write: &[&str], predict: &[&str]) -> Tracee {
        let policy = PolicyState::for_test();
        let mut t = Tracee::new_root(Pid::from_raw(1), &policy);
        t.write_prefixes = write.iter().map(|s| s.to_string()).collect();
        t.predict_prefixes = predict.iter().map(|s| s.to_string()).collect();
        t
    }

    #[test]
    fn path_arg_index_picks_the_path_not_the_dirfd() {
        assert_eq!(path_arg_index(PathArg::At { dirfd_idx: 0, path_idx: 1 }), 1);
        assert_eq!(path_arg_index(PathArg::Plain(2)), 2);
    }

    #[test]
    fn no_rule_means_allow() {
        let t = tracee_with(&[], &[]);
        assert_eq!(t.write_prefixes.len(), 0);
        assert!(syscalls::rule_for(0xffffff).is_none());
    }
}
