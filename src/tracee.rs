//! Per-tracee records and the table that owns them, plus the wait-status
//! classifier that turns a raw `waitpid` status into the small event
//! alphabet the event loop drives off of.

use crate::policy::PolicyState;
use bitflags::bitflags;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::convert::TryFrom;

bitflags! {
    pub struct TraceeFlags: u32 {
        /// Freshly spawned; initial ptrace options not yet applied.
        const NEEDSETUP = 1 << 0;
        /// Currently between syscall-entry and syscall-exit stops.
        const INSYSCALL = 1 << 1;
    }
}

/// Sentinel syscall number written over a denied call. The kernel rejects
/// it with ENOSYS without side effects; restored at the matching exit stop.
pub const DENIED_SYSCALL: i64 = 0xbadca11;

pub struct Tracee {
    pub pid: Pid,
    pub flags: TraceeFlags,
    /// Original syscall number, valid only while a denial is in flight
    /// (i.e. between the deny decision and the matching exit stop).
    pub saved_sno: i64,
    /// Errno (negative) to inject at syscall-exit when denying.
    pub saved_retval: i64,
    pub cwd: String,
    /// Whether this tracee may still use the magic-path control channel.
    /// Cleared permanently after its first execve past the initial one.
    pub hasmagic: bool,
    pub write_prefixes: Vec<String>,
    pub predict_prefixes: Vec<String>,
    pub paranoid: bool,
    pub net_allowed: bool,
    pub locked: bool,
}

impl Tracee {
    /// A brand-new root tracee, seeded from process-wide policy defaults.
    pub fn new_root(pid: Pid, policy: &PolicyState) -> Tracee {
        Tracee {
            pid,
            flags: TraceeFlags::NEEDSETUP,
            saved_sno: DENIED_SYSCALL,
            saved_retval: -1,
            cwd: policy.cwd.clone(),
            hasmagic: true,
            write_prefixes: policy.write_prefixes.clone(),
            predict_prefixes: policy.predict_prefixes.clone(),
            paranoid: policy.paranoid,
            net_allowed: policy.net_allowed,
            locked: false,
        }
    }

    /// A not-yet-linked placeholder for a tracee whose SIGSTOP arrived
    /// before its parent's fork event was processed (the SETUP_PREMATURE
    /// race): fields are neutral until [`TraceeTable::link_child`] corrects
    /// them from the real parent.
    fn blank(pid: Pid) -> Tracee {
        Tracee {
            pid,
            flags: TraceeFlags::NEEDSETUP,
            saved_sno: DENIED_SYSCALL,
            saved_retval: -1,
            cwd: String::new(),
            hasmagic: false,
            write_prefixes: Vec::new(),
            predict_prefixes: Vec::new(),
            paranoid: false,
            net_allowed: false,
            locked: false,
        }
    }

    pub fn in_syscall(&self) -> bool {
        self.flags.contains(TraceeFlags::INSYSCALL)
    }

    pub fn toggle_in_syscall(&mut self) {
        self.flags.toggle(TraceeFlags::INSYSCALL);
    }

    pub fn needs_setup(&self) -> bool {
        self.flags.contains(TraceeFlags::NEEDSETUP)
    }

    pub fn mark_setup_done(&mut self) {
        self.flags.remove(TraceeFlags::NEEDSETUP);
    }
}

/// Keyed collection of live tracees. Insertion at head with inheritance is
/// modeled as a hash map keyed by pid, per the design note preferring an
/// explicit parent-pid lookup over the "next node is the parent"
/// linked-list coincidence.
#[derive(Default)]
pub struct TraceeTable {
    tasks: HashMap<i32, Tracee>,
    pub eldest: Option<Pid>,
}

impl TraceeTable {
    pub fn new() -> TraceeTable {
        TraceeTable { tasks: HashMap::new(), eldest: None }
    }

    pub fn insert_root(&mut self, pid: Pid, policy: &PolicyState) -> &mut Tracee {
        let tracee = Tracee::new_root(pid, policy);
        self.eldest = Some(pid);
        self.tasks.entry(pid.as_raw()).or_insert(tracee)
    }

    /// Registers a tracee whose SIGSTOP was observed before its parent's
    /// fork event: seeded from process-wide policy defaults and *not*
    /// marked eldest, since a premature child is by definition not the
    /// root tracee. Corrected to the real parent's state once the
    /// matching Fork event identifies it, via [`Self::link_child`].
    pub fn insert_premature(&mut self, pid: Pid, policy: &PolicyState) -> &mut Tracee {
        let tracee = Tracee::new_root(pid, policy);
        self.tasks.entry(pid.as_raw()).or_insert(tracee)
    }

    /// Records that `child_pid` is `parent_pid`'s new fork/vfork/clone
    /// child, inheriting cwd/prefix lists/flags from the parent's current
    /// state. If `child_pid` already has a placeholder record (it hit the
    /// SETUP_PREMATURE race and was seeded from policy defaults via
    /// [`Self::insert_premature`]), this corrects it in place rather than
    /// creating a second record or leaving the premature guess standing.
    pub fn link_child(&mut self, child_pid: Pid, parent_pid: Pid) {
        let parent = match self.tasks.get(&parent_pid.as_raw()) {
            Some(p) => p,
            None => return,
        };
        let cwd = parent.cwd.clone();
        let hasmagic = parent.hasmagic;
        let write_prefixes = parent.write_prefixes.clone();
        let predict_prefixes = parent.predict_prefixes.clone();
        let paranoid = parent.paranoid;
        let net_allowed = parent.net_allowed;
        let locked = parent.locked;

        let child = self.tasks.entry(child_pid.as_raw()).or_insert_with(|| Tracee::blank(child_pid));
        child.cwd = cwd;
        child.hasmagic = hasmagic;
        child.write_prefixes = write_prefixes;
        child.predict_prefixes = predict_prefixes;
        child.paranoid = paranoid;
        child.net_allowed = net_allowed;
        child.locked = locked;
    }

    pub fn get(&self, pid: Pid) -> Option<&Tracee> {
        self.tasks.get(&pid.as_raw())
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Tracee> {
        self.tasks.get_mut(&pid.as_raw())
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Tracee> {
        self.tasks.remove(&pid.as_raw())
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.tasks.keys().map(|&raw| Pid::from_raw(raw)).collect()
    }

    pub fn is_eldest(&self, pid: Pid) -> bool {
        self.eldest == Some(pid)
    }
}

/// The event alphabet a raw wait status is classified into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopEvent {
    Setup,
    SetupPremature,
    Syscall,
    Fork,
    Execv,
    Genuine(Signal),
    Exit(i32),
    ExitSignal(Signal),
    Unknown,
}

const PTRACE_EVENT_FORK: i32 = 1;
const PTRACE_EVENT_VFORK: i32 = 2;
const PTRACE_EVENT_CLONE: i32 = 3;
const PTRACE_EVENT_EXEC: i32 = 4;

fn wifexited(status: i32) -> bool {
    (status & 0x7f) == 0
}
fn wexitstatus(status: i32) -> i32 {
    (status >> 8) & 0xff
}
fn wifsignaled(status: i32) -> bool {
    ((status & 0x7f) + 1) as i8 >> 1 > 0
}
fn wtermsig(status: i32) -> i32 {
    status & 0x7f
}
fn wifstopped(status: i32) -> bool {
    (status & 0xff) == 0x7f
}
fn wstopsig(status: i32) -> i32 {
    (status >> 8) & 0xff
}

/// Classifies a raw `waitpid` status, per spec §6's bit patterns, without
/// going through a higher-level wrapper: the encoding is simple enough
/// (and load-bearing enough) to want direct control over it here.
/// `record_exists` tells it whether the tracee table already has a record
/// for this pid, to distinguish SETUP from SETUP_PREMATURE.
pub fn classify(status: i32, record_exists: bool) -> StopEvent {
    if wifexited(status) {
        return StopEvent::Exit(wexitstatus(status));
    }
    if wifsignaled(status) {
        return match Signal::try_from(wtermsig(status)) {
            Ok(sig) => StopEvent::ExitSignal(sig),
            Err(_) => StopEvent::Unknown,
        };
    }
    if wifstopped(status) {
        let stopsig = wstopsig(status);
        if stopsig == Signal::SIGSTOP as i32 {
            return if record_exists {
                StopEvent::Setup
            } else {
                StopEvent::SetupPremature
            };
        }
        if stopsig == (Signal::SIGTRAP as i32 | 0x80) {
            return StopEvent::Syscall;
        }
        if stopsig == Signal::SIGTRAP as i32 {
            return match (status >> 16) & 0xffff {
                PTRACE_EVENT_FORK | PTRACE_EVENT_VFORK | PTRACE_EVENT_CLONE => StopEvent::Fork,
                PTRACE_EVENT_EXEC => StopEvent::Execv,
                _ => StopEvent::Genuine(Signal::SIGTRAP),
            };
        }
        return match Signal::try_from(stopsig) {
            Ok(sig) => StopEvent::Genuine(sig),
            Err(_) => StopEvent::Unknown,
        };
    }
    StopEvent::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped(sig: i32) -> i32 {
        0x7f | (sig << 8)
    }

    #[test]
    fn sigstop_with_no_record_is_setup_premature() {
        assert_eq!(classify(stopped(Signal::SIGSTOP as i32), false), StopEvent::SetupPremature);
    }

    #[test]
    fn sigstop_with_record_is_setup() {
        assert_eq!(classify(stopped(Signal::SIGSTOP as i32), true), StopEvent::Setup);
    }

    #[test]
    fn sigtrap_0x80_is_syscall() {
        let status = 0x7f | ((Signal::SIGTRAP as i32 | 0x80) << 8);
        assert_eq!(classify(status, true), StopEvent::Syscall);
    }

    #[test]
    fn fork_event_is_recognized() {
        let status = stopped(Signal::SIGTRAP as i32) | (PTRACE_EVENT_FORK << 16);
        assert_eq!(classify(status, true), StopEvent::Fork);
    }

    #[test]
    fn exec_event_is_recognized() {
        let status = stopped(Signal::SIGTRAP as i32) | (PTRACE_EVENT_EXEC << 16);
        assert_eq!(classify(status, true), StopEvent::Execv);
    }

    #[test]
    fn other_signal_is_genuine() {
        assert_eq!(classify(stopped(Signal::SIGUSR1 as i32), true), StopEvent::Genuine(Signal::SIGUSR1));
    }

    #[test]
    fn exited_is_exit() {
        let status = (42 << 8) | 0;
        assert_eq!(classify(status, true), StopEvent::Exit(42));
    }

    #[test]
    fn table_insert_and_remove_round_trips() {
        let policy = PolicyState::for_test();
        let mut table = TraceeTable::new();
        let pid = Pid::from_raw(100);
        table.insert_root(pid, &policy);
        assert!(table.get(pid).is_some());
        assert!(table.is_eldest(pid));
        table.remove(pid);
        assert!(table.get(pid).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn child_inherits_parent_policy_state() {
        let mut policy = PolicyState::for_test();
        policy.write_prefixes.push("/tmp".to_string());
        policy.paranoid = true;
        let mut table = TraceeTable::new();
        let parent_pid = Pid::from_raw(1);
        let child_pid = Pid::from_raw(2);
        table.insert_root(parent_pid, &policy);
        table.link_child(child_pid, parent_pid);

        let parent = table.get(parent_pid).unwrap();
        let child = table.get(child_pid).unwrap();
        assert_eq!(child.write_prefixes, parent.write_prefixes);
        assert_eq!(child.predict_prefixes, parent.predict_prefixes);
        assert_eq!(child.cwd, parent.cwd);
        assert_eq!(child.paranoid, parent.paranoid);
        assert_eq!(child.net_allowed, parent.net_allowed);
        assert!(!table.is_eldest(child_pid));
    }

    #[test]
    fn premature_child_is_corrected_once_linked_to_its_parent() {
        let mut policy = PolicyState::for_test();
        policy.write_prefixes.push("/global-default".to_string());
        let mut table = TraceeTable::new();
        let parent_pid = Pid::from_raw(1);
        let child_pid = Pid::from_raw(2);

        // The child's SIGSTOP is observed before the parent's Fork event,
        // so it's seeded from policy defaults and not yet linked.
        table.insert_premature(child_pid, &policy);
        assert!(!table.is_eldest(child_pid));
        assert_eq!(table.get(child_pid).unwrap().write_prefixes, vec!["/global-default".to_string()]);

        // The parent picks up a magic write grant the premature child
        // should never have seen, since it forked before the grant.
        table.insert_root(parent_pid, &policy);
        table.get_mut(parent_pid).unwrap().write_prefixes.push("/granted-after-fork".to_string());

        table.link_child(child_pid, parent_pid);
        let parent = table.get(parent_pid).unwrap();
        let child = table.get(child_pid).unwrap();
        assert_eq!(child.write_prefixes, parent.write_prefixes);
        assert!(!table.is_eldest(child_pid));
    }
}
