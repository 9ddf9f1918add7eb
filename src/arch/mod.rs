//! Per-architecture back-end: the only layer that touches raw ptrace
//! registers and tracee memory. Everything above `decision`/`event_loop`
//! is architecture-neutral and goes through the [`ArchBackend`] trait.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "powerpc64")]
pub mod powerpc;

use crate::errors::Result;
use nix::unistd::Pid;

/// The number of argument registers a syscall can carry on any supported
/// architecture.
pub const MAX_ARGS: usize = 6;

/// The syscall ABI in effect for a given tracee. `personality(pid)` is
/// the only operation that produces this; everything else takes it as
/// input so a single-ABI architecture can hardcode `SupportedArch::Native`
/// without ever calling `personality`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SupportedArch {
    /// 32-bit / compatibility-mode ABI (x86 on an x86_64 kernel).
    X86,
    /// The architecture's native (64-bit, where applicable) ABI.
    X64,
}

/// Uniform interface over the kernel's debugging API for a stopped
/// tracee. Given a pid known to be in a stopped state:
pub trait ArchBackend {
    /// 0 (`X86`) or 1 (`X64`) selecting the argument-register layout.
    /// Single-ABI architectures always return `X64`.
    fn personality(&self, pid: Pid) -> Result<SupportedArch>;
    fn get_syscall(&self, pid: Pid) -> Result<i64>;
    fn set_syscall(&self, pid: Pid, no: i64) -> Result<()>;
    fn get_return(&self, pid: Pid) -> Result<i64>;
    fn set_return(&self, pid: Pid, val: i64) -> Result<()>;
    fn get_arg(&self, pid: Pid, pers: SupportedArch, i: usize) -> Result<u64>;
    /// Reads a NUL-terminated C string pointed to by argument `i`. `None`
    /// means the argument is a null pointer.
    fn get_path(&self, pid: Pid, pers: SupportedArch, i: usize) -> Result<Option<String>>;
    /// Writes `bytes` (including any trailing NUL the caller wants
    /// present) into the tracee's memory at argument `i`, merging the
    /// final partial word with what's already there so adjacent memory
    /// isn't clobbered.
    fn set_path(&self, pid: Pid, pers: SupportedArch, i: usize, bytes: &[u8]) -> Result<()>;
    /// Writes a zeroed `stat` buffer to the address in argument 1, with
    /// `st_mode` set to `S_IFDIR` (see DESIGN.md for why this crate picks
    /// one mode across architectures instead of varying it per arch).
    fn fake_stat(&self, pid: Pid, pers: SupportedArch) -> Result<()>;
}

#[cfg(target_arch = "x86_64")]
pub fn native_backend() -> Box<dyn ArchBackend> {
    Box::new(x86_64::X86_64Backend)
}

#[cfg(target_arch = "powerpc64")]
pub fn native_backend() -> Box<dyn ArchBackend> {
    Box::new(powerpc::PowerPcBackend)
}
