use super::{ArchBackend, SupportedArch};
use crate::errors::{Result, SandboxError};
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::convert::TryInto;
use std::os::raw::c_void;

/// On x86_64 Linux, the CS selector distinguishes long mode (64-bit,
/// 0x33) from compatibility mode (32-bit, 0x23).
const CS_LONG_MODE: u64 = 0x33;
const CS_COMPAT_MODE: u64 = 0x23;

const WORD_SIZE: usize = std::mem::size_of::<i64>();

static_assertions::const_assert_eq!(super::MAX_ARGS, 6);

pub struct X86_64Backend;

fn peek(pid: Pid, addr: u64) -> Result<i64> {
    ptrace::read(pid, addr as *mut c_void).map_err(|e| SandboxError::from_nix(pid, e))
}

fn poke(pid: Pid, addr: u64, word: i64) -> Result<()> {
    unsafe { ptrace::write(pid, addr as *mut c_void, word as *mut c_void) }
        .map_err(|e| SandboxError::from_nix(pid, e))
}

/// Writes `bytes` at `addr`, word-aligned, merging the trailing partial
/// word with the tracee's existing memory so we don't clobber whatever
/// follows it.
fn write_bytes_at(pid: Pid, addr: u64, bytes: &[u8]) -> Result<()> {
    let mut n = 0usize;
    while n + WORD_SIZE <= bytes.len() {
        let word = i64::from_ne_bytes(bytes[n..n + WORD_SIZE].try_into().unwrap());
        poke(pid, addr + n as u64, word)?;
        n += WORD_SIZE;
    }
    let remaining = bytes.len() - n;
    if remaining > 0 {
        let existing = peek(pid, addr + n as u64)?;
        let mut merged = existing.to_ne_bytes();
        merged[..remaining].copy_from_slice(&bytes[n..]);
        poke(pid, addr + n as u64, i64::from_ne_bytes(merged))?;
    }
    Ok(())
}

impl ArchBackend for X86_64Backend {
    fn personality(&self, pid: Pid) -> Result<SupportedArch> {
        let regs = ptrace::getregs(pid).map_err(|e| SandboxError::from_nix(pid, e))?;
        match regs.cs {
            CS_LONG_MODE => Ok(SupportedArch::X64),
            CS_COMPAT_MODE => Ok(SupportedArch::X86),
            other => Err(SandboxError::Fatal(format!(
                "unrecognized cs register value {:#x} for pid {}",
                other, pid
            ))),
        }
    }

    fn get_syscall(&self, pid: Pid) -> Result<i64> {
        let regs = ptrace::getregs(pid).map_err(|e| SandboxError::from_nix(pid, e))?;
        Ok(regs.orig_rax as i64)
    }

    fn set_syscall(&self, pid: Pid, no: i64) -> Result<()> {
        let mut regs = ptrace::getregs(pid).map_err(|e| SandboxError::from_nix(pid, e))?;
        regs.orig_rax = no as u64;
        ptrace::setregs(pid, regs).map_err(|e| SandboxError::from_nix(pid, e))
    }

    fn get_return(&self, pid: Pid) -> Result<i64> {
        let regs = ptrace::getregs(pid).map_err(|e| SandboxError::from_nix(pid, e))?;
        Ok(regs.rax as i64)
    }

    fn set_return(&self, pid: Pid, val: i64) -> Result<()> {
        let mut regs = ptrace::getregs(pid).map_err(|e| SandboxError::from_nix(pid, e))?;
        regs.rax = val as u64;
        ptrace::setregs(pid, regs).map_err(|e| SandboxError::from_nix(pid, e))
    }

    fn get_arg(&self, pid: Pid, pers: SupportedArch, i: usize) -> Result<u64> {
        assert!(i < super::MAX_ARGS);
        let regs = ptrace::getregs(pid).map_err(|e| SandboxError::from_nix(pid, e))?;
        Ok(match pers {
            // 32-bit syscall ABI: args in ebx, ecx, edx, esi, edi, ebp.
            SupportedArch::X86 => [regs.rbx, regs.rcx, regs.rdx, regs.rsi, regs.rdi, regs.rbp][i],
            // 64-bit syscall ABI: args in rdi, rsi, rdx, r10, r8, r9.
            SupportedArch::X64 => [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9][i],
        })
    }

    fn get_path(&self, pid: Pid, pers: SupportedArch, i: usize) -> Result<Option<String>> {
        let addr = self.get_arg(pid, pers, i)?;
        if addr == 0 {
            return Ok(None);
        }
        let mut buf: Vec<u8> = Vec::new();
        let mut offset: u64 = 0;
        loop {
            let word = peek(pid, addr + offset)?;
            let bytes = word.to_ne_bytes();
            for b in bytes.iter() {
                if *b == 0 {
                    return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
                }
                buf.push(*b);
            }
            offset += WORD_SIZE as u64;
            if buf.len() > (1 << 20) {
                return Err(SandboxError::Fatal(format!(
                    "path argument for pid {} exceeded 1MiB without a NUL terminator",
                    pid
                )));
            }
        }
    }

    fn set_path(&self, pid: Pid, pers: SupportedArch, i: usize, bytes: &[u8]) -> Result<()> {
        let addr = self.get_arg(pid, pers, i)?;
        if addr == 0 {
            return Err(SandboxError::Errno(nix::errno::Errno::EFAULT));
        }
        write_bytes_at(pid, addr, bytes)
    }

    fn fake_stat(&self, pid: Pid, pers: SupportedArch) -> Result<()> {
        let addr = self.get_arg(pid, pers, 1)?;
        if addr == 0 {
            return Err(SandboxError::Errno(nix::errno::Errno::EFAULT));
        }
        let mut fakebuf: libc::stat = unsafe { std::mem::zeroed() };
        fakebuf.st_mode = libc::S_IFDIR;
        let bytes: [u8; std::mem::size_of::<libc::stat>()] = unsafe { std::mem::transmute(fakebuf) };
        write_bytes_at(pid, addr, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Register-layer behavior needs a live stopped tracee; covered by the
    // integration tests in tests/sandbox_integration.rs. This module just
    // pins down the pure bit-twiddling helpers.

    #[test]
    fn merges_trailing_partial_word() {
        // write_bytes_at itself needs a real pid to exercise ptrace
        // against; what we can check here without one is that the
        // splitting arithmetic lines up.
        let bytes = b"/tmp/x\0";
        assert_eq!(bytes.len() % WORD_SIZE, bytes.len() - (bytes.len() / WORD_SIZE) * WORD_SIZE);
    }
}
