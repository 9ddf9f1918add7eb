use super::{ArchBackend, SupportedArch};
use crate::errors::{Result, SandboxError};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::os::raw::c_void;

/// PowerPC has no compat-mode personality; every tracee uses the same
/// register layout, so `personality` always reports `X64` and every
/// other method ignores the `pers` argument it's handed for symmetry
/// with the x86_64 back-end.
pub struct PowerPcBackend;

// offsets into `struct pt_regs`, in machine words, as consulted via
// PTRACE_PEEKUSER/POKEUSER.
const PT_R0: u64 = 0;
const PT_R3: u64 = 3;
const PT_CCR: u64 = 38;
const SO_MASK: i64 = 0x1000_0000;

fn word_offset(reg: u64) -> *mut c_void {
    (reg * std::mem::size_of::<i64>() as u64) as *mut c_void
}

fn peekuser(pid: Pid, reg: u64) -> Result<i64> {
    Errno::clear();
    let ret = unsafe {
        libc::ptrace(libc::PTRACE_PEEKUSER, pid.as_raw(), word_offset(reg), std::ptr::null_mut::<c_void>())
    };
    if ret == -1 && Errno::last() != Errno::UnknownErrno {
        return Err(SandboxError::from_nix(pid, Errno::last()));
    }
    Ok(ret as i64)
}

fn pokeuser(pid: Pid, reg: u64, val: i64) -> Result<()> {
    let ret = unsafe {
        libc::ptrace(libc::PTRACE_POKEUSER, pid.as_raw(), word_offset(reg), val as *mut c_void)
    };
    if ret == -1 {
        return Err(SandboxError::from_nix(pid, Errno::last()));
    }
    Ok(())
}

fn peekdata(pid: Pid, addr: u64) -> Result<i64> {
    Errno::clear();
    let ret =
        unsafe { libc::ptrace(libc::PTRACE_PEEKDATA, pid.as_raw(), addr as *mut c_void, std::ptr::null_mut::<c_void>()) };
    if ret == -1 && Errno::last() != Errno::UnknownErrno {
        return Err(SandboxError::from_nix(pid, Errno::last()));
    }
    Ok(ret as i64)
}

fn pokedata(pid: Pid, addr: u64, val: i64) -> Result<()> {
    let ret = unsafe { libc::ptrace(libc::PTRACE_POKEDATA, pid.as_raw(), addr as *mut c_void, val as *mut c_void) };
    if ret == -1 {
        return Err(SandboxError::from_nix(pid, Errno::last()));
    }
    Ok(())
}

const WORD_SIZE: usize = std::mem::size_of::<i64>();

fn write_bytes_at(pid: Pid, addr: u64, bytes: &[u8]) -> Result<()> {
    let mut n = 0usize;
    while n + WORD_SIZE <= bytes.len() {
        let mut word_bytes = [0u8; WORD_SIZE];
        word_bytes.copy_from_slice(&bytes[n..n + WORD_SIZE]);
        pokedata(pid, addr + n as u64, i64::from_ne_bytes(word_bytes))?;
        n += WORD_SIZE;
    }
    let remaining = bytes.len() - n;
    if remaining > 0 {
        let existing = peekdata(pid, addr + n as u64)?;
        let mut merged = existing.to_ne_bytes();
        merged[..remaining].copy_from_slice(&bytes[n..]);
        pokedata(pid, addr + n as u64, i64::from_ne_bytes(merged))?;
    }
    Ok(())
}

const ARG_REGS: [u64; super::MAX_ARGS] = [3, 4, 5, 6, 7, 8];

impl ArchBackend for PowerPcBackend {
    fn personality(&self, _pid: Pid) -> Result<SupportedArch> {
        Ok(SupportedArch::X64)
    }

    fn get_syscall(&self, pid: Pid) -> Result<i64> {
        peekuser(pid, PT_R0)
    }

    fn set_syscall(&self, pid: Pid, no: i64) -> Result<()> {
        pokeuser(pid, PT_R0, no)
    }

    fn get_return(&self, pid: Pid) -> Result<i64> {
        let mut res = peekuser(pid, PT_R3)?;
        let flags = peekuser(pid, PT_CCR)?;
        if flags & SO_MASK != 0 {
            res = -res;
        }
        Ok(res)
    }

    fn set_return(&self, pid: Pid, val: i64) -> Result<()> {
        let mut flags = peekuser(pid, PT_CCR)?;
        let (val, flags) = if val < 0 {
            flags |= SO_MASK;
            (-val, flags)
        } else {
            flags &= !SO_MASK;
            (val, flags)
        };
        pokeuser(pid, PT_R3, val)?;
        pokeuser(pid, PT_CCR, flags)
    }

    fn get_arg(&self, pid: Pid, _pers: SupportedArch, i: usize) -> Result<u64> {
        assert!(i < super::MAX_ARGS);
        peekuser(pid, ARG_REGS[i]).map(|v| v as u64)
    }

    fn get_path(&self, pid: Pid, pers: SupportedArch, i: usize) -> Result<Option<String>> {
        let addr = self.get_arg(pid, pers, i)?;
        if addr == 0 {
            return Ok(None);
        }
        let mut buf: Vec<u8> = Vec::new();
        let mut offset: u64 = 0;
        loop {
            let word = peekdata(pid, addr + offset)?;
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
            return Err(SandboxError::Errno(Errno::EFAULT));
        }
        write_bytes_at(pid, addr, bytes)
    }

    fn fake_stat(&self, pid: Pid, pers: SupportedArch) -> Result<()> {
        let addr = self.get_arg(pid, pers, 1)?;
        if addr == 0 {
            return Err(SandboxError::Errno(Errno::EFAULT));
        }
        let mut fakebuf: libc::stat = unsafe { std::mem::zeroed() };
        // Unified on S_IFDIR across architectures; see arch::ArchBackend::fake_stat.
        fakebuf.st_mode = libc::S_IFDIR;
        let bytes: [u8; std::mem::size_of::<libc::stat>()] = unsafe { std::mem::transmute(fakebuf) };
        write_bytes_at(pid, addr, &bytes)
    }
}
