use nix::sys::ptrace;
use nix::sys::signal::{raise, Signal};
use nix::unistd::{execvp, fork, ForkResult};
use pathwarden::errors::SandboxError;
use pathwarden::{cli, config, event_loop, log, policy};
use std::ffi::CString;

fn spawn_and_traceme(command: &[String]) -> ! {
    ptrace::traceme().unwrap_or_else(|e| {
        eprintln!("pathwarden: PTRACE_TRACEME failed: {}", e);
        std::process::exit(127);
    });

    // Stop immediately so the parent's first wait sees an unambiguous
    // SIGSTOP (classified as SETUP) before any exec-related trap can
    // arrive, and can apply ptrace options while still pre-exec.
    raise(Signal::SIGSTOP).unwrap_or_else(|e| {
        eprintln!("pathwarden: raise(SIGSTOP) failed: {}", e);
        std::process::exit(127);
    });

    let prog = CString::new(command[0].as_str()).expect("command name contains a NUL byte");
    let args: Vec<CString> = command
        .iter()
        .map(|a| CString::new(a.as_str()).expect("argument contains a NUL byte"))
        .collect();

    // A successful execve never returns; its SIGTRAP stop is what the
    // parent's wait loop treats as SETUP for this pid.
    match execvp(&prog, &args) {
        Ok(_) => unreachable!(),
        Err(e) => {
            eprintln!("pathwarden: failed to exec {:?}: {}", command[0], e);
            std::process::exit(127);
        }
    }
}

fn run() -> Result<i32, SandboxError> {
    let opt = cli::Opt::parse();
    log::init(opt.verbosity, opt.quiet, opt.log_file.as_deref());

    let file_config = match &opt.config {
        Some(path) => Some(
            config::FileConfig::load(path)
                .map_err(|e| SandboxError::Fatal(format!("failed to load config {:?}: {}", path, e)))?,
        ),
        None => None,
    };
    let effective = config::EffectiveConfig::merge(&opt, file_config);

    let policy = policy::PolicyState::new(
        effective.write_prefixes,
        effective.predict_prefixes,
        effective.paranoid,
        effective.net,
    )
    .map_err(SandboxError::Errno)?;

    event_loop::install_signal_handler()?;

    let command = opt.command.clone();
    let child_pid = match unsafe { fork() }.map_err(|e| SandboxError::Fatal(format!("fork failed: {}", e)))? {
        ForkResult::Child => spawn_and_traceme(&command),
        ForkResult::Parent { child } => child,
    };

    event_loop::run(policy, child_pid)
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("pathwarden: {}", e);
            std::process::exit(if e.is_fatal() { 126 } else { 1 });
        }
    }
}
