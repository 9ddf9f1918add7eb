//! Command-line surface: the sandbox is invoked as
//! `pathwarden [OPTIONS] -- <command> [ARGS...]`.

use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pathwarden",
    about = "Runs a command under a ptrace-based filesystem and network sandbox."
)]
pub struct Opt {
    /// Paths (or prefixes) the sandboxed command may write to. May be
    /// given multiple times.
    #[structopt(short = "w", long = "write", number_of_values = 1)]
    pub write_prefixes: Vec<PathBuf>,

    /// Paths (or prefixes) whose writes are silently discarded rather
    /// than denied outright. May be given multiple times.
    #[structopt(short = "p", long = "predict", number_of_values = 1)]
    pub predict_prefixes: Vec<PathBuf>,

    /// Re-resolve every path argument to its canonical form before
    /// letting the call through, closing the TOCTOU window a symlink
    /// swap could otherwise open.
    #[structopt(long)]
    pub paranoid: bool,

    /// Allow the sandboxed command to create sockets. Disabled by
    /// default.
    #[structopt(long)]
    pub net: bool,

    /// Load additional configuration (prefixes, flags) from a file,
    /// merged under the command-line flags above.
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// Write logs to this file instead of stderr.
    #[structopt(long = "log-file", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    pub verbosity: u32,

    /// Suppress all logging except fatal errors.
    #[structopt(short = "q", long = "quiet")]
    pub quiet: bool,

    /// The command to sandbox, and its arguments.
    #[structopt(required = true)]
    pub command: Vec<String>,
}

impl Opt {
    pub fn parse() -> Opt {
        Opt::from_args()
    }
}
