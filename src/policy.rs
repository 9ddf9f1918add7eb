//! Process-wide policy state: the sandbox's own cwd, the write/predict
//! prefix lists, the paranoid/net-allowed flags, and the identity of the
//! eldest (root) tracee.
//!
//! This is consulted, not owned, by each `Tracee` — every tracee record
//! carries its own copy of the mutable fields (inherited at fork time),
//! while `PolicyState` supplies the *initial* values at startup.

use crate::path;
use nix::errno::Errno;
use nix::unistd::Pid;

pub struct PolicyState {
    /// The sandbox process's own cwd, captured once at startup. Distinct
    /// from any tracee's cwd.
    pub cwd: String,
    pub write_prefixes: Vec<String>,
    pub predict_prefixes: Vec<String>,
    pub paranoid: bool,
    pub net_allowed: bool,
    pub eldest: Option<Pid>,
}

impl PolicyState {
    pub fn new(
        write_prefixes: Vec<String>,
        predict_prefixes: Vec<String>,
        paranoid: bool,
        net_allowed: bool,
    ) -> Result<PolicyState, Errno> {
        let cwd = std::env::current_dir()
            .map_err(|_| Errno::ENOENT)?
            .to_string_lossy()
            .into_owned();

        let write_prefixes = write_prefixes
            .iter()
            .map(|p| path::normalize_prefix(p, &cwd))
            .collect::<Result<Vec<_>, _>>()?;
        let predict_prefixes = predict_prefixes
            .iter()
            .map(|p| path::normalize_prefix(p, &cwd))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PolicyState {
            cwd,
            write_prefixes,
            predict_prefixes,
            paranoid,
            net_allowed,
            eldest: None,
        })
    }

    #[cfg(test)]
    pub fn for_test() -> PolicyState {
        PolicyState {
            cwd: "/".to_string(),
            write_prefixes: Vec::new(),
            predict_prefixes: Vec::new(),
            paranoid: false,
            net_allowed: true,
            eldest: None,
        }
    }
}

/// Adds `raw_path` (canonicalized against `cwd`) to `list` if not already
/// present, per the magic `write`/`predict` commands.
pub fn add_prefix(list: &mut Vec<String>, raw_path: &str, cwd: &str) -> Result<(), Errno> {
    let normalized = path::normalize_prefix(raw_path, cwd)?;
    if !list.iter().any(|p| p == &normalized) {
        list.push(normalized);
    }
    Ok(())
}

/// Removes any entry equal to the canonicalized form of `raw_path` from
/// `list`, per the magic `rmwrite`/`rmpredict` commands. Canonicalization
/// failures are tolerated here (mode is already Missing-equivalent since
/// we're just matching a previously-stored string) by falling back to a
/// literal string comparison.
pub fn remove_prefix(list: &mut Vec<String>, raw_path: &str, cwd: &str) {
    let normalized = path::normalize_prefix(raw_path, cwd).unwrap_or_else(|_| raw_path.to_string());
    list.retain(|p| p != &normalized);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_prefix_dedupes() {
        let mut list = Vec::new();
        add_prefix(&mut list, "/tmp/", "/").unwrap();
        add_prefix(&mut list, "/tmp", "/").unwrap();
        assert_eq!(list, vec!["/tmp".to_string()]);
    }

    #[test]
    fn remove_prefix_matches_canonical_form() {
        let mut list = vec!["/tmp".to_string()];
        remove_prefix(&mut list, "/tmp/", "/");
        assert!(list.is_empty());
    }
}
