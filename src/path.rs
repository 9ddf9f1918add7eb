//! Pure functions over path strings: canonicalization, prefix-list
//! membership, and recognition of the magic control-channel paths.
//!
//! Nothing here touches a tracee; it's plain string/filesystem-metadata
//! logic and is exercised directly by unit tests.

use nix::errno::Errno;
use nix::sys::stat::lstat;

/// How missing path components should be treated while canonicalizing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// The full path must exist.
    Existing,
    /// All but the final component must exist (the call may create the leaf).
    AllButLast,
    /// Any component, including all of them, may be missing.
    Missing,
}

pub const MAX_SYMLINKS: u32 = 256;

/// The magic control-channel prefix. A pathname under this prefix, given as
/// the argument to `open` or `stat`, is interpreted as a sandbox command
/// rather than a filesystem operation.
pub const MAGIC_PREFIX: &str = "/dev/pathwarden";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MagicCommand {
    AddWrite(String),
    AddPredict(String),
    RemoveWrite(String),
    RemovePredict(String),
}

/// Recognizes `<MAGIC>/write|predict|rmwrite|rmpredict/<path>`. Returns
/// `None` for anything else, including the bare magic-dir prefix (that one
/// is handled by [`is_magic_dir`] instead).
pub fn parse_magic_command(path: &str) -> Option<MagicCommand> {
    let rest = path.strip_prefix(MAGIC_PREFIX)?;
    let rest = rest.strip_prefix('/')?;
    if let Some(p) = rest.strip_prefix("write/") {
        Some(MagicCommand::AddWrite(format!("/{}", p)))
    } else if let Some(p) = rest.strip_prefix("predict/") {
        Some(MagicCommand::AddPredict(format!("/{}", p)))
    } else if let Some(p) = rest.strip_prefix("rmwrite/") {
        Some(MagicCommand::RemoveWrite(format!("/{}", p)))
    } else if let Some(p) = rest.strip_prefix("rmpredict/") {
        Some(MagicCommand::RemovePredict(format!("/{}", p)))
    } else {
        None
    }
}

/// True iff `path` is the bare magic directory (`<MAGIC>` or `<MAGIC>/`),
/// used to probe whether a sandbox is in effect via `stat`.
pub fn is_magic_dir(path: &str) -> bool {
    path == MAGIC_PREFIX || path == format!("{}/", MAGIC_PREFIX)
}

/// True iff `path` equals some entry of `list` or is strictly nested under
/// one (separated by `/`). Bytewise comparison, no case folding.
pub fn pathlist_check(list: &[String], path: &str) -> bool {
    list.iter().any(|prefix| {
        if prefix == path || prefix == "/" {
            return true;
        }
        path.len() > prefix.len()
            && path.as_bytes()[prefix.len()] == b'/'
            && path.starts_with(prefix.as_str())
    })
}

/// Normalizes a prefix added via the write/predict lists: canonicalizes it
/// and strips any trailing slash (save for the root itself), matching the
/// invariant that the lists store absolute, canonical, slash-free entries.
pub fn normalize_prefix(path: &str, cwd: &str) -> Result<String, Errno> {
    let canon = canonicalize(path, Mode::Missing, true, cwd)?;
    if canon.len() > 1 {
        Ok(canon.trim_end_matches('/').to_string())
    } else {
        Ok(canon)
    }
}

fn push_components(pending: &mut Vec<String>, path: &str) {
    let comps: Vec<&str> = path
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    for c in comps.into_iter().rev() {
        pending.push(c.to_string());
    }
}

fn is_dir(mode: libc::mode_t) -> bool {
    (mode & libc::S_IFMT) == libc::S_IFDIR
}

fn is_symlink(mode: libc::mode_t) -> bool {
    (mode & libc::S_IFMT) == libc::S_IFLNK
}

/// Resolves `name` (possibly relative to `cwd`, NOT the sandbox's own cwd)
/// into an absolute canonical path, following the standard realpath
/// algorithm with the policies spelled out in the component doc.
pub fn canonicalize(name: &str, mode: Mode, resolve_symlinks: bool, cwd: &str) -> Result<String, Errno> {
    if name.is_empty() {
        return Err(Errno::ENOENT);
    }

    let raw = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), name)
    };
    let trailing_slash = raw.len() > 1 && raw.ends_with('/');

    let mut pending: Vec<String> = Vec::new();
    push_components(&mut pending, &raw);

    let mut resolved: Vec<String> = Vec::new();
    let mut link_count: u32 = 0;
    let mut fully_resolved = true;

    while let Some(component) = pending.pop() {
        if component == ".." {
            resolved.pop();
            continue;
        }

        resolved.push(component);
        let candidate = format!("/{}", resolved.join("/"));
        let is_last = pending.is_empty();

        match lstat(candidate.as_str()) {
            Ok(st) => {
                if is_symlink(st.st_mode) && (resolve_symlinks || !is_last) {
                    link_count += 1;
                    if link_count > MAX_SYMLINKS {
                        return Err(Errno::ELOOP);
                    }
                    let target = std::fs::read_link(&candidate).map_err(|_| Errno::ENOENT)?;
                    let target = target.to_string_lossy().into_owned();
                    resolved.pop();
                    if target.starts_with('/') {
                        resolved.clear();
                    }
                    push_components(&mut pending, &target);
                }
                // Otherwise an ordinary component (or the final one with
                // resolve_symlinks off): it stays in `resolved` as-is.
            }
            Err(e) => {
                let should_fail = match mode {
                    Mode::Existing => true,
                    Mode::AllButLast => !is_last,
                    Mode::Missing => false,
                };
                if should_fail {
                    return Err(e);
                }
                // Tolerated: this component and everything nested under it
                // don't exist, so there's nothing left worth lstat-ing.
                fully_resolved = false;
                while let Some(rest) = pending.pop() {
                    resolved.push(rest);
                }
                break;
            }
        }
    }

    let result = if resolved.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", resolved.join("/"))
    };

    if trailing_slash && fully_resolved {
        if let Ok(st) = lstat(result.as_str()) {
            if !is_dir(st.st_mode) {
                return Err(Errno::ENOTDIR);
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn empty_name_is_enoent() {
        assert_eq!(canonicalize("", Mode::Existing, true, "/"), Err(Errno::ENOENT));
    }

    #[test]
    fn relative_path_resolves_against_given_cwd() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let got = canonicalize("sub", Mode::Existing, true, dir.path().to_str().unwrap()).unwrap();
        assert_eq!(got, sub.to_str().unwrap());
    }

    #[test]
    fn dot_dot_pops_a_component_but_not_past_root() {
        assert_eq!(
            canonicalize("/a/b/../../../../c", Mode::Missing, true, "/").unwrap(),
            "/c"
        );
    }

    #[test]
    fn missing_mode_tolerates_nonexistent_path() {
        let got = canonicalize("/this/does/not/exist", Mode::Missing, true, "/").unwrap();
        assert_eq!(got, "/this/does/not/exist");
    }

    #[test]
    fn existing_mode_fails_on_missing_component() {
        assert_eq!(
            canonicalize("/this/does/not/exist", Mode::Existing, true, "/"),
            Err(Errno::ENOENT)
        );
    }

    #[test]
    fn all_but_last_allows_only_final_component_missing() {
        let dir = tempdir().unwrap();
        let leaf = dir.path().join("newfile");
        let got = canonicalize(leaf.to_str().unwrap(), Mode::AllButLast, true, "/").unwrap();
        assert_eq!(got, leaf.to_str().unwrap());
    }

    #[test]
    fn all_but_last_fails_when_parent_missing() {
        let dir = tempdir().unwrap();
        let leaf = dir.path().join("missing_dir").join("newfile");
        assert_eq!(
            canonicalize(leaf.to_str().unwrap(), Mode::AllButLast, true, "/"),
            Err(Errno::ENOENT)
        );
    }

    #[test]
    fn symlink_is_spliced_into_remaining_path() {
        let dir = tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        symlink(&real, &link).unwrap();
        let target = link.join("inside");
        std::fs::File::create(real.join("inside")).unwrap();

        let got = canonicalize(target.to_str().unwrap(), Mode::Existing, true, "/").unwrap();
        assert_eq!(got, real.join("inside").to_str().unwrap());
    }

    #[test]
    fn dont_resolve_symlinks_keeps_final_component_as_symlink() {
        let dir = tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::File::create(&real).unwrap();
        let link = dir.path().join("link");
        symlink(&real, &link).unwrap();

        let got = canonicalize(link.to_str().unwrap(), Mode::Existing, false, "/").unwrap();
        assert_eq!(got, link.to_str().unwrap());
    }

    #[test]
    fn trailing_slash_on_non_directory_is_enotdir() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::File::create(&file).unwrap();
        let with_slash = format!("{}/", file.to_str().unwrap());
        assert_eq!(
            canonicalize(&with_slash, Mode::Existing, true, "/"),
            Err(Errno::ENOTDIR)
        );
    }

    #[test]
    fn pathlist_exact_and_nested_match() {
        let list = vec!["/tmp".to_string()];
        assert!(pathlist_check(&list, "/tmp"));
        assert!(pathlist_check(&list, "/tmp/x"));
        assert!(!pathlist_check(&list, "/tmpfoo"));
        assert!(!pathlist_check(&list, "/var"));
    }

    #[test]
    fn pathlist_root_matches_everything() {
        let list = vec!["/".to_string()];
        assert!(pathlist_check(&list, "/anything/at/all"));
    }

    #[test]
    fn magic_write_command_parses_path() {
        let cmd = parse_magic_command(&format!("{}/write/tmp/", MAGIC_PREFIX)).unwrap();
        assert_eq!(cmd, MagicCommand::AddWrite("/tmp/".to_string()));
    }

    #[test]
    fn magic_rmpredict_command_parses_path() {
        let cmd = parse_magic_command(&format!("{}/rmpredict/var/log", MAGIC_PREFIX)).unwrap();
        assert_eq!(cmd, MagicCommand::RemovePredict("/var/log".to_string()));
    }

    #[test]
    fn non_magic_path_is_none() {
        assert_eq!(parse_magic_command("/etc/passwd"), None);
    }

    #[test]
    fn bare_magic_dir_is_recognized() {
        assert!(is_magic_dir(MAGIC_PREFIX));
        assert!(is_magic_dir(&format!("{}/", MAGIC_PREFIX)));
        assert!(!is_magic_dir(&format!("{}/write/tmp", MAGIC_PREFIX)));
    }
}
