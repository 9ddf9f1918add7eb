//! On-disk configuration file, merged under the command-line flags in
//! [`crate::cli`]. Entirely optional: a sandbox invocation with no
//! `--config` runs on CLI flags alone.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub write_prefixes: Vec<String>,
    #[serde(default)]
    pub predict_prefixes: Vec<String>,
    #[serde(default)]
    pub paranoid: Option<bool>,
    #[serde(default)]
    pub net: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> std::io::Result<FileConfig> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// The fully-merged, ready-to-run configuration: CLI flags take
/// precedence over file settings for scalar fields; path lists are
/// unioned.
pub struct EffectiveConfig {
    pub write_prefixes: Vec<String>,
    pub predict_prefixes: Vec<String>,
    pub paranoid: bool,
    pub net: bool,
}

impl EffectiveConfig {
    pub fn merge(cli: &crate::cli::Opt, file: Option<FileConfig>) -> EffectiveConfig {
        let file = file.unwrap_or_default();

        let mut write_prefixes: Vec<String> =
            cli.write_prefixes.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        write_prefixes.extend(file.write_prefixes);

        let mut predict_prefixes: Vec<String> =
            cli.predict_prefixes.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        predict_prefixes.extend(file.predict_prefixes);

        EffectiveConfig {
            write_prefixes,
            predict_prefixes,
            paranoid: cli.paranoid || file.paranoid.unwrap_or(false),
            net: cli.net || file.net.unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn opt_with(write: Vec<&str>, paranoid: bool) -> crate::cli::Opt {
        crate::cli::Opt {
            write_prefixes: write.into_iter().map(PathBuf::from).collect(),
            predict_prefixes: Vec::new(),
            paranoid,
            net: false,
            config: None,
            log_file: None,
            verbosity: 0,
            quiet: false,
            command: vec!["true".to_string()],
        }
    }

    #[test]
    fn merge_unions_write_prefixes() {
        let cli = opt_with(vec!["/tmp"], false);
        let file = FileConfig { write_prefixes: vec!["/var/tmp".to_string()], ..Default::default() };
        let merged = EffectiveConfig::merge(&cli, Some(file));
        assert_eq!(merged.write_prefixes, vec!["/tmp".to_string(), "/var/tmp".to_string()]);
    }

    #[test]
    fn merge_ors_scalar_flags() {
        let cli = opt_with(vec![], true);
        let merged = EffectiveConfig::merge(&cli, None);
        assert!(merged.paranoid);
        assert!(!merged.net);
    }
}
