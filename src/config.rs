use anyhow::{anyhow, bail, Context, Result};
use directories::ProjectDirs;
use hashdupe::{HashAlgorithm, PathFilter};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::cli::{Cli, FilterArgs};

const CONFIG_FILE: &str = "hashdupe_options.yaml";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub job_dir: Option<PathBuf>,
    pub algorithm: Option<HashAlgorithm>,
    pub workers: Option<usize>,
    /// Where the log sort keeps its partitions (default: the job directory).
    pub scratch_dir: Option<PathBuf>,
    /// Glob patterns excluded from hashing.
    pub exclude: Vec<String>,
    /// Regular expressions excluded from hashing.
    pub exclude_patterns: Vec<String>,
    pub ignore_hashes: Vec<String>,
    /// Log filter directive, used when RUST_LOG is unset.
    pub log: Option<String>,
    pub tui: bool,
}

impl Config {
    /// Load config from hashdupe_options.yaml, checking CWD first then exe dir.
    pub fn load() -> Result<Self> {
        for path in &config_candidates() {
            if path.exists() {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                return Self::parse(&text).with_context(|| format!("parsing {}", path.display()));
            }
        }
        Ok(Config::default())
    }

    fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

fn config_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(CONFIG_FILE)];
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join(CONFIG_FILE));
        }
    }
    candidates
}

/// Command line flags merged over the config file.
pub struct Settings {
    pub job_root: PathBuf,
    /// Requested explicitly; a job keeps the algorithm it was created with.
    pub algorithm: Option<HashAlgorithm>,
    pub workers: Option<usize>,
    pub scratch_dir: Option<PathBuf>,
    pub tui: bool,
    exclude: Vec<String>,
    exclude_patterns: Vec<String>,
    ignore_hashes: Vec<String>,
}

impl Settings {
    pub fn resolve(cli: &Cli, config: Config) -> Result<Self> {
        let job_root = match cli.job_dir.clone().or(config.job_dir) {
            Some(dir) => dir,
            None => ProjectDirs::from("", "", "hashdupe")
                .ok_or_else(|| anyhow!("no home directory; pass --job-dir"))?
                .data_dir()
                .to_path_buf(),
        };
        Ok(Self {
            job_root,
            algorithm: cli.algorithm.or(config.algorithm),
            workers: cli.workers.or(config.workers),
            scratch_dir: config.scratch_dir,
            tui: cli.tui || config.tui,
            exclude: config.exclude,
            exclude_patterns: config.exclude_patterns,
            ignore_hashes: config.ignore_hashes,
        })
    }

    /// Directory of the job cache called `name`.
    pub fn job_path(&self, name: &str) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.job_root.join(name)),
            _ => bail!("invalid job name {name:?}"),
        }
    }

    /// Exclusions from the config file plus those given on the command line.
    pub fn filter(&self, args: &FilterArgs) -> Result<PathFilter> {
        let mut patterns = self.exclude_patterns.clone();
        if let Some(ignore_file) = &args.exclude {
            patterns.extend(PathFilter::load_patterns(ignore_file)?);
        }
        let globs: Vec<String> = self
            .exclude
            .iter()
            .chain(&args.exclude_glob)
            .cloned()
            .collect();
        Ok(PathFilter::new(&patterns, &globs)?)
    }

    pub fn ignored_digests(&self, extra: &[String]) -> Vec<String> {
        self.ignore_hashes.iter().chain(extra).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_config() {
        let config = Config::parse(
            "algorithm: blake3\nexclude:\n  - '**/*.tmp'\ntui: true\nscratch_dir: /var/tmp\n",
        )
        .unwrap();
        assert_eq!(config.algorithm, Some(HashAlgorithm::Blake3));
        assert_eq!(config.scratch_dir, Some(PathBuf::from("/var/tmp")));
        assert_eq!(config.exclude, vec!["**/*.tmp".to_string()]);
        assert!(config.tui);
        assert!(config.job_dir.is_none());
    }

    #[test]
    fn empty_config_is_default() {
        let config = Config::parse("{}").unwrap();
        assert!(config.exclude_patterns.is_empty());
        assert!(config.log.is_none());
    }
}
