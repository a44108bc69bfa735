use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AnalyzerError, IndexError};
use crate::hash::HashFunction;
use crate::index::{ContentIndex, DuplicateGroups};
use crate::pipeline::{FileFailure, HashingPipeline, PipelineSummary, Progress};
use crate::record::{path_to_slash, Location, UNKNOWN_HOST};
use crate::walk::{self, PathFilter};

/// Duplicate groups, keyed by digest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DuplicateReport {
    pub groups: DuplicateGroups,
}

impl DuplicateReport {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of redundant copies: every location beyond the first per group.
    pub fn redundant_copies(&self) -> usize {
        self.groups.values().map(|g| g.len() - 1).sum()
    }

    /// Groups ordered by occurrence count, largest first.
    pub fn ranked(&self) -> Vec<(&str, &BTreeSet<Location>)> {
        let mut ranked: Vec<_> = self
            .groups
            .iter()
            .map(|(digest, locations)| (digest.as_str(), locations))
            .collect();
        ranked.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));
        ranked
    }

    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        for (digest, locations) in self.ranked() {
            writeln!(
                out,
                "File signature {} discovered {} times:",
                digest,
                locations.len()
            )?;
            for location in locations {
                writeln!(out, "\t{}:{}", location.host, path_to_slash(&location.path))?;
            }
        }
        Ok(())
    }
}

/// Files removed (or, in a dry run, that would be removed) by `delete`.
#[derive(Debug, Default)]
pub struct DeleteReport {
    /// Redundant path to the digest that made it redundant.
    pub deleted: BTreeMap<PathBuf, String>,
    pub dry_run: bool,
    pub hashing: PipelineSummary,
    /// Redundant files whose removal failed.
    pub failures: Vec<FileFailure>,
}

impl DeleteReport {
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        for (path, digest) in &self.deleted {
            writeln!(out, "{}\t{}", path_to_slash(path), digest)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct AnalyzeOutcome {
    pub hashing: PipelineSummary,
    /// Records appended to the job cache by this run.
    pub added: u64,
    pub duplicates: DuplicateReport,
}

/// Runs hashing over directory trees against one job cache.
pub struct Analyzer<'a> {
    index: &'a mut ContentIndex,
    hasher: &'a dyn HashFunction,
    filter: PathFilter,
    ignore: BTreeSet<String>,
    workers: Option<usize>,
    stop: Option<Arc<AtomicBool>>,
}

impl<'a> Analyzer<'a> {
    pub fn new(index: &'a mut ContentIndex, hasher: &'a dyn HashFunction) -> Self {
        Self {
            index,
            hasher,
            filter: PathFilter::default(),
            ignore: BTreeSet::new(),
            workers: None,
            stop: None,
        }
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Digests never reported as duplicates.
    pub fn with_ignored_digests(mut self, ignore: impl IntoIterator<Item = String>) -> Self {
        self.ignore = ignore.into_iter().collect();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    /// Hash every file under `roots` into the job cache, then report the
    /// duplicate groups of the whole cache.
    pub fn analyze(
        &mut self,
        roots: &[PathBuf],
        progress: &mut dyn Progress,
    ) -> Result<AnalyzeOutcome, AnalyzerError> {
        let roots = resolve_roots(roots)?;
        let (files, bytes) = survey(&roots);
        info!(files, bytes, "analyzing {} root(s)", roots.len());

        let pipeline = pipeline(
            self.hasher,
            &self.filter,
            self.workers,
            &self.stop,
            (files, bytes),
        );
        let index = &mut *self.index;
        let mut added = 0u64;
        let hashing = pipeline.run(
            roots.iter().flat_map(|root| walk::files(root)),
            progress,
            |path, digest| -> Result<(), AnalyzerError> {
                let here = Location::new(index.host(), path);
                // Re-runs over unchanged files leave the log as it is.
                if index.contains(digest) && index.lookup(digest)?.contains(&here) {
                    return Ok(());
                }
                index.add(path, digest)?;
                added += 1;
                Ok(())
            },
        )?;

        let duplicates = self.duplicates()?;
        info!(
            hashed = hashing.hashed,
            added,
            groups = duplicates.groups.len(),
            "analysis complete"
        );
        Ok(AnalyzeOutcome {
            hashing,
            added,
            duplicates,
        })
    }

    /// Duplicate groups currently in the job cache.
    pub fn duplicates(&mut self) -> Result<DuplicateReport, IndexError> {
        Ok(DuplicateReport {
            groups: self.index.get_duplicates(&self.ignore)?,
        })
    }

    /// Remove files under `root` whose content the job cache already holds
    /// at another location, or at more than one location. A copy is never
    /// removed once every other recorded location of its digest has been
    /// removed by the same call. Nothing is added to the job cache.
    pub fn delete(
        &mut self,
        root: &Path,
        dry_run: bool,
        progress: &mut dyn Progress,
    ) -> Result<DeleteReport, AnalyzerError> {
        let roots = resolve_roots(&[root.to_path_buf()])?;
        let (files, bytes) = survey(&roots);
        info!(
            files,
            bytes,
            dry_run,
            "checking {} for redundant files",
            roots[0].display()
        );

        let pipeline = pipeline(
            self.hasher,
            &self.filter,
            self.workers,
            &self.stop,
            (files, bytes),
        );
        let index = &*self.index;
        let mut deleted: BTreeMap<PathBuf, String> = BTreeMap::new();
        let mut failures = Vec::new();
        let hashing = pipeline.run(
            walk::files(&roots[0]),
            progress,
            |path, digest| -> Result<(), AnalyzerError> {
                if !index.contains(digest) {
                    return Ok(());
                }
                // Redundant only while another recorded copy survives this run.
                let known = index.lookup(digest)?;
                let here = Location::new(index.host(), path);
                let survivor = known.iter().any(|other| {
                    !is_local(other, &here)
                        && !(is_local_host(other, &here) && deleted.contains_key(&other.path))
                });
                if !survivor {
                    return Ok(());
                }
                if !dry_run {
                    if let Err(error) = std::fs::remove_file(path) {
                        warn!("cannot delete {}: {}", path.display(), error);
                        failures.push(FileFailure {
                            path: path.to_path_buf(),
                            error,
                        });
                        return Ok(());
                    }
                }
                info!(dry_run, "redundant {} ({})", path.display(), digest);
                deleted.insert(path.to_path_buf(), digest.to_string());
                Ok(())
            },
        )?;

        Ok(DeleteReport {
            deleted,
            dry_run,
            hashing,
            failures,
        })
    }
}

/// A hostless record on this host's path is taken to be this host's file.
fn is_local_host(other: &Location, here: &Location) -> bool {
    other.host == here.host || other.host == UNKNOWN_HOST
}

fn is_local(other: &Location, here: &Location) -> bool {
    other.path == here.path && is_local_host(other, here)
}

fn pipeline<'p>(
    hasher: &'p dyn HashFunction,
    filter: &'p PathFilter,
    workers: Option<usize>,
    stop: &Option<Arc<AtomicBool>>,
    (files, bytes): (u64, u64),
) -> HashingPipeline<'p> {
    let mut pipeline = HashingPipeline::new(hasher, filter).with_expected(files, bytes);
    if let Some(workers) = workers {
        pipeline = pipeline.with_workers(workers);
    }
    if let Some(flag) = stop {
        pipeline = pipeline.with_stop_flag(flag.clone());
    }
    pipeline
}

/// Check every root before any work starts, returning canonical paths.
fn resolve_roots(roots: &[PathBuf]) -> Result<Vec<PathBuf>, AnalyzerError> {
    if let Some(missing) = roots.iter().find(|root| !root.is_dir()) {
        return Err(AnalyzerError::MissingDirectory(missing.clone()));
    }
    roots
        .iter()
        .map(|root| {
            root.canonicalize().map_err(|source| AnalyzerError::Resolve {
                path: root.clone(),
                source,
            })
        })
        .collect()
}

fn survey(roots: &[PathBuf]) -> (u64, u64) {
    roots
        .iter()
        .map(|root| walk::survey(root))
        .fold((0, 0), |(files, bytes), (f, b)| (files + f, bytes + b))
}
