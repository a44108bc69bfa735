use crossbeam_channel::{bounded, Receiver, Sender};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::hash::HashFunction;
use crate::walk::PathFilter;

/// Queue slots per worker, for both the job and the event channel.
const QUEUE_DEPTH: usize = 4;

/// Receives progress as the accumulator observes it. Every method is called
/// from the thread that called [`HashingPipeline::run`].
pub trait Progress {
    fn batch_started(&mut self, _expected_files: u64, _expected_bytes: u64) {}
    fn hashed(&mut self, _path: &Path, _bytes: u64) {}
    fn skipped(&mut self, _path: &Path) {}
    fn failed(&mut self, _path: &Path, _error: &io::Error) {}
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {}

#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: io::Error,
}

#[derive(Debug, Default)]
pub struct PipelineSummary {
    pub hashed: u64,
    pub bytes: u64,
    pub skipped: u64,
    pub failures: Vec<FileFailure>,
    pub cancelled: bool,
}

enum Event {
    Hashed { path: PathBuf, digest: String, bytes: u64 },
    Failed { path: PathBuf, error: io::Error },
    Skipped { path: PathBuf },
}

/// Hashes files on a pool of worker threads and hands every result to one
/// consumer, so that consumer may mutate unsynchronised state.
pub struct HashingPipeline<'a> {
    hasher: &'a dyn HashFunction,
    filter: &'a PathFilter,
    workers: usize,
    expected: (u64, u64),
    stop: Option<Arc<AtomicBool>>,
}

impl<'a> HashingPipeline<'a> {
    pub fn new(hasher: &'a dyn HashFunction, filter: &'a PathFilter) -> Self {
        Self {
            hasher,
            filter,
            workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            expected: (0, 0),
            stop: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Expected file count and byte total, forwarded to the progress sink.
    pub fn with_expected(mut self, files: u64, bytes: u64) -> Self {
        self.expected = (files, bytes);
        self
    }

    /// Stop dispatching new paths once `flag` is set. Paths already handed to
    /// workers are still hashed and delivered.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    /// Hash every regular, non-excluded file in `paths`, calling `on_result`
    /// once per digest. Returns after all results have been delivered.
    ///
    /// An error from `on_result` ends the batch early and is returned once
    /// every thread has wound down.
    pub fn run<I, F, E>(
        &self,
        paths: I,
        progress: &mut dyn Progress,
        mut on_result: F,
    ) -> Result<PipelineSummary, E>
    where
        I: IntoIterator<Item = PathBuf>,
        I::IntoIter: Send,
        F: FnMut(&Path, &str) -> Result<(), E>,
        E: From<PipelineError>,
    {
        let paths = paths.into_iter();
        let (job_tx, job_rx) = bounded::<PathBuf>(self.workers * QUEUE_DEPTH);
        let (event_tx, event_rx) = bounded::<Event>(self.workers * QUEUE_DEPTH);
        let mut summary = PipelineSummary::default();
        progress.batch_started(self.expected.0, self.expected.1);

        thread::scope(|scope| {
            let workers: Vec<_> = (0..self.workers)
                .map(|_| {
                    let job_rx = job_rx.clone();
                    let event_tx = event_tx.clone();
                    scope.spawn(move || hash_worker(self.hasher, job_rx, event_tx))
                })
                .collect();
            drop(job_rx);

            let producer = {
                let event_tx = event_tx.clone();
                scope.spawn(move || self.produce(paths, job_tx, event_tx))
            };
            drop(event_tx);

            let mut outcome = Ok(());
            for event in event_rx.iter() {
                match event {
                    Event::Hashed { path, digest, bytes } => {
                        summary.hashed += 1;
                        summary.bytes += bytes;
                        progress.hashed(&path, bytes);
                        if let Err(e) = on_result(&path, &digest) {
                            outcome = Err(e);
                            break;
                        }
                    }
                    Event::Failed { path, error } => {
                        warn!("cannot hash {}: {}", path.display(), error);
                        progress.failed(&path, &error);
                        summary.failures.push(FileFailure { path, error });
                    }
                    Event::Skipped { path } => {
                        summary.skipped += 1;
                        progress.skipped(&path);
                    }
                }
            }
            // Unblocks any worker or producer still trying to send.
            drop(event_rx);

            let mut panicked = false;
            for worker in workers {
                panicked |= worker.join().is_err();
            }
            match producer.join() {
                Ok(cancelled) => summary.cancelled = cancelled,
                Err(_) => panicked = true,
            }

            outcome?;
            if panicked {
                return Err(PipelineError::WorkerPanicked.into());
            }
            debug!(
                hashed = summary.hashed,
                skipped = summary.skipped,
                failed = summary.failures.len(),
                "hashing batch complete"
            );
            Ok(summary)
        })
    }

    /// Feed candidate paths to the workers. Returns true if the stop flag
    /// ended dispatch early.
    fn produce(
        &self,
        paths: impl Iterator<Item = PathBuf>,
        job_tx: Sender<PathBuf>,
        event_tx: Sender<Event>,
    ) -> bool {
        for path in paths {
            if self
                .stop
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                return true;
            }
            let regular = std::fs::symlink_metadata(&path)
                .map(|m| m.is_file())
                .unwrap_or(false);
            let sent = if !regular || self.filter.is_excluded(&path) {
                event_tx.send(Event::Skipped { path }).is_ok()
            } else {
                job_tx.send(path).is_ok()
            };
            if !sent {
                break;
            }
        }
        false
    }
}

fn hash_worker(hasher: &dyn HashFunction, jobs: Receiver<PathBuf>, events: Sender<Event>) {
    for path in jobs.iter() {
        let event = match std::fs::metadata(&path).and_then(|m| {
            let digest = hasher.digest(&path)?;
            Ok((digest, m.len()))
        }) {
            Ok((digest, bytes)) => Event::Hashed {
                path,
                digest,
                bytes,
            },
            Err(error) => Event::Failed { path, error },
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use std::collections::BTreeMap;
    use std::fs;

    #[derive(Default)]
    struct Counting {
        started: Option<(u64, u64)>,
        hashed: u64,
        skipped: u64,
        failed: u64,
    }

    impl Progress for Counting {
        fn batch_started(&mut self, files: u64, bytes: u64) {
            self.started = Some((files, bytes));
        }
        fn hashed(&mut self, _path: &Path, _bytes: u64) {
            self.hashed += 1;
        }
        fn skipped(&mut self, _path: &Path) {
            self.skipped += 1;
        }
        fn failed(&mut self, _path: &Path, _error: &io::Error) {
            self.failed += 1;
        }
    }

    #[test]
    fn every_regular_file_is_delivered_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..200 {
            let path = dir.path().join(format!("{i:03}.bin"));
            fs::write(&path, format!("content {}", i % 50)).unwrap();
            paths.push(path);
        }
        fs::create_dir(dir.path().join("subdir")).unwrap();
        paths.push(dir.path().join("subdir"));

        let filter = PathFilter::default();
        let hasher = HashAlgorithm::Sha256;
        let mut progress = Counting::default();
        let mut seen = BTreeMap::new();
        let summary = HashingPipeline::new(&hasher, &filter)
            .with_workers(4)
            .with_expected(201, 0)
            .run(paths, &mut progress, |path, digest| {
                assert!(seen.insert(path.to_path_buf(), digest.to_string()).is_none());
                Ok::<_, PipelineError>(())
            })
            .unwrap();

        assert_eq!(seen.len(), 200);
        assert_eq!(summary.hashed, 200);
        assert_eq!(summary.skipped, 1);
        assert_eq!(progress.hashed, 200);
        assert_eq!(progress.skipped, 1);
        assert_eq!(progress.started, Some((201, 0)));
        let distinct: std::collections::BTreeSet<_> = seen.values().collect();
        assert_eq!(distinct.len(), 50);
    }

    #[test]
    fn failures_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.txt");
        let bad = dir.path().join("bad.txt");
        fs::write(&good, b"fine").unwrap();
        fs::write(&bad, b"broken").unwrap();

        let bad_name = bad.clone();
        let hasher = move |path: &Path| -> io::Result<String> {
            if path == bad_name {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
            } else {
                HashAlgorithm::Md5.digest(path)
            }
        };
        let filter = PathFilter::default();
        let mut progress = Counting::default();
        let mut delivered = Vec::new();
        let summary = HashingPipeline::new(&hasher, &filter)
            .with_workers(2)
            .run(vec![bad.clone(), good.clone()], &mut progress, |path, _| {
                delivered.push(path.to_path_buf());
                Ok::<_, PipelineError>(())
            })
            .unwrap();

        assert_eq!(delivered, vec![good]);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].path, bad);
        assert_eq!(summary.failures[0].error.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(progress.failed, 1);
    }

    #[test]
    fn excluded_and_missing_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("keep.txt");
        let excluded = dir.path().join("drop.tmp");
        fs::write(&kept, b"a").unwrap();
        fs::write(&excluded, b"a").unwrap();

        let filter = PathFilter::new(&[r"\.tmp$".to_string()], &[]).unwrap();
        let hasher = HashAlgorithm::Sha1;
        let mut delivered = Vec::new();
        let summary = HashingPipeline::new(&hasher, &filter)
            .run(
                vec![kept.clone(), excluded, dir.path().join("vanished")],
                &mut NoProgress,
                |path, _| {
                    delivered.push(path.to_path_buf());
                    Ok::<_, PipelineError>(())
                },
            )
            .unwrap();
        assert_eq!(delivered, vec![kept]);
        assert_eq!(summary.skipped, 2);
    }

    #[derive(Debug)]
    enum StopError {
        Full,
        Pipeline,
    }

    impl From<PipelineError> for StopError {
        fn from(_: PipelineError) -> Self {
            StopError::Pipeline
        }
    }

    #[test]
    fn consumer_error_stops_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<_> = (0..500)
            .map(|i| {
                let path = dir.path().join(format!("{i}.txt"));
                fs::write(&path, i.to_string()).unwrap();
                path
            })
            .collect();

        let filter = PathFilter::default();
        let hasher = HashAlgorithm::Blake3;
        let mut calls = 0;
        let result = HashingPipeline::new(&hasher, &filter)
            .with_workers(3)
            .run(paths, &mut NoProgress, |_, _| {
                calls += 1;
                if calls == 10 {
                    Err(StopError::Full)
                } else {
                    Ok(())
                }
            });
        assert!(matches!(result, Err(StopError::Full)));
        assert_eq!(calls, 10);
    }

    #[test]
    fn stop_flag_halts_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        fs::write(&path, b"a").unwrap();

        let flag = Arc::new(AtomicBool::new(true));
        let filter = PathFilter::default();
        let hasher = HashAlgorithm::Sha256;
        let summary = HashingPipeline::new(&hasher, &filter)
            .with_stop_flag(flag)
            .run(vec![path], &mut NoProgress, |_, _| Ok::<_, PipelineError>(()))
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.hashed, 0);
    }
}
