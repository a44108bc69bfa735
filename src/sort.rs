//! Out-of-core line sort.
//!
//! The input is cut into partitions small enough to sort in memory, and the
//! sorted partitions are then merged pairwise by a pool of workers until one
//! partition holding every byte remains. Lines are compared as raw bytes.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::thread;
use tracing::{debug, info};

use crate::error::SortError;

const DEFAULT_PARTITION_LIMIT: u64 = 1024 * 1024 * 1024; // 1 GB
const IO_BUFFER_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct ExternalSorter {
    workers: usize,
    partition_limit: u64,
    scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortStats {
    pub records: u64,
    pub partitions: usize,
    pub bytes: u64,
}

impl Default for ExternalSorter {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalSorter {
    pub fn new() -> Self {
        Self {
            workers: default_workers(),
            partition_limit: DEFAULT_PARTITION_LIMIT,
            scratch_dir: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Upper bound on the bytes held in memory for one partition.
    pub fn with_partition_limit(mut self, bytes: u64) -> Self {
        self.partition_limit = bytes.max(1);
        self
    }

    /// Keep partitions under `dir` instead of beside the output.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Sort the lines of `input` into `output`. The two may be the same file;
    /// `output` is only replaced once the merge has completed.
    pub fn sort(&self, input: &Path, output: &Path) -> Result<SortStats, SortError> {
        let input_len = fs::metadata(input)?.len();
        let parent = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        // Dropping the scratch dir removes any leftover partitions.
        let scratch = tempfile::Builder::new()
            .prefix(".sort-")
            .tempdir_in(self.scratch_dir.as_deref().unwrap_or(parent))?;

        let chunk = partition_size(input_len, self.workers, self.partition_limit);
        let (partitions, stats) = partition(input, scratch.path(), chunk)?;
        debug!(
            partitions = partitions.len(),
            chunk,
            bytes = stats.bytes,
            "partitioned {}",
            input.display()
        );

        let sorted = if partitions.is_empty() {
            let empty = scratch.path().join("empty");
            File::create(&empty)?;
            empty
        } else {
            self.merge_all(partitions, stats.bytes, scratch.path())?
        };
        if self.scratch_dir.is_some() {
            // The scratch dir may be on another filesystem.
            let mut staged = tempfile::NamedTempFile::new_in(parent)?;
            io::copy(&mut File::open(&sorted)?, staged.as_file_mut())?;
            staged.as_file().sync_all()?;
            staged.persist(output).map_err(|e| e.error)?;
        } else {
            fs::rename(&sorted, output)?;
        }
        info!(
            records = stats.records,
            partitions = stats.partitions,
            "sorted {}",
            output.display()
        );
        Ok(stats)
    }

    fn merge_all(
        &self,
        partitions: Vec<Partition>,
        expected: u64,
        scratch: &Path,
    ) -> Result<PathBuf, SortError> {
        let workers = self.workers.min(partitions.len() / 2).max(1);
        let pool = MergePool {
            state: Mutex::new(PoolState {
                pending: partitions.into(),
                finished: None,
                failed: false,
                next_id: 0,
            }),
            ready: Condvar::new(),
            expected,
        };

        let results: Vec<thread::Result<Result<(), SortError>>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| scope.spawn(|| merge_worker(&pool, scratch)))
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });
        for result in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(SortError::WorkerPanicked),
            }
        }

        let state = pool.state.into_inner().map_err(|_| SortError::WorkerPanicked)?;
        state
            .finished
            .map(|p| p.path)
            .ok_or(SortError::WorkerPanicked)
    }
}

/// A sorted run on disk.
#[derive(Debug)]
struct Partition {
    path: PathBuf,
    len: u64,
}

struct MergePool {
    state: Mutex<PoolState>,
    ready: Condvar,
    expected: u64,
}

struct PoolState {
    pending: VecDeque<Partition>,
    finished: Option<Partition>,
    failed: bool,
    next_id: usize,
}

fn default_workers() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn partition_size(total: u64, workers: usize, limit: u64) -> u64 {
    total.div_ceil(workers.max(1) as u64).clamp(1, limit)
}

/// Phase one: cut the input into sorted partitions of roughly `chunk` bytes.
fn partition(input: &Path, scratch: &Path, chunk: u64) -> Result<(Vec<Partition>, SortStats), SortError> {
    let mut reader = BufReader::with_capacity(IO_BUFFER_BYTES, File::open(input)?);
    let mut partitions = Vec::new();
    let mut stats = SortStats::default();
    let mut lines: Vec<Vec<u8>> = Vec::new();
    let mut held = 0u64;

    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            line.push(b'\n');
        }
        held += line.len() as u64;
        stats.records += 1;
        stats.bytes += line.len() as u64;
        lines.push(line);
        if held >= chunk {
            partitions.push(write_partition(&mut lines, held, scratch, partitions.len())?);
            held = 0;
        }
    }
    if !lines.is_empty() {
        partitions.push(write_partition(&mut lines, held, scratch, partitions.len())?);
    }
    stats.partitions = partitions.len();
    Ok((partitions, stats))
}

fn write_partition(
    lines: &mut Vec<Vec<u8>>,
    len: u64,
    scratch: &Path,
    idx: usize,
) -> Result<Partition, SortError> {
    lines.sort_unstable();
    let path = scratch.join(format!("p{idx:06}"));
    let mut out = BufWriter::with_capacity(IO_BUFFER_BYTES, File::create(&path)?);
    for line in lines.drain(..) {
        out.write_all(&line)?;
    }
    out.flush()?;
    Ok(Partition { path, len })
}

/// Phase two worker: repeatedly claim two partitions and merge them until a
/// single partition of the expected size remains or another worker failed.
fn merge_worker(pool: &MergePool, scratch: &Path) -> Result<(), SortError> {
    loop {
        let (left, right, id) = {
            let mut state = pool.state.lock().map_err(|_| SortError::WorkerPanicked)?;
            loop {
                if state.failed || state.finished.is_some() {
                    return Ok(());
                }
                if state.pending.len() == 1 && state.pending[0].len == pool.expected {
                    state.finished = state.pending.pop_front();
                    pool.ready.notify_all();
                    return Ok(());
                }
                if state.pending.len() >= 2 {
                    if let (Some(left), Some(right)) =
                        (state.pending.pop_front(), state.pending.pop_front())
                    {
                        let id = state.next_id;
                        state.next_id += 1;
                        break (left, right, id);
                    }
                }
                state = pool.ready.wait(state).map_err(|_| SortError::WorkerPanicked)?;
            }
        };

        let target = scratch.join(format!("m{id:06}"));
        let merged = merge_pair(&left, &right, &target);
        let mut state = pool.state.lock().map_err(|_| SortError::WorkerPanicked)?;
        match merged {
            Ok(partition) => {
                state.pending.push_back(partition);
                pool.ready.notify_all();
            }
            Err(e) => {
                state.failed = true;
                pool.ready.notify_all();
                return Err(e);
            }
        }
    }
}

fn merge_pair(left: &Partition, right: &Partition, target: &Path) -> Result<Partition, SortError> {
    let mut a = BufReader::with_capacity(IO_BUFFER_BYTES, File::open(&left.path)?);
    let mut b = BufReader::with_capacity(IO_BUFFER_BYTES, File::open(&right.path)?);
    let mut out = BufWriter::with_capacity(IO_BUFFER_BYTES, File::create(target)?);

    let mut line_a = Vec::new();
    let mut line_b = Vec::new();
    let mut more_a = a.read_until(b'\n', &mut line_a)? > 0;
    let mut more_b = b.read_until(b'\n', &mut line_b)? > 0;
    let mut len = 0u64;

    while more_a || more_b {
        let take_a = more_a && (!more_b || line_a <= line_b);
        let (line, reader, more) = if take_a {
            (&mut line_a, &mut a, &mut more_a)
        } else {
            (&mut line_b, &mut b, &mut more_b)
        };
        out.write_all(line)?;
        len += line.len() as u64;
        line.clear();
        *more = reader.read_until(b'\n', line)? > 0;
    }
    out.flush()?;
    drop(out);

    fs::remove_file(&left.path)?;
    fs::remove_file(&right.path)?;
    Ok(Partition {
        path: target.to_path_buf(),
        len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random_lines(n: usize) -> Vec<String> {
        // xorshift keeps the fixture deterministic without an rng dependency
        let mut x: u64 = 0x9e37_79b9_7f4a_7c15;
        (0..n)
            .map(|i| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                format!("{:016x},{i}\n", x % 5000)
            })
            .collect()
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| format!("{l}\n"))
            .collect()
    }

    #[test]
    fn sorts_into_a_permutation() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        let lines = pseudo_random_lines(20_000);
        fs::write(&input, lines.concat()).unwrap();

        let stats = ExternalSorter::new()
            .with_workers(4)
            .with_partition_limit(16 * 1024)
            .sort(&input, &output)
            .unwrap();
        assert!(stats.partitions > 4);
        assert_eq!(stats.records, 20_000);

        let sorted = read_lines(&output);
        assert!(sorted.windows(2).all(|w| w[0] <= w[1]));
        let mut expected = lines.clone();
        expected.sort();
        assert_eq!(sorted, expected);
        assert_eq!(fs::metadata(&output).unwrap().len(), fs::metadata(&input).unwrap().len());
    }

    #[test]
    fn sorts_in_place_and_cleans_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, "c\nb\na\nb").unwrap();

        ExternalSorter::new()
            .with_workers(2)
            .with_partition_limit(2)
            .sort(&path, &path)
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nb\nb\nc\n");
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn empty_and_single_partition_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        fs::write(&empty, "").unwrap();
        let stats = ExternalSorter::new().sort(&empty, &empty).unwrap();
        assert_eq!(stats, SortStats::default());
        assert_eq!(fs::read(&empty).unwrap(), b"");

        let one = dir.path().join("one");
        fs::write(&one, "z\ny\n").unwrap();
        let stats = ExternalSorter::new().with_workers(1).sort(&one, &one).unwrap();
        assert_eq!(stats.partitions, 1);
        assert_eq!(fs::read_to_string(&one).unwrap(), "y\nz\n");
    }

    #[test]
    fn missing_input_fails_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out");
        let err = ExternalSorter::new()
            .sort(&dir.path().join("absent"), &output)
            .unwrap_err();
        assert!(matches!(err, SortError::Io(_)));
        assert!(!output.exists());
    }

    #[test]
    fn scratch_dir_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        fs::write(&log, "c\na\nb\n").unwrap();

        ExternalSorter::new()
            .with_partition_limit(2)
            .with_scratch_dir(scratch.path())
            .sort(&log, &log)
            .unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "a\nb\nc\n");
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn unusable_scratch_dir_leaves_input_alone() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        fs::write(&log, "c\na\nb\n").unwrap();

        let err = ExternalSorter::new()
            .with_scratch_dir(dir.path().join("missing"))
            .sort(&log, &log)
            .unwrap_err();
        assert!(matches!(err, SortError::Io(_)));
        assert_eq!(fs::read_to_string(&log).unwrap(), "c\na\nb\n");
    }

    #[test]
    fn chunk_size_is_bounded() {
        assert_eq!(partition_size(100, 4, 1024), 25);
        assert_eq!(partition_size(10_000, 2, 1024), 1024);
        assert_eq!(partition_size(0, 8, 1024), 1);
    }
}
