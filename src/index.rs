//! The job cache: an append-only record log plus an in-memory digest index.
//!
//! The log (`hashes.jsonl` in the job directory) is the source of truth. The
//! digest index maps each digest to the byte offsets of its records and is
//! rebuilt from the log whenever the log is opened or rewritten.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::IndexError;
use crate::record::{self, Decoded, Location, Record};
use crate::sort::ExternalSorter;

pub const LOG_FILE: &str = "hashes.jsonl";

/// Digest to the distinct locations that produced it.
pub type DuplicateGroups = BTreeMap<String, BTreeSet<Location>>;

pub struct ContentIndex {
    dir: PathBuf,
    log_path: PathBuf,
    host: String,
    log: Option<File>,
    offsets: HashMap<String, Vec<u64>>,
    records: u64,
    skipped: u64,
    sorted: bool,
    sorter: ExternalSorter,
}

/// What a log rewrite does with one record.
enum Rewrite {
    Keep,
    Drop,
    Replace(Record),
}

/// Result of scanning the whole log.
struct Scan {
    offsets: HashMap<String, Vec<u64>>,
    records: u64,
    skipped: u64,
    sorted: bool,
    torn_at: Option<u64>,
}

/// Name of this machine, as recorded in new records.
pub fn current_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("cannot determine hostname, using localhost: {e}");
            "localhost".to_string()
        }
    }
}

impl ContentIndex {
    /// Open (creating if needed) the job cache in `dir`, tagging new records
    /// with this machine's hostname.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, IndexError> {
        Self::open_as(dir, current_hostname())
    }

    /// Open the job cache in `dir`, tagging new records with `host`.
    pub fn open_as(dir: impl AsRef<Path>, host: impl Into<String>) -> Result<Self, IndexError> {
        let dir = dir.as_ref();
        if dir.exists() && !dir.is_dir() {
            return Err(IndexError::NotADirectory(dir.to_path_buf()));
        }
        fs::create_dir_all(dir)?;
        let mut index = Self {
            dir: dir.to_path_buf(),
            log_path: dir.join(LOG_FILE),
            host: host.into(),
            log: None,
            offsets: HashMap::new(),
            records: 0,
            skipped: 0,
            sorted: true,
            sorter: ExternalSorter::new(),
        };
        index.acquire()?;
        index.rebuild()?;
        info!(
            records = index.records,
            digests = index.offsets.len(),
            "opened job cache {}",
            dir.display()
        );
        Ok(index)
    }

    /// Use `sorter` when the log has to be put in digest order.
    pub fn with_sorter(mut self, sorter: ExternalSorter) -> Self {
        self.sorter = sorter;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Number of readable records in the log.
    pub fn len(&self) -> u64 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Number of distinct digests.
    pub fn digest_count(&self) -> usize {
        self.offsets.len()
    }

    /// Malformed lines passed over by the last scan.
    pub fn skipped_records(&self) -> u64 {
        self.skipped
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.offsets.contains_key(digest)
    }

    /// Every location recorded for `digest`.
    pub fn lookup(&self, digest: &str) -> Result<BTreeSet<Location>, IndexError> {
        let mut found = BTreeSet::new();
        let Some(offsets) = self.offsets.get(digest) else {
            return Ok(found);
        };
        let mut reader = BufReader::new(self.handle()?);
        let mut line = Vec::new();
        for &offset in offsets {
            reader.seek(SeekFrom::Start(offset))?;
            line.clear();
            reader.read_until(b'\n', &mut line)?;
            let decoded =
                record::decode(&line).map_err(|source| IndexError::Corrupt { offset, source })?;
            found.insert(decoded.location());
        }
        Ok(found)
    }

    /// Append an observation of `path` with content `digest` on this host.
    pub fn add(&mut self, path: &Path, digest: &str) -> Result<(), IndexError> {
        let line = Record::new(digest, path, self.host.as_str()).encode()?;
        let mut log = self.handle()?;
        let offset = log.metadata()?.len();
        // One write per record, so a crash can only tear the final line.
        log.write_all(&line)?;
        self.offsets
            .entry(digest.to_string())
            .or_default()
            .push(offset);
        self.records += 1;
        self.sorted = false;
        Ok(())
    }

    /// Digests seen at more than one distinct location, leaving out any digest
    /// in `ignore`. Sorts the log first if it is not known to be sorted.
    pub fn get_duplicates(&mut self, ignore: &BTreeSet<String>) -> Result<DuplicateGroups, IndexError> {
        if !self.sorted {
            self.sort()?;
        }
        info!(
            records = self.records,
            digests = self.offsets.len(),
            "grouping job cache"
        );

        let mut groups = DuplicateGroups::new();
        // A separate handle, so lookups made while closing a run do not move
        // this reader's file position.
        let mut reader = BufReader::new(File::open(&self.log_path)?);

        let mut run: Option<(String, u64, BTreeSet<Location>)> = None;
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            let Ok(decoded) = record::decode(&line) else {
                continue;
            };
            match run.as_mut() {
                Some((digest, count, locations)) if digest.as_str() == decoded.digest() => {
                    *count += 1;
                    locations.insert(decoded.location());
                    continue;
                }
                _ => {}
            }
            if let Some(done) = run.take() {
                self.close_run(done, ignore, &mut groups)?;
            }
            run = Some((
                decoded.digest().to_string(),
                1,
                BTreeSet::from([decoded.location()]),
            ));
        }
        if let Some(done) = run.take() {
            self.close_run(done, ignore, &mut groups)?;
        }
        debug!(groups = groups.len(), "duplicate groups resolved");
        Ok(groups)
    }

    /// Remove every record of `host` whose path lies below `prefix`. A record
    /// for `prefix` itself is kept. Returns the number of records dropped.
    pub fn drop_tree(&mut self, host: &str, prefix: &Path) -> Result<u64, IndexError> {
        let dropped = self.rewrite(|decoded| {
            let location = decoded.location();
            if location.host == host
                && location.path != prefix
                && location.path.starts_with(prefix)
            {
                Rewrite::Drop
            } else {
                Rewrite::Keep
            }
        })?;
        info!(dropped, "dropped {}:{} from job cache", host, prefix.display());
        Ok(dropped)
    }

    /// Give every record without a host `default_host`. Returns the number of
    /// records migrated.
    pub fn set_unknown_hostnames(&mut self, default_host: &str) -> Result<u64, IndexError> {
        let migrated = self.rewrite(|decoded| match decoded {
            Decoded::Unhosted(r) => Rewrite::Replace(r.with_host(default_host)),
            Decoded::Current(_) => Rewrite::Keep,
        })?;
        info!(migrated, "assigned host {default_host} to unhosted records");
        Ok(migrated)
    }

    /// Truncate the log and forget every record.
    pub fn clear(&mut self) -> Result<(), IndexError> {
        self.replace_log(|path| {
            File::create(path)?;
            Ok(())
        })?;
        info!("cleared job cache {}", self.dir.display());
        Ok(())
    }

    /// Flush the log to stable storage.
    pub fn close(mut self) -> Result<(), IndexError> {
        if let Some(log) = self.log.take() {
            log.sync_all()?;
        }
        Ok(())
    }

    fn handle(&self) -> Result<&File, IndexError> {
        self.log.as_ref().ok_or(IndexError::Closed)
    }

    fn acquire(&mut self) -> Result<(), IndexError> {
        let log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.log_path)?;
        self.log = Some(log);
        Ok(())
    }

    fn rebuild(&mut self) -> Result<(), IndexError> {
        let log = self.handle()?;
        let scan = scan_log(log)?;
        if let Some(torn_at) = scan.torn_at {
            warn!(
                offset = torn_at,
                "discarding incomplete final record in {}",
                self.log_path.display()
            );
            log.set_len(torn_at)?;
        }
        if scan.skipped > 0 {
            warn!(
                skipped = scan.skipped,
                "skipped malformed records in {}",
                self.log_path.display()
            );
        }
        self.offsets = scan.offsets;
        self.records = scan.records;
        self.skipped = scan.skipped;
        self.sorted = scan.sorted;
        Ok(())
    }

    /// Release the log, let `replace` swap the file at the log path, then
    /// reacquire and rescan it. The log is reacquired even if `replace` fails.
    fn replace_log<F>(&mut self, replace: F) -> Result<(), IndexError>
    where
        F: FnOnce(&Path) -> Result<(), IndexError>,
    {
        let released = match self.log.take() {
            Some(log) => log.sync_all(),
            None => Ok(()),
        };
        let outcome = released
            .map_err(IndexError::from)
            .and_then(|()| replace(&self.log_path));
        self.acquire()?;
        self.rebuild()?;
        outcome
    }

    fn sort(&mut self) -> Result<(), IndexError> {
        let sorter = self.sorter.clone();
        self.replace_log(|path| {
            sorter.sort(path, path)?;
            Ok(())
        })
    }

    /// Rewrite the log through `decide`, returning how many records were
    /// dropped or replaced. Lines that do not decode are carried over as is.
    fn rewrite<F>(&mut self, mut decide: F) -> Result<u64, IndexError>
    where
        F: FnMut(Decoded) -> Rewrite,
    {
        let dir = self.dir.clone();
        let mut changed = 0u64;
        self.replace_log(|path| {
            let mut reader = BufReader::new(File::open(path)?);
            let mut staged = tempfile::NamedTempFile::new_in(&dir)?;
            {
                let mut out = BufWriter::new(staged.as_file_mut());
                let mut line = Vec::new();
                loop {
                    line.clear();
                    if reader.read_until(b'\n', &mut line)? == 0 {
                        break;
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match record::decode(&line).map(&mut decide) {
                        Ok(Rewrite::Keep) | Err(_) => out.write_all(&line)?,
                        Ok(Rewrite::Drop) => changed += 1,
                        Ok(Rewrite::Replace(record)) => {
                            out.write_all(&record.encode()?)?;
                            changed += 1;
                        }
                    }
                }
                out.flush()?;
            }
            staged.as_file().sync_all()?;
            staged.persist(path).map_err(|e| e.error)?;
            Ok(())
        })?;
        Ok(changed)
    }

    fn close_run(
        &self,
        (digest, count, locations): (String, u64, BTreeSet<Location>),
        ignore: &BTreeSet<String>,
        groups: &mut DuplicateGroups,
    ) -> Result<(), IndexError> {
        if ignore.contains(&digest) {
            return Ok(());
        }
        let indexed = self.offsets.get(&digest).map_or(0, Vec::len) as u64;
        // A run shorter than the index entry means the digest is not
        // contiguous in the log, so gather it through the index instead.
        let locations = if count == indexed {
            locations
        } else {
            self.lookup(&digest)?
        };
        if locations.len() > 1 {
            groups.insert(digest, locations);
        }
        Ok(())
    }
}

fn scan_log(log: &File) -> Result<Scan, IndexError> {
    let mut reader = BufReader::new(log);
    reader.seek(SeekFrom::Start(0))?;
    let mut scan = Scan {
        offsets: HashMap::new(),
        records: 0,
        skipped: 0,
        sorted: true,
        torn_at: None,
    };
    let mut offset = 0u64;
    let mut line = Vec::new();
    let mut previous = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        let start = offset;
        offset += n as u64;
        if line.last() != Some(&b'\n') {
            scan.torn_at = Some(start);
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match record::decode(&line) {
            Ok(decoded) => {
                if line < previous {
                    scan.sorted = false;
                }
                scan.offsets
                    .entry(decoded.digest().to_string())
                    .or_default()
                    .push(start);
                scan.records += 1;
                std::mem::swap(&mut previous, &mut line);
            }
            Err(e) => {
                debug!(offset = start, "malformed record: {e}");
                scan.skipped += 1;
            }
        }
    }
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UNKNOWN_HOST;

    fn set<const N: usize>(items: [(&str, &str); N]) -> BTreeSet<Location> {
        items
            .into_iter()
            .map(|(host, path)| Location::new(host, path))
            .collect()
    }

    #[test]
    fn round_trip_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "alpha").unwrap();
        index.add(Path::new("/data/a"), "aa").unwrap();
        index.add(Path::new("/data/b"), "bb").unwrap();
        index.add(Path::new("/data/c"), "aa").unwrap();
        assert_eq!(index.lookup("aa").unwrap(), set([("alpha", "/data/a"), ("alpha", "/data/c")]));
        index.close().unwrap();

        let index = ContentIndex::open_as(dir.path(), "beta").unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.digest_count(), 2);
        assert!(index.contains("bb"));
        assert!(!index.contains("cc"));
        assert_eq!(index.lookup("aa").unwrap(), set([("alpha", "/data/a"), ("alpha", "/data/c")]));
        assert_eq!(index.lookup("bb").unwrap(), set([("alpha", "/data/b")]));
        assert!(index.lookup("cc").unwrap().is_empty());
    }

    #[test]
    fn path_with_comma_survives() {
        let dir = tempfile::tempdir().unwrap();
        let weird = Path::new("/photos/2023,summer/img,01.jpg");
        let mut index = ContentIndex::open_as(dir.path(), "h").unwrap();
        index.add(weird, "d1").unwrap();
        index.close().unwrap();

        let index = ContentIndex::open_as(dir.path(), "h").unwrap();
        let found = index.lookup("d1").unwrap();
        assert_eq!(found.into_iter().next().unwrap().path, weird);
    }

    #[test]
    fn duplicates_sort_the_log_and_match_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "h")
            .unwrap()
            .with_sorter(ExternalSorter::new().with_workers(3).with_partition_limit(256));
        for i in 0..300u32 {
            let digest = format!("{:04x}", (i * 7919) % 250);
            index.add(Path::new(&format!("/f/{i}")), &digest).unwrap();
        }
        assert!(!index.is_sorted());

        let groups = index.get_duplicates(&BTreeSet::new()).unwrap();
        assert!(index.is_sorted());
        assert_eq!(index.len(), 300);
        assert_eq!(groups.len(), 50);
        for (digest, locations) in &groups {
            assert_eq!(&index.lookup(digest).unwrap(), locations);
            assert_eq!(locations.len(), 2);
        }

        let text = fs::read_to_string(index.log_path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert!(lines.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "h").unwrap();
        for (path, digest) in [("/b", "x"), ("/a", "x"), ("/c", "y"), ("/d", "z"), ("/e", "z")] {
            index.add(Path::new(path), digest).unwrap();
        }
        index.close().unwrap();

        let first = ContentIndex::open_as(dir.path(), "h")
            .unwrap()
            .get_duplicates(&BTreeSet::new())
            .unwrap();
        let second = ContentIndex::open_as(dir.path(), "h")
            .unwrap()
            .get_duplicates(&BTreeSet::new())
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn ignored_digests_and_repeat_locations_are_not_groups() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "h").unwrap();
        index.add(Path::new("/same"), "rep").unwrap();
        index.add(Path::new("/same"), "rep").unwrap();
        index.add(Path::new("/one"), "ign").unwrap();
        index.add(Path::new("/two"), "ign").unwrap();
        index.add(Path::new("/x"), "dup").unwrap();
        index.add(Path::new("/y"), "dup").unwrap();

        let ignore = BTreeSet::from(["ign".to_string()]);
        let groups = index.get_duplicates(&ignore).unwrap();
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["dup"]);
    }

    #[test]
    fn hosts_keep_locations_apart() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "one").unwrap();
        index.add(Path::new("/shared/file"), "d").unwrap();
        index.close().unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "two").unwrap();
        index.add(Path::new("/shared/file"), "d").unwrap();

        let groups = index.get_duplicates(&BTreeSet::new()).unwrap();
        assert_eq!(groups["d"], set([("one", "/shared/file"), ("two", "/shared/file")]));
    }

    #[test]
    fn drop_tree_only_touches_matching_host_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "H").unwrap();
        index.add(Path::new("/x/y/1"), "y1").unwrap();
        index.add(Path::new("/x/y/deep/2"), "y2").unwrap();
        index.add(Path::new("/x/z/1"), "z1").unwrap();
        index.add(Path::new("/x/yy/1"), "yy1").unwrap();
        index.close().unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "G").unwrap();
        index.add(Path::new("/x/y/1"), "g1").unwrap();

        let dropped = index.drop_tree("H", Path::new("/x/y")).unwrap();
        assert_eq!(dropped, 2);
        assert!(!index.contains("y1"));
        assert!(!index.contains("y2"));
        assert!(index.contains("z1"));
        assert!(index.contains("yy1"));
        assert!(index.contains("g1"));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn drop_tree_keeps_the_prefix_itself() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "H").unwrap();
        index.add(Path::new("/x/y"), "file").unwrap();
        index.add(Path::new("/x/y/under"), "below").unwrap();

        assert_eq!(index.drop_tree("H", Path::new("/x/y")).unwrap(), 1);
        assert!(index.contains("file"));
        assert!(!index.contains("below"));
    }

    #[test]
    fn failed_sort_keeps_the_log_and_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "h")
            .unwrap()
            .with_sorter(ExternalSorter::new().with_scratch_dir(dir.path().join("missing")));
        index.add(Path::new("/c"), "cc").unwrap();
        index.add(Path::new("/a"), "aa").unwrap();
        index.add(Path::new("/a2"), "aa").unwrap();
        let before = fs::read(index.log_path()).unwrap();

        let err = index.get_duplicates(&BTreeSet::new()).unwrap_err();
        assert!(matches!(err, IndexError::Sort(_)));
        assert_eq!(fs::read(index.log_path()).unwrap(), before);
        assert!(!index.is_sorted());
        assert_eq!(index.lookup("aa").unwrap(), set([("h", "/a"), ("h", "/a2")]));

        index.add(Path::new("/b"), "bb").unwrap();
        assert!(index.contains("bb"));
        let mut index = index.with_sorter(ExternalSorter::new());
        let groups = index.get_duplicates(&BTreeSet::new()).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn unhosted_records_are_migrated() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(LOG_FILE),
            concat!(
                "{\"digest\":\"aa\",\"path\":\"/old/1\"}\n",
                "{\"digest\":\"aa\",\"path\":\"/new/1\",\"host\":\"kept\"}\n",
            ),
        )
        .unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "h").unwrap();
        assert_eq!(index.lookup("aa").unwrap(), set([(UNKNOWN_HOST, "/old/1"), ("kept", "/new/1")]));

        assert_eq!(index.set_unknown_hostnames("legacy").unwrap(), 1);
        assert_eq!(index.lookup("aa").unwrap(), set([("legacy", "/old/1"), ("kept", "/new/1")]));
        assert_eq!(index.set_unknown_hostnames("legacy").unwrap(), 0);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(LOG_FILE),
            concat!(
                "{\"digest\":\"aa\",\"path\":\"/1\",\"host\":\"h\"}\n",
                "this is not a record\n",
                "\n",
                "{\"digest\":\"aa\",\"path\":\"/2\",\"host\":\"h\"}\n",
            ),
        )
        .unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "h").unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.skipped_records(), 1);
        let groups = index.get_duplicates(&BTreeSet::new()).unwrap();
        assert_eq!(groups["aa"], set([("h", "/1"), ("h", "/2")]));
    }

    #[test]
    fn torn_final_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(LOG_FILE);
        fs::write(
            &log,
            "{\"digest\":\"aa\",\"path\":\"/1\",\"host\":\"h\"}\n{\"digest\":\"bb\",\"pa",
        )
        .unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "h").unwrap();
        assert_eq!(index.len(), 1);
        index.add(Path::new("/2"), "cc").unwrap();
        index.close().unwrap();

        let index = ContentIndex::open_as(dir.path(), "h").unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.skipped_records(), 0);
        assert_eq!(index.lookup("cc").unwrap(), set([("h", "/2")]));
    }

    #[test]
    fn clear_empties_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ContentIndex::open_as(dir.path(), "h").unwrap();
        index.add(Path::new("/a"), "aa").unwrap();
        index.clear().unwrap();
        assert!(index.is_empty());
        assert!(!index.contains("aa"));
        assert_eq!(fs::metadata(index.log_path()).unwrap().len(), 0);
        index.add(Path::new("/b"), "bb").unwrap();
        assert_eq!(index.lookup("bb").unwrap(), set([("h", "/b")]));
    }

    #[test]
    fn rejects_a_file_as_store() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"").unwrap();
        assert!(matches!(
            ContentIndex::open_as(&file, "h"),
            Err(IndexError::NotADirectory(_))
        ));
    }
}
