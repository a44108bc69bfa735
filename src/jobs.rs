use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use hashdupe::index::{current_hostname, LOG_FILE};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::cli::{DropTreeArgs, ExportArgs, ImportArgs, SetHostsArgs};
use crate::config::Settings;
use crate::job::{Job, JobMeta};

pub fn drop_tree(args: &DropTreeArgs, settings: &Settings) -> Result<()> {
    let mut job = Job::open(settings, &args.job, false)?;
    let host = args.host.clone().unwrap_or_else(current_hostname);
    // Only this machine's paths can be resolved; other hosts' are taken as given.
    let prefix = if host == job.index.host() && args.directory.exists() {
        args.directory.canonicalize()?
    } else {
        args.directory.clone()
    };
    let dropped = job.index.drop_tree(&host, &prefix)?;
    println!(
        "Dropped {} records of {}:{} from job {}",
        dropped,
        host,
        prefix.display(),
        job.name
    );
    job.close()
}

pub fn set_hosts(args: &SetHostsArgs, settings: &Settings) -> Result<()> {
    let mut job = Job::open(settings, &args.job, false)?;
    let host = args.host.clone().unwrap_or_else(current_hostname);
    let migrated = job.index.set_unknown_hostnames(&host)?;
    println!("Assigned host {} to {} records in job {}", host, migrated, job.name);
    job.close()
}

pub fn export(args: &ExportArgs, settings: &Settings) -> Result<()> {
    let job = Job::open(settings, &args.job, false)?;
    fs::copy(job.index.log_path(), &args.output)
        .with_context(|| format!("exporting to {}", args.output.display()))?;
    println!(
        "Exported {} records from job {} to {}",
        job.index.len(),
        job.name,
        args.output.display()
    );
    job.close()
}

pub fn import(args: &ImportArgs, settings: &Settings) -> Result<()> {
    let path = settings.job_path(&args.name)?;
    if path.exists() {
        if !args.overwrite {
            bail!("a job named {:?} already exists (use --overwrite)", args.name);
        }
        fs::remove_dir_all(&path).with_context(|| format!("removing {}", path.display()))?;
    }
    fs::create_dir_all(&path)?;
    fs::copy(&args.input, path.join(LOG_FILE))
        .with_context(|| format!("importing {}", args.input.display()))?;

    let job = Job::open(settings, &args.name, false)?;
    if job.index.skipped_records() > 0 {
        eprintln!(
            "{} malformed lines in {} were not imported",
            job.index.skipped_records(),
            args.input.display()
        );
    }
    println!("Imported {} records as job {}", job.index.len(), job.name);
    job.close()
}

pub fn list(settings: &Settings) -> Result<()> {
    let root = &settings.job_root;
    if !root.is_dir() {
        println!("No jobs in {}", root.display());
        return Ok(());
    }
    let mut jobs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    jobs.sort();

    println!("Jobs in {}:", root.display());
    for path in &jobs {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        let log = path.join(LOG_FILE);
        let records = count_records(&log)?;
        let algorithm = JobMeta::read(path)?
            .map(|meta| meta.algorithm.to_string())
            .unwrap_or_else(|| "?".to_string());
        let modified = fs::metadata(&log)
            .and_then(|m| m.modified())
            .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|_| "-".to_string());
        println!("  {:24}  {:>10} records  {:7}  {}", name, records, algorithm, modified);
    }
    Ok(())
}

/// Non-blank lines of a record log, without opening it as a job.
fn count_records(log: &Path) -> Result<u64> {
    let file = match fs::File::open(log) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("reading {}", log.display())),
    };
    let mut count = 0;
    for line in BufReader::new(file).split(b'\n') {
        if !line?.iter().all(u8::is_ascii_whitespace) {
            count += 1;
        }
    }
    Ok(count)
}
