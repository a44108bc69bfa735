use anyhow::{Context, Result};
use hashdupe::index::current_hostname;
use hashdupe::{LegacyFormat, LegacyLine};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use tracing::warn;

use crate::cli::{LegacyVersion, UpgradeArgs};
use crate::config::Settings;
use crate::job::Job;

/// Comma-separated log kept by releases before JSON records.
const LEGACY_FILE: &str = "hashes.csv";

pub fn run(args: &UpgradeArgs, settings: &Settings) -> Result<()> {
    let job_path = settings.job_path(&args.job)?;
    let default_input = job_path.join(LEGACY_FILE);
    let input = args.input.clone().unwrap_or_else(|| default_input.clone());
    let legacy = File::open(&input).with_context(|| format!("opening {}", input.display()))?;

    // Opening first repairs a torn tail before new lines are appended.
    let job = Job::open(settings, &args.job, true)?;
    let log_path = job.index.log_path().to_path_buf();
    job.close()?;

    let fill_host = args.fill_host.clone().unwrap_or_else(current_hostname);
    let format = match args.format {
        LegacyVersion::V0_7 => LegacyFormat::V0_7 {
            known_hosts: args.accept.clone(),
        },
        LegacyVersion::V1_2 => LegacyFormat::V1_2,
    };
    let log = OpenOptions::new().append(true).open(&log_path)?;
    let mut out = BufWriter::new(log);
    let (mut converted, mut rejected) = (0u64, 0u64);
    for (n, line) in BufReader::new(legacy).split(b'\n').enumerate() {
        let line = line?;
        let line = String::from_utf8_lossy(&line);
        if line.trim().is_empty() {
            continue;
        }
        match LegacyLine::parse(&line, &format) {
            Ok(legacy) => {
                out.write_all(&legacy.into_record(&fill_host).encode()?)?;
                converted += 1;
            }
            Err(e) => {
                warn!(line = n + 1, "skipping legacy record: {e}");
                rejected += 1;
            }
        }
    }
    out.flush()?;
    out.get_ref().sync_all()?;
    drop(out);

    if input == default_input {
        let backup = job_path.join(format!("{LEGACY_FILE}.bak"));
        fs::rename(&input, &backup)
            .with_context(|| format!("moving {} aside", input.display()))?;
    }

    let job = Job::open(settings, &args.job, false)?;
    println!(
        "Converted {} records ({} rejected) into job {}, now {} records",
        converted,
        rejected,
        job.name,
        job.index.len()
    );
    job.close()
}
