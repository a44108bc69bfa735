use anyhow::{Context, Result};
use hashdupe::DuplicateReport;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::cli::ReportArgs;
use crate::config::Settings;
use crate::job::Job;

pub fn run(args: &ReportArgs, settings: &Settings) -> Result<()> {
    let mut job = Job::open(settings, &args.job, false)?;
    let ignore: BTreeSet<String> = settings
        .ignored_digests(&args.ignore_hash)
        .into_iter()
        .collect();
    let report = DuplicateReport {
        groups: job.index.get_duplicates(&ignore)?,
    };
    write_duplicates(&report, args.output.as_deref())?;
    job.close()
}

/// Write `report` to `dest`, or stdout, and summarise it on stderr.
pub fn write_duplicates(report: &DuplicateReport, dest: Option<&Path>) -> Result<()> {
    let mut out = open_output(dest)?;
    report.write_to(&mut out)?;
    out.flush()?;
    eprintln!(
        "{} duplicate groups, {} redundant copies",
        report.groups.len(),
        report.redundant_copies()
    );
    Ok(())
}

/// A file at `dest`, or stdout when there is none.
pub fn open_output(dest: Option<&Path>) -> Result<Box<dyn Write>> {
    match dest {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("creating {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(io::stdout().lock())),
    }
}
