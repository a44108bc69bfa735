use anyhow::{bail, Context, Result};
use hashdupe::Analyzer;
use std::io::{self, BufRead, Write};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::cli::AnalyzeArgs;
use crate::config::Settings;
use crate::job::Job;
use crate::progress::HashProgress;
use crate::report;

pub fn run(args: &AnalyzeArgs, settings: &Settings) -> Result<()> {
    let missing: Vec<_> = args.directories.iter().filter(|d| !d.is_dir()).collect();
    if !missing.is_empty() {
        bail!("unknown directories {:?}", missing);
    }
    let filter = settings.filter(&args.filter)?;

    if args.clear_cache
        && !args.yes
        && !confirm("Clearing the cache is a destructive operation, proceed? [y/N]: ")?
    {
        return Ok(());
    }

    let mut job = Job::open(settings, &args.job, true)?;
    if args.clear_cache {
        job.index.clear()?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut progress = HashProgress::new(format!("analyzing job {}", job.name), stop.clone());
    progress.start(settings.tui);
    let outcome = {
        let mut analyzer = Analyzer::new(&mut job.index, &job.algorithm)
            .with_filter(filter)
            .with_ignored_digests(settings.ignored_digests(&args.ignore_hash))
            .with_stop_flag(stop);
        if let Some(workers) = settings.workers {
            analyzer = analyzer.with_workers(workers);
        }
        analyzer.analyze(&args.directories, &mut progress)
    };
    progress.finish()?;
    let outcome = outcome.with_context(|| format!("analyzing job {}", args.job))?;

    if outcome.hashing.cancelled {
        eprintln!("Analysis stopped early; the report covers files hashed so far.");
    }
    eprintln!(
        "{} new records in job {} ({} total)",
        outcome.added,
        job.name,
        job.index.len()
    );
    report::write_duplicates(&outcome.duplicates, args.output.as_deref())?;
    job.close()
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt}");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}
