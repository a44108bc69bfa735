use anyhow::{Context, Result};
use hashdupe::{Analyzer, DeleteReport};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::cli::{DeleteArgs, Shell};
use crate::config::Settings;
use crate::job::Job;
use crate::progress::HashProgress;
use crate::report;

pub fn run(args: &DeleteArgs, settings: &Settings) -> Result<()> {
    let filter = settings.filter(&args.filter)?;
    let mut job = Job::open(settings, &args.job, false)?;
    let dry_run = args.dry_run || args.script.is_some();

    let stop = Arc::new(AtomicBool::new(false));
    let title = if dry_run { "checking" } else { "deleting" };
    let mut progress = HashProgress::new(format!("{title} against job {}", job.name), stop.clone());
    progress.start(settings.tui);
    let outcome = {
        let mut analyzer = Analyzer::new(&mut job.index, &job.algorithm)
            .with_filter(filter)
            .with_stop_flag(stop);
        if let Some(workers) = settings.workers {
            analyzer = analyzer.with_workers(workers);
        }
        analyzer.delete(&args.directory, dry_run, &mut progress)
    };
    progress.finish()?;
    let deleted = outcome.with_context(|| format!("deleting from {}", args.directory.display()))?;

    for failure in &deleted.failures {
        eprintln!("Could not delete {}: {}", failure.path.display(), failure.error);
    }
    if deleted.hashing.cancelled {
        eprintln!("Stopped early; files not yet hashed were left alone.");
    }

    match &args.script {
        Some(script) => {
            let shell = args.shell.unwrap_or(if cfg!(windows) { Shell::Cmd } else { Shell::Sh });
            write_script(script, shell, &deleted)?;
            eprintln!("{} deletions written to {}", deleted.deleted.len(), script.display());
        }
        None => {
            let mut out = report::open_output(args.output.as_deref())?;
            deleted.write_to(&mut out)?;
            out.flush()?;
            eprintln!(
                "{} redundant files {}",
                deleted.deleted.len(),
                if dry_run { "found (dry run)" } else { "deleted" }
            );
        }
    }
    job.close()
}

/// Write a script that removes every redundant file of `report`.
fn write_script(dest: &Path, shell: Shell, report: &DeleteReport) -> Result<()> {
    let file = fs::File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    let mut out = BufWriter::new(file);
    if shell == Shell::Sh {
        writeln!(out, "#!/bin/sh")?;
    }
    for (path, digest) in &report.deleted {
        writeln!(out, "{}", delete_line(shell, &path.display().to_string(), digest))?;
    }
    out.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dest, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn delete_line(shell: Shell, path: &str, digest: &str) -> String {
    match shell {
        Shell::Sh => format!("rm -f '{}' # {}", path.replace('\'', r"'\''"), digest),
        Shell::Cmd => format!("del /f \"{}\" &:: {}", path, digest),
        Shell::Ps => format!(
            "Remove-Item -LiteralPath '{}' -Force # {}",
            path.replace('\'', "''"),
            digest
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_lines_quote_paths() {
        assert_eq!(
            delete_line(Shell::Sh, "/data/it's.txt", "ab"),
            r"rm -f '/data/it'\''s.txt' # ab"
        );
        assert_eq!(
            delete_line(Shell::Ps, "C:\\o'k.txt", "ab"),
            "Remove-Item -LiteralPath 'C:\\o''k.txt' -Force # ab"
        );
        assert_eq!(
            delete_line(Shell::Cmd, "C:\\a b.txt", "ab"),
            "del /f \"C:\\a b.txt\" &:: ab"
        );
    }
}
