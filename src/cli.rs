use clap::{Args, Parser, Subcommand, ValueEnum};
use hashdupe::HashAlgorithm;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "hashdupe",
    version,
    about = "Find and remove duplicate files across machines"
)]
pub struct Cli {
    /// Directory holding the job caches (default: platform data directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub job_dir: Option<PathBuf>,

    /// Content hash: sha256, sha1, md5 or blake3
    #[arg(long, global = true)]
    pub algorithm: Option<HashAlgorithm>,

    /// Number of hashing threads
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Show a live progress screen while hashing
    #[arg(long, global = true)]
    pub tui: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Hash directories into a job cache and report duplicates
    Analyze(AnalyzeArgs),
    /// Delete files whose content the job cache already holds elsewhere
    Delete(DeleteArgs),
    /// Report duplicates already recorded in a job cache
    Report(ReportArgs),
    /// Forget every record of a host under a directory
    DropTree(DropTreeArgs),
    /// Assign a host to records written without one
    SetHosts(SetHostsArgs),
    /// Copy a job cache's record log to a file
    ExportCache(ExportArgs),
    /// Create a job from an exported record log
    ImportCache(ImportArgs),
    /// List job caches
    ListJobs,
    /// Convert a comma-separated legacy log into a job cache
    UpgradeCache(UpgradeArgs),
}

#[derive(Args)]
pub struct FilterArgs {
    /// File of regular expressions; matching paths are not hashed
    #[arg(short, long, value_name = "FILE")]
    pub exclude: Option<PathBuf>,

    /// Glob patterns; matching paths are not hashed
    #[arg(long, value_name = "GLOB")]
    pub exclude_glob: Vec<String>,
}

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Directories to analyze
    #[arg(short, long = "directory", value_name = "DIR", required = true)]
    pub directories: Vec<PathBuf>,

    /// Name of the job cache
    #[arg(short, long)]
    pub job: String,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Clear the job cache before analyzing
    #[arg(long)]
    pub clear_cache: bool,

    /// Do not ask before clearing the job cache
    #[arg(short, long)]
    pub yes: bool,

    /// Write the report here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Digests never reported as duplicates
    #[arg(long, value_name = "DIGEST")]
    pub ignore_hash: Vec<String>,
}

#[derive(Args)]
pub struct DeleteArgs {
    /// Directory to clean up
    #[arg(short, long, value_name = "DIR")]
    pub directory: PathBuf,

    /// Name of the job cache
    #[arg(short, long)]
    pub job: String,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Show what would be deleted without deleting
    #[arg(long)]
    pub dry_run: bool,

    /// Write a shell script that deletes the files instead of deleting them
    #[arg(long, value_name = "FILE", conflicts_with = "dry_run")]
    pub script: Option<PathBuf>,

    /// Shell for --script (default: the platform's)
    #[arg(long, value_enum, requires = "script")]
    pub shell: Option<Shell>,

    /// Write the deletion report here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Shell {
    Sh,
    Cmd,
    Ps,
}

#[derive(Args)]
pub struct ReportArgs {
    /// Name of the job cache
    #[arg(short, long)]
    pub job: String,

    /// Write the report here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Digests never reported as duplicates
    #[arg(long, value_name = "DIGEST")]
    pub ignore_hash: Vec<String>,
}

#[derive(Args)]
pub struct DropTreeArgs {
    /// Name of the job cache
    #[arg(short, long)]
    pub job: String,

    /// Directory whose records are dropped
    #[arg(short, long, value_name = "DIR")]
    pub directory: PathBuf,

    /// Host the directory belongs to (default: this machine)
    #[arg(long)]
    pub host: Option<String>,
}

#[derive(Args)]
pub struct SetHostsArgs {
    /// Name of the job cache
    #[arg(short, long)]
    pub job: String,

    /// Host given to records without one (default: this machine)
    #[arg(long)]
    pub host: Option<String>,
}

#[derive(Args)]
pub struct ExportArgs {
    /// Name of the job cache
    #[arg(short, long)]
    pub job: String,

    /// Destination file
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct ImportArgs {
    /// Exported record log
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// Job name to import as
    #[arg(short, long)]
    pub name: String,

    /// Replace an existing job of the same name
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Args)]
pub struct UpgradeArgs {
    /// Name of the job cache to write
    #[arg(short, long)]
    pub job: String,

    /// Legacy log (default: hashes.csv in the job directory)
    #[arg(short, long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Release that wrote the legacy log
    #[arg(short, long)]
    pub format: LegacyVersion,

    /// Host given to lines without a host column (default: this machine)
    #[arg(long)]
    pub fill_host: Option<String>,

    /// Hostnames that mark a trailing host column in v0.7 logs
    #[arg(long, value_name = "HOST", required_if_eq("format", "v0.7"))]
    pub accept: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LegacyVersion {
    /// digest,path with an optional host column
    #[value(name = "v0.7")]
    V0_7,
    /// digest,path,host
    #[value(name = "v1.2")]
    V1_2,
}
