//! Content-addressed duplicate detection across hosts.
//!
//! Files are hashed by a parallel [`pipeline::HashingPipeline`], recorded in a
//! per-job append-only [`index::ContentIndex`], and grouped by digest with the
//! help of an out-of-core [`sort::ExternalSorter`]. The [`analyzer::Analyzer`]
//! ties these together into the `analyze` and `delete` operations.

pub mod analyzer;
pub mod error;
pub mod hash;
pub mod index;
pub mod pipeline;
pub mod record;
pub mod sort;
pub mod walk;

pub use analyzer::{AnalyzeOutcome, Analyzer, DeleteReport, DuplicateReport};
pub use error::{AnalyzerError, FilterError, IndexError, PipelineError, RecordError, SortError};
pub use hash::{HashAlgorithm, HashFunction};
pub use index::{ContentIndex, DuplicateGroups};
pub use pipeline::{FileFailure, HashingPipeline, NoProgress, PipelineSummary, Progress};
pub use record::{LegacyFormat, LegacyLine, Location, Record};
pub use sort::ExternalSorter;
pub use walk::PathFilter;
