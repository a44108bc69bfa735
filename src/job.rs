use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hashdupe::{ContentIndex, ExternalSorter, HashAlgorithm};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::Settings;

const META_FILE: &str = "job.yaml";

/// Facts about a job cache that must not change once records exist.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobMeta {
    pub algorithm: HashAlgorithm,
    pub created: DateTime<Utc>,
}

impl JobMeta {
    pub fn read(job_path: &Path) -> Result<Option<Self>> {
        let path = job_path.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let meta = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(meta))
    }

    fn write(&self, job_path: &Path) -> Result<()> {
        let path = job_path.join(META_FILE);
        fs::write(&path, serde_yaml::to_string(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }
}

/// An opened job cache together with the hash function it is keyed by.
pub struct Job {
    pub name: String,
    pub path: PathBuf,
    pub algorithm: HashAlgorithm,
    pub index: ContentIndex,
}

impl Job {
    /// Open the job called `name`, creating it when `create` is set.
    pub fn open(settings: &Settings, name: &str, create: bool) -> Result<Self> {
        let path = settings.job_path(name)?;
        if !create && !path.is_dir() {
            bail!("no job named {name:?} in {}", settings.job_root.display());
        }
        debug!("using job path {}", path.display());

        let existing = JobMeta::read(&path)?;
        let algorithm = match (&existing, settings.algorithm) {
            (Some(meta), Some(requested)) if meta.algorithm != requested => bail!(
                "job {name:?} was hashed with {}, not {requested}",
                meta.algorithm
            ),
            (Some(meta), _) => meta.algorithm,
            (None, requested) => requested.unwrap_or_default(),
        };

        let mut sorter = ExternalSorter::new();
        if let Some(workers) = settings.workers {
            sorter = sorter.with_workers(workers);
        }
        if let Some(dir) = &settings.scratch_dir {
            sorter = sorter.with_scratch_dir(dir);
        }
        let index = ContentIndex::open(&path)
            .with_context(|| format!("opening job cache {}", path.display()))?
            .with_sorter(sorter);

        if existing.is_none() {
            JobMeta {
                algorithm,
                created: Utc::now(),
            }
            .write(&path)?;
            info!(%algorithm, "created job {name}");
        }

        Ok(Self {
            name: name.to_string(),
            path,
            algorithm,
            index,
        })
    }

    pub fn close(self) -> Result<()> {
        self.index
            .close()
            .with_context(|| format!("closing job {}", self.name))
    }
}
