//! Record log encoding.
//!
//! Each record is one JSON object on its own line, fields in the order
//! `digest`, `path`, `host`. Keeping `digest` first means byte-wise line order
//! is digest order, which the external sort relies on.
//!
//! Two older on-disk shapes still exist in the wild and are decoded here:
//! JSON lines without a `host` field, and the comma-separated format used
//! before records were JSON encoded.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::RecordError;

/// Host recorded for observations written before host tagging.
pub const UNKNOWN_HOST: &str = "";

/// One observation of a file's content on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub digest: String,
    #[serde(with = "path_text")]
    pub path: PathBuf,
    pub host: String,
}

/// Where a digest was observed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub host: String,
    pub path: PathBuf,
}

impl Location {
    pub fn new(host: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }
}

impl Record {
    pub fn new(digest: impl Into<String>, path: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            digest: digest.into(),
            path: path.into(),
            host: host.into(),
        }
    }

    pub fn location(&self) -> Location {
        Location::new(self.host.clone(), self.path.clone())
    }

    /// Encode as a single terminated log line.
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// A log line as stored, before any migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Current(Record),
    Unhosted(UnhostedRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhostedRecord {
    pub digest: String,
    pub path: PathBuf,
}

impl UnhostedRecord {
    pub fn with_host(self, host: impl Into<String>) -> Record {
        Record {
            digest: self.digest,
            path: self.path,
            host: host.into(),
        }
    }
}

impl Decoded {
    pub fn digest(&self) -> &str {
        match self {
            Decoded::Current(r) => &r.digest,
            Decoded::Unhosted(r) => &r.digest,
        }
    }

    pub fn location(&self) -> Location {
        match self {
            Decoded::Current(r) => r.location(),
            Decoded::Unhosted(r) => Location::new(UNKNOWN_HOST, r.path.clone()),
        }
    }

    /// Migrate to the current shape, filling a missing host.
    pub fn into_record(self, default_host: &str) -> Record {
        match self {
            Decoded::Current(r) => r,
            Decoded::Unhosted(r) => r.with_host(default_host),
        }
    }
}

#[derive(Deserialize)]
struct StoredLine {
    digest: String,
    #[serde(with = "path_text")]
    path: PathBuf,
    #[serde(default)]
    host: Option<String>,
}

/// Decode one log line (with or without its terminator).
pub fn decode(line: &[u8]) -> Result<Decoded, RecordError> {
    let stored: StoredLine = serde_json::from_slice(trim_terminator(line))?;
    if stored.digest.is_empty() {
        return Err(RecordError::MissingDigest);
    }
    Ok(match stored.host {
        Some(host) if host != UNKNOWN_HOST => Decoded::Current(Record {
            digest: stored.digest,
            path: stored.path,
            host,
        }),
        _ => Decoded::Unhosted(UnhostedRecord {
            digest: stored.digest,
            path: stored.path,
        }),
    })
}

/// Release family that wrote a comma-separated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyFormat {
    /// `digest,path` lines, some with a trailing host column. A trailing
    /// field is a host only when it is one of `known_hosts`.
    V0_7 { known_hosts: Vec<String> },
    /// `digest,path,host` on every line.
    V1_2,
}

/// A line of the comma-separated log format that predates JSON records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyLine {
    /// `digest,path` (no host column yet).
    Unhosted(UnhostedRecord),
    /// `digest,path,host`.
    Hosted(Record),
}

impl LegacyLine {
    /// Parse a legacy line. The path may itself contain commas, so the
    /// digest is everything up to the first comma and the host, where the
    /// format has one, everything after the last.
    pub fn parse(line: &str, format: &LegacyFormat) -> Result<Self, RecordError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (digest, rest) = line
            .split_once(',')
            .ok_or_else(|| RecordError::LegacyFields(line.to_string()))?;
        if digest.is_empty() {
            return Err(RecordError::MissingDigest);
        }
        match format {
            LegacyFormat::V0_7 { known_hosts } => {
                if let Some((path, host)) = rest.rsplit_once(',') {
                    if known_hosts.iter().any(|h| h == host) {
                        return Ok(LegacyLine::Hosted(Record::new(digest, path, host)));
                    }
                }
                Ok(LegacyLine::Unhosted(UnhostedRecord {
                    digest: digest.to_string(),
                    path: PathBuf::from(rest),
                }))
            }
            LegacyFormat::V1_2 => {
                let (path, host) = rest
                    .rsplit_once(',')
                    .ok_or_else(|| RecordError::LegacyFields(line.to_string()))?;
                if host == UNKNOWN_HOST {
                    return Ok(LegacyLine::Unhosted(UnhostedRecord {
                        digest: digest.to_string(),
                        path: PathBuf::from(path),
                    }));
                }
                Ok(LegacyLine::Hosted(Record::new(digest, path, host)))
            }
        }
    }

    pub fn into_record(self, fill_host: &str) -> Record {
        match self {
            LegacyLine::Hosted(r) => r,
            LegacyLine::Unhosted(r) => r.with_host(fill_host),
        }
    }
}

fn trim_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Slash-separated text for a record path.
pub fn path_to_slash(path: &Path) -> String {
    let text = path.to_string_lossy();
    if cfg!(windows) {
        text.replace('\\', "/")
    } else {
        text.into_owned()
    }
}

/// Paths are stored as plain strings when they are valid UTF-8, and as
/// `{"raw": "<hex bytes>"}` otherwise.
mod path_text {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::path::{Path, PathBuf};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Raw { raw: String },
    }

    pub fn serialize<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match path.to_str() {
            Some(_) => Repr::Text(super::path_to_slash(path)),
            None => Repr::Raw {
                raw: hex::encode(raw_bytes(path)),
            },
        };
        repr.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => Ok(PathBuf::from(text)),
            Repr::Raw { raw } => {
                let bytes = hex::decode(raw).map_err(serde::de::Error::custom)?;
                Ok(from_raw_bytes(bytes))
            }
        }
    }

    #[cfg(unix)]
    fn raw_bytes(path: &Path) -> Vec<u8> {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    }

    #[cfg(not(unix))]
    fn raw_bytes(path: &Path) -> Vec<u8> {
        path.to_string_lossy().into_owned().into_bytes()
    }

    #[cfg(unix)]
    fn from_raw_bytes(bytes: Vec<u8>) -> PathBuf {
        use std::os::unix::ffi::OsStringExt;
        PathBuf::from(std::ffi::OsString::from_vec(bytes))
    }

    #[cfg(not(unix))]
    fn from_raw_bytes(bytes: Vec<u8>) -> PathBuf {
        PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
    }
}
