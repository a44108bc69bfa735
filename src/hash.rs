use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

const READ_CHUNK_BYTES: usize = 2 * 1024 * 1024; // 2 MB

/// Computes the content digest of a file.
///
/// Digests are lower-case hex strings. A store must be written with a single
/// function for its whole lifetime, otherwise equal content will not group.
pub trait HashFunction: Send + Sync {
    fn digest(&self, path: &Path) -> io::Result<String>;
}

impl<F> HashFunction for F
where
    F: Fn(&Path) -> io::Result<String> + Send + Sync,
{
    fn digest(&self, path: &Path) -> io::Result<String> {
        self(path)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha1,
    Md5,
    Blake3,
}

impl HashFunction for HashAlgorithm {
    fn digest(&self, path: &Path) -> io::Result<String> {
        match self {
            HashAlgorithm::Sha256 => digest_with(sha2::Sha256::new(), path),
            HashAlgorithm::Sha1 => digest_with(sha1::Sha1::new(), path),
            HashAlgorithm::Md5 => digest_with(md5::Md5::new(), path),
            HashAlgorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                stream_file(path, |chunk| {
                    hasher.update(chunk);
                })?;
                Ok(hasher.finalize().to_hex().to_string())
            }
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Blake3 => "blake3",
        };
        f.write_str(name)
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "md5" => Ok(HashAlgorithm::Md5),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(format!(
                "unknown hash algorithm {other:?} (expected sha256, sha1, md5 or blake3)"
            )),
        }
    }
}

fn digest_with<D: Digest>(mut hasher: D, path: &Path) -> io::Result<String> {
    stream_file(path, |chunk| hasher.update(chunk))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Feed the entire file content to `update`, one chunk at a time.
fn stream_file(path: &Path, mut update: impl FnMut(&[u8])) -> io::Result<()> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        update(&buf[..n]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, content).unwrap();
        file
    }

    #[test]
    fn known_digests() {
        let file = write_temp(b"abc");
        assert_eq!(
            HashAlgorithm::Sha256.digest(file.path()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            HashAlgorithm::Sha1.digest(file.path()).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            HashAlgorithm::Md5.digest(file.path()).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            HashAlgorithm::Blake3.digest(file.path()).unwrap(),
            blake3::hash(b"abc").to_hex().to_string()
        );
    }

    #[test]
    fn large_file_spans_chunks() {
        let content = vec![0x5au8; READ_CHUNK_BYTES * 2 + 17];
        let file = write_temp(&content);
        let expected = hex::encode(sha2::Sha256::digest(&content));
        assert_eq!(HashAlgorithm::Sha256.digest(file.path()).unwrap(), expected);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = HashAlgorithm::Sha256
            .digest(&dir.path().join("absent"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn parses_names() {
        assert_eq!("SHA-256".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha256));
        assert_eq!("md5".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Md5));
        assert!("crc32".parse::<HashAlgorithm>().is_err());
        assert_eq!(HashAlgorithm::Blake3.to_string(), "blake3");
    }
}
