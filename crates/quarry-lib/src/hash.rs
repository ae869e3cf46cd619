use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::Result;

const READ_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Full digest record for a file. All fields are populated when a hash is
/// recorded in the cache index; `size` must match the on-disk size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    pub size: u64,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

/// Which digests to compute in a single pass.
#[derive(Debug, Clone, Copy)]
pub struct Algorithms {
    pub md5: bool,
    pub sha1: bool,
    pub sha256: bool,
}

impl Algorithms {
    pub const ALL: Algorithms = Algorithms {
        md5: true,
        sha1: true,
        sha256: true,
    };

    pub const SHA256_ONLY: Algorithms = Algorithms {
        md5: false,
        sha1: false,
        sha256: true,
    };
}

/// Streaming digests over a file, computed in one read pass.
///
/// Digests that were not requested come back as empty strings. Deterministic
/// for a stable file; only I/O errors propagate.
pub fn hash_file_sync(path: &Path, algos: Algorithms) -> Result<FileHash> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];

    let mut md5 = algos.md5.then(Md5::new);
    let mut sha1 = algos.sha1.then(Sha1::new);
    let mut sha256 = algos.sha256.then(Sha256::new);
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        let chunk = &buffer[..n];
        if let Some(h) = md5.as_mut() {
            h.update(chunk);
        }
        if let Some(h) = sha1.as_mut() {
            h.update(chunk);
        }
        if let Some(h) = sha256.as_mut() {
            h.update(chunk);
        }
        size += n as u64;
    }

    Ok(FileHash {
        size,
        md5: md5.map(|h| format!("{:x}", h.finalize())).unwrap_or_default(),
        sha1: sha1.map(|h| format!("{:x}", h.finalize())).unwrap_or_default(),
        sha256: sha256
            .map(|h| format!("{:x}", h.finalize()))
            .unwrap_or_default(),
    })
}

/// Async wrapper; whole-file hashing is CPU-bound so it runs on the blocking
/// pool.
pub async fn hash_file(path: &Path, algos: Algorithms) -> Result<FileHash> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_sync(&path, algos))
        .await
        .map_err(|e| {
            crate::error::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("hashing task aborted: {e}"),
            ))
        })?
}

/// Check a file against an expected hash. Size is compared first as the cheap
/// reject, then SHA-256; MD5/SHA-1 are compared only when the expectation
/// carries them.
pub async fn verify_file(path: &Path, expected: &FileHash) -> Result<bool> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(_) => return Ok(false),
    };
    if meta.len() != expected.size {
        return Ok(false);
    }

    let algos = Algorithms {
        md5: !expected.md5.is_empty(),
        sha1: !expected.sha1.is_empty(),
        sha256: true,
    };
    let actual = hash_file(path, algos).await?;

    if !actual.sha256.eq_ignore_ascii_case(&expected.sha256) {
        return Ok(false);
    }
    if !expected.md5.is_empty() && !actual.md5.eq_ignore_ascii_case(&expected.md5) {
        return Ok(false);
    }
    if !expected.sha1.is_empty() && !actual.sha1.eq_ignore_ascii_case(&expected.sha1) {
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn known_digests() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let hash = hash_file_sync(file.path(), Algorithms::ALL).unwrap();
        assert_eq!(hash.size, 11);
        assert_eq!(hash.md5, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(hash.sha1, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
        assert_eq!(
            hash.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn subset_skips_unrequested() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let hash = hash_file_sync(file.path(), Algorithms::SHA256_ONLY).unwrap();
        assert!(hash.md5.is_empty());
        assert!(hash.sha1.is_empty());
        assert_eq!(
            hash.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn rereading_is_deterministic() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 100_000]).unwrap();

        let a = hash_file_sync(file.path(), Algorithms::ALL).unwrap();
        let b = hash_file_sync(file.path(), Algorithms::ALL).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn verify_rejects_wrong_size() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let mut expected = hash_file(file.path(), Algorithms::ALL).await.unwrap();
        expected.size += 1;
        assert!(!verify_file(file.path(), &expected).await.unwrap());
    }

    #[tokio::test]
    async fn verify_accepts_matching_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"payload bytes").unwrap();

        let expected = hash_file(file.path(), Algorithms::ALL).await.unwrap();
        assert!(verify_file(file.path(), &expected).await.unwrap());
    }

    #[tokio::test]
    async fn verify_missing_file_is_false_not_error() {
        let expected = FileHash {
            size: 1,
            md5: String::new(),
            sha1: String::new(),
            sha256: "00".into(),
        };
        let missing = std::path::Path::new("/nonexistent/quarry/file");
        assert!(!verify_file(missing, &expected).await.unwrap());
    }
}
