//! Content-integrity check for downloaded files.

use crate::error::{ClientError, ClientResult};
use log::warn;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

/// Check a server etag (`algorithm:checksum`) against a saved file.
///
/// Only sha256 etags can be verified; an etag with any other algorithm is
/// reported as unverified rather than trusted.
pub fn verify_etag(etag: &str, path: &Path) -> ClientResult<bool> {
    let Some((algorithm, expected)) = etag.split_once(':') else {
        return Err(ClientError::Api(format!("malformed etag {etag}")));
    };
    if !algorithm.eq_ignore_ascii_case("sha256") {
        warn!("cannot verify etag with algorithm {algorithm}");
        return Ok(false);
    }

    let mut file = File::open(path)
        .map_err(|err| ClientError::Api(format!("open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|err| ClientError::Api(format!("read {}: {err}", path.display())))?;

    Ok(hex::encode(hasher.finalize()).eq_ignore_ascii_case(expected.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn sha256_etag(data: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(data)))
    }

    #[test]
    fn matching_sha256_etag_verifies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1-doc.gz.gpg");
        fs::write(&path, b"ciphertext bytes").unwrap();

        assert!(verify_etag(&sha256_etag(b"ciphertext bytes"), &path).unwrap());
    }

    #[test]
    fn tampered_file_fails_verification() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1-doc.gz.gpg");
        fs::write(&path, b"ciphertext bytes, modified").unwrap();

        assert!(!verify_etag(&sha256_etag(b"ciphertext bytes"), &path).unwrap());
    }

    #[test]
    fn unknown_algorithm_is_unverified_not_trusted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1-doc.gz.gpg");
        fs::write(&path, b"ciphertext bytes").unwrap();

        assert!(!verify_etag("md5:abcdef", &path).unwrap());
    }

    #[test]
    fn etag_without_algorithm_prefix_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1-doc.gz.gpg");
        fs::write(&path, b"ciphertext bytes").unwrap();

        assert!(verify_etag("deadbeef", &path).is_err());
    }
}
