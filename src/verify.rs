// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Artifact integrity checks.
//!
//! These functions do blocking file I/O; async callers run them on
//! `spawn_blocking`.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::IntegrityError;
use crate::registry::ModelDescriptor;

/// Accepted deviation from the catalogue size when no hash is configured.
pub const SIZE_TOLERANCE_BYTES: u64 = 1024 * 1024;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Check the artifact at `path` against `descriptor`.
///
/// The size check always runs. The SHA-256 check runs only when the
/// descriptor carries a digest, and then any mismatch fails.
pub fn verify(path: &Path, descriptor: &ModelDescriptor) -> Result<(), IntegrityError> {
    let actual = file_size(path)?;
    let expected = descriptor.size_bytes;

    if actual.abs_diff(expected) > SIZE_TOLERANCE_BYTES {
        return Err(IntegrityError::SizeMismatch { expected, actual });
    }

    if let Some(expected_digest) = &descriptor.sha256 {
        let actual_digest = sha256_file(path).map_err(|e| IntegrityError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !actual_digest.eq_ignore_ascii_case(expected_digest) {
            return Err(IntegrityError::HashMismatch {
                expected: expected_digest.clone(),
                actual: actual_digest,
            });
        }
    }

    tracing::debug!(model = %descriptor.id, bytes = actual, "artifact verified");
    Ok(())
}

/// Cheap availability check: present and within the size tolerance.
///
/// An undersized file counts as absent. The hash is left to [`verify`].
pub fn quick_check(path: &Path, descriptor: &ModelDescriptor) -> bool {
    match file_size(path) {
        Ok(actual) => actual.abs_diff(descriptor.size_bytes) <= SIZE_TOLERANCE_BYTES,
        Err(_) => false,
    }
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn file_size(path: &Path) -> Result<u64, IntegrityError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(IntegrityError::Unreadable {
            path: path.to_path_buf(),
            reason: "not a regular file".to_string(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(IntegrityError::Missing { path: path.to_path_buf() })
        }
        Err(e) => Err(IntegrityError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const MIB: u64 = 1024 * 1024;

    fn descriptor(size: u64) -> ModelDescriptor {
        ModelDescriptor::new("m", "M", "https://example.com/m.gguf", "m.gguf", size)
    }

    fn sparse_file(dir: &TempDir, len: u64) -> std::path::PathBuf {
        let path = dir.path().join("m.gguf");
        let file = File::create(&path).unwrap();
        file.set_len(len).unwrap();
        path
    }

    #[test]
    fn test_size_tolerance_boundary() {
        let dir = TempDir::new().unwrap();
        let expected = 10 * MIB;

        let within = sparse_file(&dir, expected - MIB);
        assert_eq!(verify(&within, &descriptor(expected)), Ok(()));

        let over = sparse_file(&dir, expected + MIB);
        assert_eq!(verify(&over, &descriptor(expected)), Ok(()));

        let short = sparse_file(&dir, expected - MIB - 1);
        assert_eq!(
            verify(&short, &descriptor(expected)),
            Err(IntegrityError::SizeMismatch { expected, actual: expected - MIB - 1 })
        );
        assert!(!quick_check(&short, &descriptor(expected)));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.gguf");
        assert!(matches!(verify(&path, &descriptor(5)), Err(IntegrityError::Missing { .. })));
        assert!(!quick_check(&path, &descriptor(5)));
    }

    #[test]
    fn test_hash_match_and_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(sha256_file(&path).unwrap(), HELLO_SHA256);

        let good = descriptor(5).with_sha256(HELLO_SHA256.to_ascii_uppercase());
        assert_eq!(verify(&path, &good), Ok(()));

        let bad = descriptor(5).with_sha256("0".repeat(64));
        match verify(&path, &bad) {
            Err(IntegrityError::HashMismatch { actual, .. }) => assert_eq!(actual, HELLO_SHA256),
            other => panic!("expected hash mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_hash_mismatch_is_hard_even_within_tolerance() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, b"hellp").unwrap();

        let descriptor = descriptor(5).with_sha256(HELLO_SHA256);
        assert!(quick_check(&path, &descriptor));
        assert!(matches!(verify(&path, &descriptor), Err(IntegrityError::HashMismatch { .. })));
    }

    #[test]
    fn test_directory_is_unreadable() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            verify(dir.path(), &descriptor(5)),
            Err(IntegrityError::Unreadable { .. })
        ));
    }
}
