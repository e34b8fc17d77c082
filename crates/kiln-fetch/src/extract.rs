//! Archive staging.
//!
//! An archive artifact is hash-verified like any other file, then unpacked
//! into `{version_dir}/.stage/`.  Every manifest artifact found in the stage
//! re-verifies against its own digest before anything moves; only then do the
//! staged files rename over their final locations.  All functions here are
//! synchronous and run inside `spawn_blocking`.

use flate2::read::GzDecoder;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use tar::Archive;
use tracing::debug;

use kiln_types::{Artifact, CoreError};

use crate::fetcher::sha256_hex_file;

/// Unpack `archive_path` into `stage` according to `format`.
pub(crate) fn extract_archive(
    archive_path: &Path,
    format: &str,
    stage: &Path,
) -> Result<(), CoreError> {
    fs::create_dir_all(stage).map_err(|e| CoreError::from_io("creating stage dir", &e))?;
    let bytes =
        fs::read(archive_path).map_err(|e| CoreError::from_io("reading archive", &e))?;
    match format {
        "zip" => extract_zip(&bytes, stage),
        "tar.gz" | "tgz" => extract_tar_gz(&bytes, stage),
        other => Err(CoreError::invalid_manifest(format!(
            "unsupported archive format '{other}'"
        ))),
    }
}

/// Re-verify staged artifacts and rename them over their final locations.
///
/// Verification of every entry completes before the first rename so a digest
/// mismatch leaves the version directory untouched.
pub(crate) fn promote_staged(
    stage: &Path,
    version_dir: &Path,
    expected: &[Artifact],
) -> Result<(), CoreError> {
    let staged: Vec<&Artifact> = expected
        .iter()
        .filter(|a| stage.join(&a.path).is_file())
        .collect();

    for artifact in &staged {
        let staged_path = stage.join(&artifact.path);
        let digest = sha256_hex_file(&staged_path)
            .map_err(|e| CoreError::from_io("hashing staged artifact", &e))?;
        if digest != artifact.sha256 {
            return Err(CoreError::verify_failed(
                &artifact.name,
                &artifact.sha256,
                digest,
            ));
        }
    }

    for artifact in &staged {
        let staged_path = stage.join(&artifact.path);
        let final_path = version_dir.join(&artifact.path);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CoreError::from_io("creating artifact directory", &e))?;
        }
        debug!(artifact = %artifact.name, "promoting staged artifact");
        fs::rename(&staged_path, &final_path)
            .map_err(|e| CoreError::from_io("promoting staged artifact", &e))?;
    }

    fs::remove_dir_all(stage).map_err(|e| CoreError::from_io("removing stage dir", &e))?;
    Ok(())
}

fn extract_zip(bytes: &[u8], dest: &Path) -> Result<(), CoreError> {
    let cursor = Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| CoreError::invalid_manifest(format!("corrupt zip archive: {e}")))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| CoreError::invalid_manifest(format!("corrupt zip entry: {e}")))?;
        // Entries escaping the destination are silently skipped.
        let Some(rel_path) = file.enclosed_name() else {
            continue;
        };
        let dest_path = dest.join(rel_path);

        if file.is_dir() {
            fs::create_dir_all(&dest_path)
                .map_err(|e| CoreError::from_io("creating extracted dir", &e))?;
        } else {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| CoreError::from_io("creating extracted dir", &e))?;
            }
            let mut out = fs::File::create(&dest_path)
                .map_err(|e| CoreError::from_io("creating extracted file", &e))?;
            std::io::copy(&mut file, &mut out)
                .map_err(|e| CoreError::from_io("writing extracted file", &e))?;
        }
    }
    Ok(())
}

fn extract_tar_gz(bytes: &[u8], dest: &Path) -> Result<(), CoreError> {
    let tar_gz = GzDecoder::new(Cursor::new(bytes));
    let mut archive = Archive::new(tar_gz);
    archive
        .unpack(dest)
        .map_err(|e| CoreError::from_io("unpacking tar.gz", &e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::io::Write;

    fn artifact(name: &str, path: &str, content: &[u8]) -> Artifact {
        let digest = Sha256::digest(content);
        let digest = crate::fetcher::hex_encode(&digest[..]);
        serde_json::from_value(serde_json::json!({
            "name": name,
            "role": "model",
            "format": "bin",
            "path": path,
            "size": content.len(),
            "sha256": digest,
        }))
        .unwrap()
    }

    fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn zip_extracts_into_stage() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pack.zip");
        fs::write(&archive, make_zip(&[("model.bin", b"weights"), ("vocab.txt", b"a b c")]))
            .unwrap();
        let stage = dir.path().join(".stage");

        extract_archive(&archive, "zip", &stage).unwrap();
        assert_eq!(fs::read(stage.join("model.bin")).unwrap(), b"weights");
        assert_eq!(fs::read(stage.join("vocab.txt")).unwrap(), b"a b c");
    }

    #[test]
    fn promote_verifies_then_moves() {
        let dir = tempfile::tempdir().unwrap();
        let stage = dir.path().join(".stage");
        fs::create_dir_all(&stage).unwrap();
        fs::write(stage.join("model.bin"), b"weights").unwrap();

        let expected = vec![artifact("model.bin", "model.bin", b"weights")];
        promote_staged(&stage, dir.path(), &expected).unwrap();

        assert_eq!(fs::read(dir.path().join("model.bin")).unwrap(), b"weights");
        assert!(!stage.exists());
    }

    #[test]
    fn promote_rejects_digest_mismatch_without_moving() {
        let dir = tempfile::tempdir().unwrap();
        let stage = dir.path().join(".stage");
        fs::create_dir_all(&stage).unwrap();
        fs::write(stage.join("model.bin"), b"corrupted").unwrap();

        let expected = vec![artifact("model.bin", "model.bin", b"weights")];
        let err = promote_staged(&stage, dir.path(), &expected).unwrap_err();
        assert_eq!(err.code, kiln_types::ErrorCode::ModelVerifyFailed);
        assert!(!dir.path().join("model.bin").exists());
        assert!(stage.join("model.bin").exists());
    }

    #[test]
    fn unsupported_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pack.rar");
        fs::write(&archive, b"junk").unwrap();
        let err = extract_archive(&archive, "rar", &dir.path().join(".stage")).unwrap_err();
        assert_eq!(err.code, kiln_types::ErrorCode::InvalidModelFormat);
    }
}
