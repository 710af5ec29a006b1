//! Content-addressed package archives.
//!
//! A package is a gzipped POSIX tar stream with a `manifest.yaml` at its
//! root. File modes are preserved verbatim. The detached signature lives in
//! a `<archive>.sig` sidecar holding the raw 64-byte Ed25519 signature over
//! the archive's SHA-256 digest.

use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use ed25519_dalek::VerifyingKey;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::identity;
use crate::manifest::{Manifest, MANIFEST_FILE};

/// Maximum accepted archive size (1 GiB).
pub const MAX_PACKAGE_SIZE: u64 = 1024 * 1024 * 1024;

/// Create `<parent>/<name>-<version>.tar.gz` from an application directory.
///
/// The manifest is validated before anything is written; the archive is
/// produced in a temporary file and atomically renamed into place.
///
/// # Errors
///
/// Fails with [`Error::InvalidManifest`] for a missing or invalid manifest
/// and with I/O errors for filesystem trouble.
pub fn pack(app_dir: &Path) -> Result<PathBuf> {
    let manifest_data = fs::read(app_dir.join(MANIFEST_FILE)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::InvalidManifest(format!("no {MANIFEST_FILE} in {}", app_dir.display()))
        } else {
            Error::Io(e)
        }
    })?;
    let manifest = Manifest::from_yaml(&manifest_data)?;

    let parent = app_dir.parent().unwrap_or_else(|| Path::new("."));
    let out_path = parent.join(format!("{}-{}.tar.gz", manifest.name, manifest.version));

    let tmp = NamedTempFile::new_in(parent)?;
    let encoder = GzEncoder::new(tmp, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);
    builder.append_dir_all("", app_dir)?;

    let encoder = builder.into_inner()?;
    let tmp = encoder.finish()?;
    tmp.persist(&out_path).map_err(|e| Error::Io(e.error))?;

    Ok(out_path)
}

/// Extract an archive into `dest`, creating parents and preserving modes.
///
/// The archive must contain a parseable `manifest.yaml` at its root; on a
/// missing or invalid manifest the partially extracted tree is removed
/// best-effort and [`Error::InvalidManifest`] is returned.
///
/// # Errors
///
/// Returns [`Error::InvalidPackage`] for unreadable or empty archives.
pub fn unpack(archive: &Path, dest: &Path) -> Result<Manifest> {
    let file = fs::File::open(archive).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(format!("package {}", archive.display()))
        } else {
            Error::Io(e)
        }
    })?;
    if file.metadata()?.len() == 0 {
        return Err(Error::InvalidPackage("empty archive".into()));
    }

    fs::create_dir_all(dest)?;

    let decoder = GzDecoder::new(BufReader::new(file));
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(dest)
        .map_err(|e| Error::InvalidPackage(e.to_string()))?;

    let manifest_path = dest.join(MANIFEST_FILE);
    let manifest_data = match fs::read(&manifest_path) {
        Ok(data) => data,
        Err(_) => {
            let _ = fs::remove_dir_all(dest);
            return Err(Error::InvalidManifest(format!(
                "archive has no root {MANIFEST_FILE}"
            )));
        }
    };
    match Manifest::from_yaml(&manifest_data) {
        Ok(manifest) => Ok(manifest),
        Err(e) => {
            let _ = fs::remove_dir_all(dest);
            Err(e)
        }
    }
}

/// Read and parse `manifest.yaml` from an archive without extracting
/// anything else.
///
/// # Errors
///
/// Returns [`Error::InvalidManifest`] when the archive carries no root
/// manifest and [`Error::InvalidPackage`] when the archive is unreadable.
pub fn manifest_from_archive(archive: &Path) -> Result<Manifest> {
    let file = fs::File::open(archive)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let mut tar = tar::Archive::new(decoder);

    for entry in tar
        .entries()
        .map_err(|e| Error::InvalidPackage(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| Error::InvalidPackage(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| Error::InvalidPackage(e.to_string()))?;
        if path == Path::new(MANIFEST_FILE) {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Manifest::from_yaml(&data);
        }
    }

    Err(Error::InvalidManifest(format!(
        "archive has no root {MANIFEST_FILE}"
    )))
}

/// SHA-256 checksum of an archive, hex-encoded.
///
/// # Errors
///
/// Fails when the archive cannot be read.
pub fn checksum(archive: &Path) -> Result<String> {
    Ok(hex::encode(identity::hash_file(archive)?))
}

/// Verify the detached signature of an archive against a trust set.
///
/// `signature = None` passes only when `require_signed` is false; otherwise
/// it is [`Error::PackageNotSigned`]. A present signature must verify
/// against at least one trusted key or the result is
/// [`Error::InvalidSignature`].
///
/// # Errors
///
/// Also fails when the archive cannot be read.
pub fn verify(
    archive: &Path,
    signature: Option<&[u8]>,
    trusted: &[VerifyingKey],
    require_signed: bool,
) -> Result<()> {
    let Some(signature) = signature else {
        if require_signed {
            return Err(Error::PackageNotSigned);
        }
        return Ok(());
    };

    let digest = identity::hash_file(archive)?;
    if identity::verify_digest_any(trusted, &digest, signature) {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}
