//! Signing keys, the daemon trust set and the pre-shared network key.
//!
//! Signing is Ed25519 over the SHA-256 digest of the payload. Private key
//! files are written with mode 0600, public keys with 0644. The PSK is 32
//! random bytes stored hex-encoded.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _};
pub use ed25519_dalek::VerifyingKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Size of an Ed25519 public key file in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a private key file (seed plus public half) in bytes.
pub const KEYPAIR_SIZE: usize = 64;

/// Size of a detached signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of the pre-shared network key in bytes.
pub const PSK_SIZE: usize = 32;

/// An Ed25519 signing identity.
#[derive(Clone)]
pub struct Signer {
    signing_key: SigningKey,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish()
    }
}

impl Signer {
    /// Generate a fresh keypair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct a signer from a 64-byte keypair file payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the slice is not exactly 64
    /// bytes or the key halves are inconsistent.
    pub fn from_keypair_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; KEYPAIR_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidInput("invalid key size".into()))?;
        let signing_key = SigningKey::from_keypair_bytes(bytes)
            .map_err(|_| Error::InvalidInput("invalid key size".into()))?;
        Ok(Self { signing_key })
    }

    /// Load a signer from a private key file.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotFound`] when the file does not exist and
    /// [`Error::InvalidInput`] when its size is wrong.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("key file {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        Self::from_keypair_bytes(&data)
    }

    /// Persist the keypair as `<dir>/<prefix>.key` (0600) and
    /// `<dir>/<prefix>.pub` (0644).
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the directory cannot be created or either
    /// file cannot be written.
    pub fn save(&self, dir: &Path, prefix: &str) -> Result<()> {
        fs::create_dir_all(dir)?;

        let key_path = dir.join(format!("{prefix}.key"));
        let mut key_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&key_path)?;
        key_file.write_all(&self.signing_key.to_keypair_bytes())?;
        key_file.sync_all()?;

        let pub_path = dir.join(format!("{prefix}.pub"));
        let mut pub_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&pub_path)?;
        pub_file.write_all(&self.public_key_bytes())?;
        pub_file.sync_all()?;

        Ok(())
    }

    /// Load `<dir>/<prefix>.key`, generating and persisting a new keypair if
    /// it does not exist yet.
    ///
    /// # Errors
    ///
    /// Propagates load and save failures.
    pub fn load_or_generate(dir: &Path, prefix: &str) -> Result<Self> {
        let key_path = dir.join(format!("{prefix}.key"));
        if key_path.exists() {
            return Self::load(&key_path);
        }
        let signer = Self::generate();
        signer.save(dir, prefix)?;
        Ok(signer)
    }

    /// Public key bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Verifying half of the keypair.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign arbitrary bytes: SHA-256 first, then Ed25519 over the digest.
    #[must_use]
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        let digest = Sha256::digest(data);
        self.signing_key.sign(&digest).to_bytes()
    }

    /// Sign a file's SHA-256 digest.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read.
    pub fn sign_file(&self, path: &Path) -> Result<Vec<u8>> {
        let digest = hash_file(path)?;
        Ok(self.signing_key.sign(&digest).to_bytes().to_vec())
    }
}

/// Verify a signature over a precomputed SHA-256 digest.
///
/// Returns a pure boolean; callers turn `false` into their own error.
#[must_use]
pub fn verify_digest(key: &VerifyingKey, digest: &[u8; 32], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(digest, &signature).is_ok()
}

/// Verify a signature over a digest against every key of a trust set.
#[must_use]
pub fn verify_digest_any(keys: &[VerifyingKey], digest: &[u8; 32], signature: &[u8]) -> bool {
    keys.iter().any(|key| verify_digest(key, digest, signature))
}

/// Verify a detached signature over a file's SHA-256 digest.
///
/// # Errors
///
/// Fails when the file cannot be read; an invalid signature is reported as
/// `Ok(false)`.
pub fn verify_file(path: &Path, signature: &[u8], key: &VerifyingKey) -> Result<bool> {
    let digest = hash_file(path)?;
    Ok(verify_digest(key, &digest, signature))
}

/// SHA-256 of a file's contents.
///
/// # Errors
///
/// Fails when the file cannot be opened or read.
pub fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Parse a 32-byte public key file payload.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for any size other than 32 bytes or a
/// point that is not on the curve.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey> {
    let bytes: &[u8; PUBLIC_KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| Error::InvalidInput("invalid key size".into()))?;
    VerifyingKey::from_bytes(bytes).map_err(|_| Error::InvalidInput("invalid key size".into()))
}

/// Load every `.pub` file in a directory as a trusted verification key.
///
/// A missing directory yields an empty trust set; a malformed key file is a
/// hard error so a typo never silently shrinks the trust set.
///
/// # Errors
///
/// Fails on unreadable files or keys of the wrong size.
pub fn load_trusted_keys(dir: &Path) -> Result<Vec<VerifyingKey>> {
    let mut keys = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
        Err(e) => return Err(Error::Io(e)),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "pub") {
            let data = fs::read(&path)?;
            let key = public_key_from_bytes(&data).map_err(|_| {
                Error::InvalidInput(format!("invalid key size: {}", path.display()))
            })?;
            keys.push(key);
        }
    }
    Ok(keys)
}

/// Generate a fresh 32-byte pre-shared key.
#[must_use]
pub fn generate_psk() -> [u8; PSK_SIZE] {
    let mut psk = [0u8; PSK_SIZE];
    OsRng.fill_bytes(&mut psk);
    psk
}

/// Hex-encode a PSK.
#[must_use]
pub fn encode_psk(psk: &[u8; PSK_SIZE]) -> String {
    hex::encode(psk)
}

/// Decode a hex-encoded PSK.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] on malformed hex or a length other than
/// 32 bytes.
pub fn decode_psk(encoded: &str) -> Result<[u8; PSK_SIZE]> {
    let bytes = hex::decode(encoded.trim())
        .map_err(|e| Error::InvalidInput(format!("invalid PSK hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidInput("invalid PSK size".into()))
}

/// Save a PSK hex-encoded with mode 0600.
///
/// # Errors
///
/// Fails when the parent directory cannot be created or the file written.
pub fn save_psk(psk: &[u8; PSK_SIZE], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(encode_psk(psk).as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Load a hex-encoded PSK from a file.
///
/// # Errors
///
/// Fails with [`Error::NotFound`] for a missing file and
/// [`Error::InvalidInput`] for malformed contents.
pub fn load_psk(path: &Path) -> Result<[u8; PSK_SIZE]> {
    let data = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(format!("PSK file {}", path.display()))
        } else {
            Error::Io(e)
        }
    })?;
    decode_psk(&data)
}

/// Sidecar path of the detached signature for an archive.
#[must_use]
pub fn signature_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".sig");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let signer = Signer::generate();
        let data = b"payload bytes";
        let sig = signer.sign(data);

        let digest: [u8; 32] = Sha256::digest(data).into();
        assert!(verify_digest(&signer.verifying_key(), &digest, &sig));

        // A different message must not verify.
        let other: [u8; 32] = Sha256::digest(b"other").into();
        assert!(!verify_digest(&signer.verifying_key(), &other, &sig));
    }

    #[test]
    fn any_key_of_the_trust_set_suffices() {
        let outsider = Signer::generate();
        let member = Signer::generate();
        let keys = vec![outsider.verifying_key(), member.verifying_key()];

        let digest: [u8; 32] = Sha256::digest(b"archive").into();
        let sig = member.sign(b"archive");
        assert!(verify_digest_any(&keys, &digest, &sig));

        let stranger = Signer::generate();
        let sig = stranger.sign(b"archive");
        assert!(!verify_digest_any(&keys, &digest, &sig));
    }

    #[test]
    fn file_signature_detects_bit_flip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.bin");
        fs::write(&path, b"archive contents").unwrap();

        let signer = Signer::generate();
        let sig = signer.sign_file(&path).unwrap();
        assert_eq!(sig.len(), SIGNATURE_SIZE);
        assert!(verify_file(&path, &sig, &signer.verifying_key()).unwrap());

        // Flip one byte.
        let mut data = fs::read(&path).unwrap();
        data[3] ^= 0x01;
        fs::write(&path, data).unwrap();
        assert!(!verify_file(&path, &sig, &signer.verifying_key()).unwrap());
    }

    #[test]
    fn save_sets_file_modes() {
        let dir = TempDir::new().unwrap();
        let signer = Signer::generate();
        signer.save(dir.path(), "controller").unwrap();

        let key_mode = fs::metadata(dir.path().join("controller.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o777, 0o600);

        let pub_mode = fs::metadata(dir.path().join("controller.pub"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(pub_mode & 0o777, 0o644);
    }

    #[test]
    fn load_or_generate_is_stable() {
        let dir = TempDir::new().unwrap();
        let first = Signer::load_or_generate(dir.path(), "controller").unwrap();
        let second = Signer::load_or_generate(dir.path(), "controller").unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
    }

    #[test]
    fn truncated_key_file_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.key");
        fs::write(&path, [0u8; 12]).unwrap();
        match Signer::load(&path) {
            Err(Error::InvalidInput(msg)) => assert!(msg.contains("invalid key size")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn trusted_keys_loaded_from_directory() {
        let dir = TempDir::new().unwrap();
        let a = Signer::generate();
        let b = Signer::generate();
        fs::write(dir.path().join("a.pub"), a.public_key_bytes()).unwrap();
        fs::write(dir.path().join("b.pub"), b.public_key_bytes()).unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let keys = load_trusted_keys(dir.path()).unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn oversized_trusted_key_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bad.pub"), [0u8; 33]).unwrap();
        match load_trusted_keys(dir.path()) {
            Err(Error::InvalidInput(msg)) => assert!(msg.contains("invalid key size")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_trust_dir_is_empty_set() {
        let dir = TempDir::new().unwrap();
        let keys = load_trusted_keys(&dir.path().join("nope")).unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn psk_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("psk");
        let psk = generate_psk();
        save_psk(&psk, &path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read(&path).unwrap().len(), PSK_SIZE * 2);
        assert_eq!(load_psk(&path).unwrap(), psk);
    }

    #[test]
    fn short_psk_rejected() {
        assert!(matches!(
            decode_psk("deadbeef"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(decode_psk("zzzz"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn sidecar_naming() {
        assert_eq!(
            signature_path(Path::new("/tmp/app-1.0.0.tar.gz")),
            PathBuf::from("/tmp/app-1.0.0.tar.gz.sig")
        );
    }
}
