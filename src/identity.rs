// Node identity: a long-lived Ed25519 keypair persisted on disk.
//
// The key file is a PEM block typed `ED25519 PRIVATE KEY` whose body is the
// base64 of the raw 32-byte seed. The 64-byte seed+public encoding is also
// accepted and normalized back to the seed on load. The derived peer id is
// the identity used everywhere else in the crate.

use crate::error::{BibError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use libp2p::identity::Keypair;
use libp2p::PeerId;
use std::fs;
use std::path::{Path, PathBuf};

const PEM_TAG: &str = "ED25519 PRIVATE KEY";
const PEM_BEGIN: &str = "-----BEGIN ED25519 PRIVATE KEY-----";
const PEM_END: &str = "-----END ED25519 PRIVATE KEY-----";

/// The node's persistent identity.
#[derive(Debug)]
pub struct Identity {
    signing_key: SigningKey,
    keypair: Keypair,
    peer_id: PeerId,
    path: PathBuf,
}

impl Identity {
    /// Load the identity at `key_path` (default `<config_dir>/identity.pem`),
    /// generating and persisting a fresh one if the file does not exist.
    pub fn load_or_generate(key_path: Option<&Path>, config_dir: &Path) -> Result<Self> {
        let path = match key_path {
            Some(p) => p.to_path_buf(),
            None => config_dir.join("identity.pem"),
        };

        match Self::load(&path) {
            Ok(identity) => Ok(identity),
            Err(BibError::NotFound(_)) => {
                let identity = Self::generate(&path)?;
                tracing::info!(peer_id = %identity.peer_id, path = %path.display(), "Generated node identity");
                Ok(identity)
            }
            Err(e) => Err(e),
        }
    }

    /// Load an existing identity, failing with `NotFound` if absent.
    pub fn load(path: &Path) -> Result<Self> {
        let pem = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BibError::NotFound(format!(
                    "identity key {}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let seed = decode_pem(&pem)?;
        Self::from_seed(seed, path.to_path_buf())
    }

    fn generate(path: &Path) -> Result<Self> {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let seed = signing_key.to_bytes();

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
            set_mode(dir, 0o700)?;
        }
        fs::write(path, encode_pem(&seed))?;
        set_mode(path, 0o600)?;

        Self::from_seed(seed, path.to_path_buf())
    }

    fn from_seed(seed: [u8; 32], path: PathBuf) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(&seed);
        let keypair = Keypair::ed25519_from_bytes(seed)
            .map_err(|e| BibError::InvalidInput(format!("identity key: {e}")))?;
        let peer_id = keypair.public().to_peer_id();
        Ok(Self {
            signing_key,
            keypair,
            peer_id,
            path,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The libp2p keypair driving transport security and gossip signing.
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Raw 32-byte seed.
    pub fn raw(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    pub fn key_path(&self) -> &Path {
        &self.path
    }
}

fn encode_pem(seed: &[u8; 32]) -> String {
    let body = BASE64.encode(seed);
    let mut out = String::with_capacity(body.len() + 80);
    out.push_str(PEM_BEGIN);
    out.push('\n');
    for chunk in body.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        out.push('\n');
    }
    out.push_str(PEM_END);
    out.push('\n');
    out
}

fn decode_pem(pem: &str) -> Result<[u8; 32]> {
    let mut body = String::new();
    let mut in_block = false;
    let mut seen_end = false;
    for line in pem.lines() {
        let line = line.trim();
        if line == PEM_BEGIN {
            in_block = true;
        } else if line == PEM_END {
            seen_end = true;
            break;
        } else if in_block {
            body.push_str(line);
        }
    }
    if !in_block || !seen_end {
        return Err(BibError::InvalidInput(format!(
            "not a PEM block of type {PEM_TAG}"
        )));
    }

    let bytes = BASE64
        .decode(body.as_bytes())
        .map_err(|e| BibError::InvalidInput(format!("identity key base64: {e}")))?;

    match bytes.len() {
        // Seed-only encoding.
        32 => Ok(bytes.try_into().expect("length checked")),
        // Seed followed by the public key; keep the seed half.
        64 => Ok(bytes[..32].try_into().expect("length checked")),
        n => Err(BibError::InvalidInput(format!(
            "identity key must be 32 or 64 bytes, got {n}"
        ))),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perm = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perm)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_generate_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = Identity::load_or_generate(None, dir.path()).unwrap();
        let second = Identity::load_or_generate(None, dir.path()).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.raw(), second.raw());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::load_or_generate(None, dir.path()).unwrap();
        let mode = fs::metadata(identity.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_full_encoding_normalizes_to_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.pem");

        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let mut full = Vec::with_capacity(64);
        full.extend_from_slice(&signing_key.to_bytes());
        full.extend_from_slice(signing_key.verifying_key().as_bytes());

        let body = BASE64.encode(&full);
        fs::write(&path, format!("{PEM_BEGIN}\n{body}\n{PEM_END}\n")).unwrap();

        let identity = Identity::load(&path).unwrap();
        assert_eq!(identity.raw(), signing_key.to_bytes());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Identity::load(&dir.path().join("identity.pem")).unwrap_err();
        assert!(matches!(err, BibError::NotFound(_)));
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.pem");

        fs::write(&path, "not a pem file").unwrap();
        assert!(matches!(
            Identity::load(&path).unwrap_err(),
            BibError::InvalidInput(_)
        ));

        let body = BASE64.encode([0u8; 16]);
        fs::write(&path, format!("{PEM_BEGIN}\n{body}\n{PEM_END}\n")).unwrap();
        assert!(matches!(
            Identity::load(&path).unwrap_err(),
            BibError::InvalidInput(_)
        ));
    }
}
