//! Write-once keypair storage backed by a JSON file

use libp2p::identity::Keypair;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// File name of the identity inside the data directory
pub const IDENTITY_FILE: &str = "identity.json";

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Corrupt identity file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("Identity I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// On-disk representation: protobuf-encoded private key, hex encoded
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    priv_key: String,
}

/// Path of the identity file for a data directory
pub fn identity_path(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join(IDENTITY_FILE)
}

/// Load the identity stored in `dir`, or generate and persist a new one
pub fn load_or_create(dir: impl AsRef<Path>) -> Result<Keypair, IdentityError> {
    let dir = dir.as_ref();
    let path = identity_path(dir);

    if path.exists() {
        let keypair = load(&path)?;
        debug!("Loaded identity from {}", path.display());
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    let encoded = keypair
        .to_protobuf_encoding()
        .map_err(|e| IdentityError::Io {
            path: path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
    let file = IdentityFile {
        priv_key: hex::encode(encoded),
    };
    let raw = serde_json::to_vec_pretty(&file).map_err(|e| IdentityError::Io {
        path: path.clone(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })?;

    fs::create_dir_all(dir).map_err(|source| IdentityError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    write_private(&path, &raw).map_err(|source| IdentityError::Io {
        path: path.clone(),
        source,
    })?;

    info!("Generated new peer identity at {}", path.display());
    Ok(keypair)
}

fn load(path: &Path) -> Result<Keypair, IdentityError> {
    let data = fs::read(path).map_err(|source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let corrupt = |reason: String| IdentityError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let file: IdentityFile =
        serde_json::from_slice(&data).map_err(|e| corrupt(e.to_string()))?;
    let bytes = hex::decode(file.priv_key.trim()).map_err(|e| corrupt(e.to_string()))?;
    Keypair::from_protobuf_encoding(&bytes).map_err(|e| corrupt(e.to_string()))
}

/// Create the file exclusively, readable by the owner only
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;
    use tempfile::tempdir;

    #[test]
    fn test_identity_stable_across_loads() {
        let dir = tempdir().unwrap();

        let first = load_or_create(dir.path()).unwrap();
        let second = load_or_create(dir.path()).unwrap();

        assert_eq!(
            PeerId::from(first.public()),
            PeerId::from(second.public())
        );
    }

    #[test]
    fn test_creates_missing_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        load_or_create(&nested).unwrap();

        assert!(identity_path(&nested).is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_file_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        load_or_create(dir.path()).unwrap();

        let mode = fs::metadata(identity_path(dir.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_json_not_overwritten() {
        let dir = tempdir().unwrap();
        let path = identity_path(dir.path());
        fs::write(&path, b"{\"priv_key\": \"0801").unwrap();

        let result = load_or_create(dir.path());
        assert!(matches!(result, Err(IdentityError::Corrupt { .. })));
        assert_eq!(fs::read(&path).unwrap(), b"{\"priv_key\": \"0801");
    }

    #[test]
    fn test_invalid_key_bytes() {
        let dir = tempdir().unwrap();
        let path = identity_path(dir.path());
        fs::write(&path, br#"{"priv_key": "zz-not-hex"}"#).unwrap();
        assert!(matches!(
            load_or_create(dir.path()),
            Err(IdentityError::Corrupt { .. })
        ));

        fs::write(&path, br#"{"priv_key": "deadbeef"}"#).unwrap();
        assert!(matches!(
            load_or_create(dir.path()),
            Err(IdentityError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_truncated_key() {
        let dir = tempdir().unwrap();
        let keypair = load_or_create(dir.path()).unwrap();
        let encoded = hex::encode(keypair.to_protobuf_encoding().unwrap());
        let truncated = format!(r#"{{"priv_key": "{}"}}"#, &encoded[..encoded.len() / 2]);

        let path = identity_path(dir.path());
        fs::remove_file(&path).unwrap();
        fs::write(&path, truncated.as_bytes()).unwrap();

        assert!(matches!(
            load_or_create(dir.path()),
            Err(IdentityError::Corrupt { .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), truncated.as_bytes());
    }
}
