//! On-disk avatar files.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data_dir>/avatar.png                 local avatar
//! <data_dir>/avatars/<stable-id>.png    one per peer
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use peerline_protocol::constants::{PEER_AVATAR_DIR, SELF_AVATAR_FILE};

use crate::error::AvatarError;

/// Plain-file avatar storage rooted at a data directory.
#[derive(Debug, Clone)]
pub struct AvatarStore {
    data_dir: PathBuf,
}

impl AvatarStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn self_path(&self) -> PathBuf {
        self.data_dir.join(SELF_AVATAR_FILE)
    }

    pub fn peers_dir(&self) -> PathBuf {
        self.data_dir.join(PEER_AVATAR_DIR)
    }

    /// Path of a peer's cached avatar. The stable id must be a plain
    /// alphanumeric token (a public key in hex).
    pub fn peer_path(&self, stable_id: &str) -> Result<PathBuf, AvatarError> {
        if stable_id.is_empty() || !stable_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AvatarError::InvalidStableId(stable_id.to_string()));
        }
        Ok(self.peers_dir().join(format!("{stable_id}.png")))
    }

    pub fn read_self(&self) -> Result<Option<Vec<u8>>, AvatarError> {
        Ok(read_optional(&self.self_path())?)
    }

    pub fn write_self(&self, data: &[u8]) -> Result<PathBuf, AvatarError> {
        let path = self.self_path();
        atomic_write(&path, data)?;
        Ok(path)
    }

    /// Deletes the local avatar. Returns whether a file existed.
    pub fn remove_self(&self) -> Result<bool, AvatarError> {
        Ok(remove_optional(&self.self_path())?)
    }

    pub fn read_peer(&self, stable_id: &str) -> Result<Option<Vec<u8>>, AvatarError> {
        Ok(read_optional(&self.peer_path(stable_id)?)?)
    }

    pub fn write_peer(&self, stable_id: &str, data: &[u8]) -> Result<PathBuf, AvatarError> {
        let path = self.peer_path(stable_id)?;
        atomic_write(&path, data)?;
        Ok(path)
    }

    pub fn remove_peer(&self, stable_id: &str) -> Result<bool, AvatarError> {
        Ok(remove_optional(&self.peer_path(stable_id)?)?)
    }
}

fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_optional(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "avatar file removed");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Writes `data` to a sibling temp file, then renames it over `path`.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("png.tmp");

    std::fs::write(&tmp_path, data).map_err(|e| {
        error!(path = %tmp_path.display(), error = %e, "failed to write temp avatar file");
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "failed to rename temp avatar file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn self_avatar_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = AvatarStore::new(dir.path());

        assert!(store.read_self().unwrap().is_none());
        let path = store.write_self(b"png-bytes").unwrap();
        assert_eq!(path, dir.path().join("avatar.png"));
        assert_eq!(store.read_self().unwrap().unwrap(), b"png-bytes");

        assert!(store.remove_self().unwrap());
        assert!(!store.remove_self().unwrap());
        assert!(store.read_self().unwrap().is_none());
    }

    #[test]
    fn peer_avatar_lives_under_avatars_dir() {
        let dir = TempDir::new().unwrap();
        let store = AvatarStore::new(dir.path());

        let path = store.write_peer("ABCDEF0123", b"x").unwrap();
        assert_eq!(path, dir.path().join("avatars").join("ABCDEF0123.png"));
        assert_eq!(store.read_peer("ABCDEF0123").unwrap().unwrap(), b"x");
        assert!(store.remove_peer("ABCDEF0123").unwrap());
        assert!(store.read_peer("ABCDEF0123").unwrap().is_none());
    }

    #[test]
    fn overwrite_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = AvatarStore::new(dir.path());
        store.write_peer("AA", b"first").unwrap();
        store.write_peer("AA", b"second").unwrap();

        assert_eq!(store.read_peer("AA").unwrap().unwrap(), b"second");
        let names: Vec<_> = std::fs::read_dir(store.peers_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["AA.png".to_string()]);
    }

    #[test]
    fn rejects_path_like_stable_ids() {
        let dir = TempDir::new().unwrap();
        let store = AvatarStore::new(dir.path());
        for bad in ["", "../escape", "a/b", "with space"] {
            assert!(matches!(
                store.peer_path(bad),
                Err(AvatarError::InvalidStableId(_))
            ));
        }
    }
}
