//! Persistence for the overlay's state objects.
//!
//! A node with a home directory stores identities and the planet as
//! whole files there; a node with an empty home keeps one in-memory slot
//! per object type instead. Reads return nothing for absent objects and
//! for objects larger than the caller's limit.

use crate::overlay::StateObject;
use rustc_hash::FxHashMap;
use std::io;
use std::path::PathBuf;

#[derive(Debug)]
pub(crate) struct StateStore {
    home: Option<PathBuf>,
    memory: FxHashMap<StateObject, Vec<u8>>,
}

impl StateStore {
    /// Opens the store, creating the home directory if necessary. An
    /// empty home selects the in-memory mode.
    pub fn open(home: &str) -> io::Result<Self> {
        let home = if home.is_empty() {
            None
        } else {
            let path = PathBuf::from(home);
            std::fs::create_dir_all(&path)?;
            Some(path)
        };
        Ok(Self {
            home,
            memory: FxHashMap::default(),
        })
    }

    /// Stores an object, replacing any previous value whole. Object types
    /// without a file name are not persisted to disk.
    pub fn put(&mut self, object: StateObject, data: &[u8]) {
        match (&self.home, object.file_name()) {
            (Some(home), Some(name)) => {
                let path = home.join(name);
                if let Err(error) = std::fs::write(&path, data) {
                    tracing::warn!(%error, object = ?object, "failed to persist state object");
                    return;
                }
                #[cfg(unix)]
                if object == StateObject::IdentitySecret {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(
                        &path,
                        std::fs::Permissions::from_mode(0o600),
                    );
                }
            }
            (Some(_), None) => {}
            (None, _) => {
                // Replacing the slot drops the previous value.
                self.memory.insert(object, data.to_vec());
            }
        }
    }

    /// Reads an object back, or `None` if it is absent or exceeds
    /// `limit` bytes.
    pub fn get(&self, object: StateObject, limit: usize) -> Option<Vec<u8>> {
        match (&self.home, object.file_name()) {
            (Some(home), Some(name)) => {
                let data = std::fs::read(home.join(name)).ok()?;
                (data.len() <= limit).then_some(data)
            }
            (Some(_), None) => None,
            (None, _) => {
                let data = self.memory.get(&object)?;
                (data.len() <= limit).then(|| data.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_mode_round_trips() {
        let mut store = StateStore::open("").unwrap();
        assert_eq!(store.get(StateObject::IdentityPublic, 1024), None);
        store.put(StateObject::IdentityPublic, b"abc");
        assert_eq!(
            store.get(StateObject::IdentityPublic, 1024),
            Some(b"abc".to_vec())
        );
        // Replacement is whole, not appended.
        store.put(StateObject::IdentityPublic, b"d");
        assert_eq!(
            store.get(StateObject::IdentityPublic, 1024),
            Some(b"d".to_vec())
        );
    }

    #[test]
    fn memory_mode_keeps_unpersisted_types() {
        let mut store = StateStore::open("").unwrap();
        store.put(StateObject::Peer, b"peer blob");
        assert_eq!(store.get(StateObject::Peer, 1024), Some(b"peer blob".to_vec()));
    }

    #[test]
    fn oversize_reads_return_nothing() {
        let mut store = StateStore::open("").unwrap();
        store.put(StateObject::Planet, &[0u8; 100]);
        assert_eq!(store.get(StateObject::Planet, 99), None);
        assert!(store.get(StateObject::Planet, 100).is_some());
    }

    #[test]
    fn file_mode_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().to_str().unwrap();
        {
            let mut store = StateStore::open(home).unwrap();
            store.put(StateObject::IdentitySecret, b"node:secret");
            store.put(StateObject::Peer, b"never written");
        }
        // A fresh store over the same home sees the files.
        let store = StateStore::open(home).unwrap();
        assert_eq!(
            store.get(StateObject::IdentitySecret, 1024),
            Some(b"node:secret".to_vec())
        );
        assert_eq!(store.get(StateObject::Peer, 1024), None);
        assert_eq!(store.get(StateObject::Planet, 1024), None);
        assert!(dir.path().join("identity.secret").is_file());
        assert!(!dir.path().join("planet").exists());
    }

    #[cfg(unix)]
    #[test]
    fn secret_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path().to_str().unwrap()).unwrap();
        store.put(StateObject::IdentitySecret, b"node:secret");
        let mode = std::fs::metadata(dir.path().join("identity.secret"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
